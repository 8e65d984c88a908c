use super::{syslog, Origin, Pulled, RawPayload, Transport, TransportKind};
use crate::error::{DecodeError, PipelineError};
use crate::stats::IngestStats;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 65_535;

type Datagram = Result<RawPayload, (RawPayload, DecodeError)>;

pub struct SyslogListener {
    rx: mpsc::Receiver<Datagram>,
    local_addr: SocketAddr,
    stats: Arc<IngestStats>,
    task: JoinHandle<()>,
}

impl SyslogListener {
    pub async fn bind(
        addr: &str,
        queue: usize,
        stats: Arc<IngestStats>,
        cancel: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let socket = UdpSocket::bind(addr).await.map_err(PipelineError::Input)?;
        let local_addr = socket.local_addr().map_err(PipelineError::Input)?;
        let (tx, rx) = mpsc::channel(queue.max(1));

        tracing::debug!(bind = %local_addr, queue, "syslog socket bound");
        let task = tokio::spawn(run_socket(socket, tx, stats.clone(), cancel));

        Ok(Self {
            rx,
            local_addr,
            stats,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for SyslogListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Transport for SyslogListener {
    fn kind(&self) -> TransportKind {
        TransportKind::Listener
    }

    async fn pull(&mut self) -> Result<Pulled, PipelineError> {
        let Some(item) = self.rx.recv().await else {
            // Only after the socket task has stopped, i.e. on shutdown.
            return Ok(Pulled::End);
        };
        Ok(self.dequeued(item))
    }

    fn try_pull(&mut self) -> Option<Pulled> {
        let item = self.rx.try_recv().ok()?;
        Some(self.dequeued(item))
    }
}

impl SyslogListener {
    fn dequeued(&self, item: Datagram) -> Pulled {
        self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
        match item {
            Ok(payload) => Pulled::Payload(payload),
            Err((raw, error)) => Pulled::Malformed { raw, error },
        }
    }
}

async fn run_socket(
    socket: UdpSocket,
    tx: mpsc::Sender<Datagram>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("syslog listener stopping");
                break;
            }
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(err) => {
                    tracing::warn!(error=%err, "syslog receive failed");
                    continue;
                }
            },
        };

        let datagram = &buf[..len];
        let origin = Origin::Peer(peer);
        let item = match syslog::decode(datagram).and_then(|record| record.require_message()) {
            Ok(message) => Ok(RawPayload::new(message.as_bytes(), origin)),
            Err(error) => Err((RawPayload::new(datagram, origin), error)),
        };

        // Counted before the send so the receiver never sees it go negative.
        let queue_depth = stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        match tx.try_send(item) {
            Ok(()) => {
                tracing::trace!(queue_depth, %peer, "queued datagram");
            }
            Err(TrySendError::Full(_)) => {
                stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                IngestStats::incr(&stats.dropped_datagrams);
                tracing::warn!(%peer, "ingest queue full; dropping datagram");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
