use super::{Origin, Pulled, RawPayload, Transport, TransportKind};
use crate::error::PipelineError;
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};

pub struct StreamTransport<R> {
    reader: R,
    line: u64,
    buf: Vec<u8>,
}

impl StreamTransport<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> StreamTransport<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: Vec::with_capacity(256),
        }
    }
}

#[async_trait]
impl<R> Transport for StreamTransport<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn pull(&mut self) -> Result<Pulled, PipelineError> {
        // read_until keeps partial input in `buf` if this future is dropped.
        loop {
            let read = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(PipelineError::Input)?;
            if read == 0 && self.buf.is_empty() {
                return Ok(Pulled::End);
            }
            self.line += 1;

            let mut end = self.buf.len();
            while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
                end -= 1;
            }
            let line = &self.buf[..end];
            if line.iter().all(u8::is_ascii_whitespace) {
                tracing::trace!(line = self.line, "skipping blank line");
                self.buf.clear();
                continue;
            }
            let payload = RawPayload::new(line, Origin::Line(self.line));
            self.buf.clear();
            return Ok(Pulled::Payload(payload));
        }
    }
}
