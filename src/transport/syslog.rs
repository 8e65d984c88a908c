use crate::error::DecodeError;

const NIL: &[u8] = b"-";
const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslogRecord<'a> {
    pub facility: u8,
    pub severity: u8,
    pub version: u16,
    pub timestamp: Option<&'a str>,
    pub hostname: Option<&'a str>,
    pub app_name: Option<&'a str>,
    pub proc_id: Option<&'a str>,
    pub msg_id: Option<&'a str>,
    pub structured_data: Option<&'a str>,
    pub message: Option<&'a str>,
}

impl<'a> SyslogRecord<'a> {
    pub fn require_message(&self) -> Result<&'a str, DecodeError> {
        self.message.ok_or(DecodeError::MissingMessage)
    }
}

pub fn decode(datagram: &[u8]) -> Result<SyslogRecord<'_>, DecodeError> {
    if datagram.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut cursor = Cursor { buf: datagram, pos: 0 };

    let priority = cursor.priority()?;
    let version = cursor.version()?;
    let timestamp = cursor.header_field("timestamp")?;
    let hostname = cursor.header_field("hostname")?;
    let app_name = cursor.header_field("app-name")?;
    let proc_id = cursor.header_field("procid")?;
    let msg_id = cursor.header_field("msgid")?;
    let structured_data = cursor.structured_data()?;
    let message = cursor.message()?;

    Ok(SyslogRecord {
        facility: priority >> 3,
        severity: priority & 0x07,
        version,
        timestamp,
        hostname,
        app_name,
        proc_id,
        msg_id,
        structured_data,
        message,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn priority(&mut self) -> Result<u8, DecodeError> {
        let rest = self.rest();
        if rest.first() != Some(&b'<') {
            return Err(DecodeError::InvalidPriority);
        }
        let close = rest
            .iter()
            .take(5)
            .position(|b| *b == b'>')
            .ok_or(DecodeError::InvalidPriority)?;
        let digits = &rest[1..close];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(DecodeError::InvalidPriority);
        }
        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .filter(|v| *v <= 191)
            .ok_or(DecodeError::InvalidPriority)?;
        self.pos += close + 1;
        Ok(value)
    }

    fn version(&mut self) -> Result<u16, DecodeError> {
        let token = self.token().ok_or(DecodeError::InvalidVersion)?;
        std::str::from_utf8(token)
            .ok()
            .filter(|s| !s.starts_with('0'))
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or(DecodeError::InvalidVersion)
    }

    fn header_field(&mut self, name: &'static str) -> Result<Option<&'a str>, DecodeError> {
        let token = self.token().ok_or(DecodeError::Truncated(name))?;
        if token == NIL {
            return Ok(None);
        }
        std::str::from_utf8(token)
            .map(Some)
            .map_err(|_| DecodeError::Truncated(name))
    }

    fn token(&mut self) -> Option<&'a [u8]> {
        let rest = self.rest();
        if rest.is_empty() {
            return None;
        }
        let len = rest.iter().position(|b| *b == b' ').unwrap_or(rest.len());
        if len == 0 {
            return None;
        }
        self.pos += len;
        if self.rest().first() == Some(&b' ') {
            self.pos += 1;
        }
        Some(&rest[..len])
    }

    fn structured_data(&mut self) -> Result<Option<&'a str>, DecodeError> {
        let rest = self.rest();
        match rest.first() {
            None => Err(DecodeError::Truncated("structured-data")),
            Some(b'-') => {
                self.pos += 1;
                Ok(None)
            }
            Some(b'[') => {
                let mut idx = 0;
                while rest.get(idx) == Some(&b'[') {
                    idx = element_end(rest, idx).ok_or(DecodeError::InvalidStructuredData)?;
                }
                self.pos += idx;
                std::str::from_utf8(&rest[..idx])
                    .map(Some)
                    .map_err(|_| DecodeError::InvalidStructuredData)
            }
            Some(_) => Err(DecodeError::InvalidStructuredData),
        }
    }

    fn message(&mut self) -> Result<Option<&'a str>, DecodeError> {
        let rest = self.rest();
        let body = match rest.first() {
            None => return Ok(None),
            Some(b' ') => &rest[1..],
            Some(_) => return Err(DecodeError::InvalidStructuredData),
        };
        let body = body.strip_prefix(BOM).unwrap_or(body);
        let text = std::str::from_utf8(body).map_err(|_| DecodeError::MessageNotUtf8)?;
        let text = text.trim_end();
        self.pos = self.buf.len();
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }
}

// Index just past the closing `]`.
fn element_end(buf: &[u8], start: usize) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (offset, byte) in buf[start + 1..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b']' if !in_quotes => return Some(start + 1 + offset + 1),
            _ => {}
        }
    }
    None
}
