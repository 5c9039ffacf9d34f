//! STOMP 1.2 frame codec.
//!
//! ```text
//! COMMAND EOL
//! *( header EOL )
//! EOL
//! *OCTET NUL
//! *( EOL )
//! ```
//!
//! Header values are escaped (`\\`, `\n`, `\r`, `\c`) in every frame except
//! CONNECT and CONNECTED. A lone EOL between frames is a heart-beat.

use crate::{PanelError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn escapes_headers(&self) -> bool {
        self.command != "CONNECT" && self.command != "CONNECTED"
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Decodes one frame from the start of `buf`.
    ///
    /// Returns the frame (or `None` for a heart-beat) and the number of bytes
    /// consumed.
    pub fn decode(buf: &[u8]) -> Result<(Option<Frame>, usize)> {
        let mut pos = skip_eols(buf, 0);
        if pos >= buf.len() {
            return Ok((None, buf.len()));
        }

        let (command, next) = read_line(buf, pos)?;
        pos = next;
        if command.is_empty() {
            return Err(malformed("empty command"));
        }

        let mut frame = Frame::new(command);
        let escape = frame.escapes_headers();
        loop {
            let (line, next) = read_line(buf, pos)?;
            pos = next;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| malformed(&format!("header without colon: {}", line)))?;
            if escape {
                frame.headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                frame.headers.push((name.to_string(), value.to_string()));
            }
        }

        let body_end = match frame.get("content-length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| malformed("invalid content-length"))?;
                let end = pos
                    .checked_add(len)
                    .ok_or_else(|| malformed("content-length out of range"))?;
                if end >= buf.len() || buf[end] != 0 {
                    return Err(malformed("body shorter than content-length"));
                }
                end
            }
            None => buf[pos..]
                .iter()
                .position(|b| *b == 0)
                .map(|i| pos + i)
                .ok_or_else(|| malformed("missing NUL terminator"))?,
        };
        frame.body = buf[pos..body_end].to_vec();

        let consumed = skip_eols(buf, body_end + 1);
        Ok((Some(frame), consumed))
    }

    /// Decodes every frame in `buf`, skipping heart-beats.
    pub fn decode_all(buf: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let (frame, consumed) = Frame::decode(&buf[pos..])?;
            if let Some(f) = frame {
                frames.push(f);
            }
            pos += consumed;
        }
        Ok(frames)
    }
}

fn malformed(msg: &str) -> PanelError {
    PanelError::TransportError(format!("STOMP frame: {}", msg))
}

fn skip_eols(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() {
        match buf[pos] {
            b'\n' => pos += 1,
            b'\r' if buf.get(pos + 1) == Some(&b'\n') => pos += 2,
            _ => break,
        }
    }
    pos
}

fn read_line(buf: &[u8], pos: usize) -> Result<(String, usize)> {
    let nl = buf[pos..]
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| malformed("truncated frame"))?;
    let mut line = &buf[pos..pos + nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    let text = std::str::from_utf8(line).map_err(|_| malformed("header is not UTF-8"))?;
    Ok((text.to_string(), pos + nl + 1))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(malformed(&format!("invalid escape \\{}", other.unwrap_or(' '))));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_with_content_length_and_embedded_nul() {
        let body = b"{\"a\":\"\0\"}";
        let frame = Frame::new("MESSAGE")
            .header("subscription", "sub-1")
            .header("destination", "/topic/fila/7")
            .with_body(body.to_vec());
        let encoded = frame.encode();

        let (decoded, consumed) = Frame::decode(&encoded).unwrap();
        let decoded = decoded.unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.get("subscription"), Some("sub-1"));
        assert_eq!(decoded.body, body.to_vec());
    }

    #[test]
    fn header_escaping_applies_outside_connect() {
        let frame = Frame::new("SEND").header("note", "a:b\nc\\d");
        let encoded = String::from_utf8(frame.encode()).unwrap();
        assert!(encoded.contains("note:a\\cb\\nc\\\\d\n"));
        let (decoded, _) = Frame::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.unwrap().get("note"), Some("a:b\nc\\d"));

        let connect = Frame::new("CONNECT").header("Authorization", "Bearer a:b");
        let encoded = String::from_utf8(connect.encode()).unwrap();
        assert!(encoded.contains("Authorization:Bearer a:b\n"));
    }

    #[test]
    fn heartbeats_and_crlf_between_frames() {
        let raw = b"\n\r\nCONNECTED\r\nversion:1.2\r\nheart-beat:10000,10000\r\n\r\n\0\n\nMESSAGE\nsubscription:s\n\nhi\0";
        let frames = Frame::decode_all(raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, "CONNECTED");
        assert_eq!(frames[0].get("version"), Some("1.2"));
        assert_eq!(frames[1].body, b"hi".to_vec());

        let (none, consumed) = Frame::decode(b"\n").unwrap();
        assert!(none.is_none());
        assert_eq!(consumed, 1);
    }

    #[test]
    fn repeated_header_keeps_first_value() {
        let raw = b"MESSAGE\nfoo:1\nfoo:2\n\n\0";
        let (frame, _) = Frame::decode(raw).unwrap();
        assert_eq!(frame.unwrap().get("foo"), Some("1"));
    }

    #[test]
    fn rejects_truncated_and_bad_escapes() {
        assert!(Frame::decode(b"MESSAGE\nfoo:1\n\nbody").is_err());
        assert!(Frame::decode(b"MESSAGE\nfoo:\\t\n\n\0").is_err());
        assert!(Frame::decode(b"MESSAGE\ncontent-length:10\n\nab\0").is_err());
        assert!(Frame::decode(b"MESSAGE\ncontent-length:18446744073709551615\n\n\0").is_err());
        assert!(Frame::decode(b"MESSAGE\ncontent-length:99999999999999999999\n\n\0").is_err());
        assert!(Frame::decode(b"MESSAGE\ncontent-length:-1\n\n\0").is_err());
    }
}
