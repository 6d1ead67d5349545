//! RTSP message model and wire canonicalization.
//!
//! Sealed requests end in CRLF, carry a mandatory `CSeq`, and bodies are
//! preceded by `Content-Length` and `Content-Type: text/parameters`.

use miracle_shared::{parse, CoreError, ErrorKind, GreedyBuf};

pub const CODE_OK: u32 = 200;

const RTSP_VERSION: &str = "RTSP/1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request { method: String, uri: String },
    Reply { code: u32, phrase: String },
    Data { channel: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    cseq: Option<u64>,
    raw: Option<String>,
}

fn default_phrase(code: u32) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        406 => "Not Acceptable",
        455 => "Method Not Valid in This State",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

impl Message {
    pub fn request(method: &str, uri: &str) -> Self {
        Self {
            kind: MessageKind::Request {
                method: method.to_string(),
                uri: uri.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
            cseq: None,
            raw: None,
        }
    }

    pub fn reply(code: u32, phrase: Option<&str>) -> Self {
        Self {
            kind: MessageKind::Reply {
                code,
                phrase: phrase.unwrap_or(default_phrase(code)).to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
            cseq: None,
            raw: None,
        }
    }

    pub fn data(channel: u8, payload: &[u8]) -> Self {
        Self {
            kind: MessageKind::Data { channel },
            headers: Vec::new(),
            body: payload.to_vec(),
            cseq: None,
            raw: None,
        }
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request { .. })
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageKind::Reply { .. })
    }

    /// Whether this is a reply with the given status code.
    pub fn is_reply_code(&self, code: u32) -> bool {
        matches!(&self.kind, MessageKind::Reply { code: c, .. } if *c == code)
    }

    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Request { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Request { uri, .. } => Some(uri),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<u32> {
        match &self.kind {
            MessageKind::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn phrase(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Reply { phrase, .. } => Some(phrase),
            _ => None,
        }
    }

    pub fn cseq(&self) -> Option<u64> {
        self.cseq
    }

    pub fn set_cseq(&mut self, cseq: u64) {
        self.cseq = Some(cseq);
        self.raw = None;
    }

    pub fn append_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
        self.raw = None;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_body(&mut self, body: &str) {
        self.body = body.as_bytes().to_vec();
        self.raw = None;
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Whether a `text/parameters` body carries `key`, either alone on a
    /// line or as `key: value`.
    pub fn body_has_param(&self, key: &str) -> bool {
        let Some(body) = self.body_str() else {
            return false;
        };
        body.lines().any(|line| {
            let line = line.trim_end_matches('\r');
            line == key
                || line
                    .strip_prefix(key)
                    .is_some_and(|rest| rest.trim_start().starts_with(':'))
        })
    }

    /// Value of a `key: value` line in the body.
    pub fn body_param(&self, key: &str) -> Option<&str> {
        self.body_str()?.lines().find_map(|line| {
            let line = line.trim_end_matches('\r');
            let rest = line.strip_prefix(key)?;
            let rest = rest.trim_start();
            let rest = rest.strip_prefix(':')?;
            Some(rest.trim())
        })
    }

    /// Sealed wire form, if sealed.
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    /// Canonicalize the message to its wire form. The CSeq must be
    /// assigned before sealing; bodies force `Content-Length` and
    /// `Content-Type: text/parameters`.
    pub fn seal(&mut self) -> Result<&str, CoreError> {
        let Some(cseq) = self.cseq else {
            return Err(CoreError::invalid_arg("sealing a message without CSeq"));
        };
        if matches!(self.kind, MessageKind::Data { .. }) {
            return Err(CoreError::invalid_arg("data messages have no text form"));
        }

        let mut buf = GreedyBuf::new();
        match &self.kind {
            MessageKind::Request { method, uri } => {
                buf.push(format!("{method} {uri} {RTSP_VERSION}\r\n").as_bytes());
            }
            MessageKind::Reply { code, phrase } => {
                buf.push(format!("{RTSP_VERSION} {code} {phrase}\r\n").as_bytes());
            }
            MessageKind::Data { .. } => unreachable!(),
        }
        buf.push(format!("CSeq: {cseq}\r\n").as_bytes());
        for (name, value) in &self.headers {
            buf.push(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.body.is_empty() {
            buf.push(b"Content-Type: text/parameters\r\n");
            buf.push(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.push(b"\r\n");
        buf.push(&self.body);

        let raw = String::from_utf8(buf.into_vec())
            .map_err(|_| CoreError::protocol("non-UTF8 message"))?;
        self.raw = Some(raw);
        Ok(self.raw.as_deref().unwrap_or_default())
    }

    /// Parse a sealed wire message.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let (head, rest) = text
            .split_once("\r\n")
            .ok_or_else(|| CoreError::protocol("missing start line"))?;

        let kind = if let Some(status) = head.strip_prefix(RTSP_VERSION) {
            let status = status.trim_start();
            let (code, phrase) = status
                .split_once(' ')
                .ok_or_else(|| CoreError::protocol("malformed status line"))?;
            MessageKind::Reply {
                code: parse::atoi_u32(code, 10)
                    .map_err(|_| CoreError::protocol("bad status code"))?,
                phrase: phrase.to_string(),
            }
        } else {
            let mut parts = head.split(' ');
            let method = parts
                .next()
                .filter(|m| !m.is_empty())
                .ok_or_else(|| CoreError::protocol("missing method"))?;
            let uri = parts
                .next()
                .ok_or_else(|| CoreError::protocol("missing uri"))?;
            match parts.next() {
                Some(RTSP_VERSION) => {}
                _ => return Err(CoreError::protocol("bad protocol version")),
            }
            MessageKind::Request {
                method: method.to_string(),
                uri: uri.to_string(),
            }
        };

        let mut msg = Self {
            kind,
            headers: Vec::new(),
            body: Vec::new(),
            cseq: None,
            raw: None,
        };

        let mut content_length = 0usize;
        let mut pos = 0usize;
        let lines = rest;
        loop {
            let Some(eol) = lines[pos..].find("\r\n") else {
                return Err(CoreError::protocol("unterminated header section"));
            };
            let line = &lines[pos..pos + eol];
            pos += eol + 2;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CoreError::protocol("malformed header"))?;
            let value = value.trim();
            if name.eq_ignore_ascii_case("CSeq") {
                msg.cseq = Some(
                    parse::atoi_u64(value, 10).map_err(|_| CoreError::protocol("bad CSeq"))?,
                );
            } else if name.eq_ignore_ascii_case("Content-Length") {
                content_length = parse::atoi_u64(value, 10)
                    .map_err(|_| CoreError::protocol("bad Content-Length"))?
                    as usize;
            } else if name.eq_ignore_ascii_case("Content-Type") {
                // implied text/parameters; kept out of the header list
            } else {
                msg.headers.push((name.to_string(), value.to_string()));
            }
        }

        if msg.cseq.is_none() {
            return Err(CoreError::new(ErrorKind::Protocol, "message without CSeq"));
        }

        let body = &lines[pos..];
        if body.len() < content_length {
            return Err(CoreError::protocol("truncated body"));
        }
        msg.body = body.as_bytes()[..content_length].to_vec();
        msg.raw = Some(text.to_string());
        Ok(msg)
    }
}
