//! Owned request/response head objects and their wire form.
//!
//! The engine only inspects heads to choose a content codec; everything
//! else is application business. Parsing is httparse-backed and returns
//! `Ok(None)` while the head is still incomplete, which the connection
//! state machine treats as "keep reading".

use crate::error::ProtocolError;
use crate::version::Version;

/// Note httparse requires we preallocate an array of this size so be wise
pub const MAX_HEADERS_NUM: usize = 256;
/// This one is not preallocated, but a larger buffer is of limited use
/// because of the previous parameter.
pub const MAX_HEADERS_SIZE: usize = 16384;

/// A single header line, name and raw value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: Version,
    headers: Vec<Header>,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub code: u16,
    pub reason: String,
    headers: Vec<Header>,
}

fn owned_headers(raw: &[httparse::Header]) -> Vec<Header> {
    raw.iter().map(|h| Header {
        name: h.name.to_string(),
        value: h.value.to_vec(),
    }).collect()
}

fn put_headers(headers: &[Header], out: &mut Vec<u8>) {
    for h in headers {
        out.extend_from_slice(h.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(&h.value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

impl RequestHead {
    pub fn new<M, U>(method: M, uri: U) -> RequestHead
        where M: Into<String>, U: Into<String>,
    {
        RequestHead {
            method: method.into(),
            uri: uri.into(),
            version: Version::Http11,
            headers: Vec::new(),
        }
    }

    pub fn add_header<N, V>(&mut self, name: N, value: V) -> &mut Self
        where N: Into<String>, V: Into<Vec<u8>>,
    {
        self.headers.push(Header { name: name.into(), value: value.into() });
        self
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First header with the given name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value[..])
    }

    /// Try to parse a request head from the start of `buf`.
    ///
    /// Returns the head and the number of bytes it occupied (including
    /// the final empty line), or `None` when more input is needed.
    pub fn parse(buf: &[u8])
        -> Result<Option<(RequestHead, usize)>, ProtocolError>
    {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
        let mut raw = httparse::Request::new(&mut headers);
        match raw.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let head = RequestHead {
                    // fields are always present on Complete
                    method: raw.method.unwrap_or("").to_string(),
                    uri: raw.path.unwrap_or("").to_string(),
                    version: if raw.version == Some(1) {
                        Version::Http11
                    } else {
                        Version::Http10
                    },
                    headers: owned_headers(raw.headers),
                };
                Ok(Some((head, len)))
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEADERS_SIZE {
                    Err(ProtocolError::HeadersTooLarge)
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(ProtocolError::BadHeaders(e)),
        }
    }

    /// Format the request line and headers into the output buffer
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.uri.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        put_headers(&self.headers, out);
    }
}

impl ResponseHead {
    pub fn new(code: u16, reason: &str) -> ResponseHead {
        ResponseHead {
            version: Version::Http11,
            code,
            reason: reason.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn add_header<N, V>(&mut self, name: N, value: V) -> &mut Self
        where N: Into<String>, V: Into<Vec<u8>>,
    {
        self.headers.push(Header { name: name.into(), value: value.into() });
        self
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value[..])
    }

    pub fn parse(buf: &[u8])
        -> Result<Option<(ResponseHead, usize)>, ProtocolError>
    {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
        let mut raw = httparse::Response::new(&mut headers);
        match raw.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let head = ResponseHead {
                    version: if raw.version == Some(1) {
                        Version::Http11
                    } else {
                        Version::Http10
                    },
                    code: raw.code.unwrap_or(0),
                    reason: raw.reason.unwrap_or("").to_string(),
                    headers: owned_headers(raw.headers),
                };
                Ok(Some((head, len)))
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEADERS_SIZE {
                    Err(ProtocolError::HeadersTooLarge)
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(ProtocolError::BadHeaders(e)),
        }
    }

    /// Format the status line and headers into the output buffer
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.push(b' ');
        let code = [
            b'0' + (self.code / 100 % 10) as u8,
            b'0' + (self.code / 10 % 10) as u8,
            b'0' + (self.code % 10) as u8,
        ];
        out.extend_from_slice(&code);
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        put_headers(&self.headers, out);
    }
}
