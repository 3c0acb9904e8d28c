//! Message body framing, i.e. the RFC7230 body length algorithm:
//! <http://httpwg.github.io/specs/rfc7230.html#message.body.length>
//!
//! The result of the scan is what the connection state machine uses to
//! pick a content codec.

use std::str::from_utf8;

use crate::error::ProtocolError;
use crate::headers;
use crate::message::{Header, RequestHead, ResponseHead};

/// The body kind of an HTTP message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BodyKind {
    /// A fixed body length set by the `Content-Length` header.
    /// Messages without a body have the value `Fixed(0)`.
    Fixed(u64),
    /// A chunked body set by `Transfer-Encoding: chunked`.
    Chunked,
    /// The body is read until the connection is closed.
    ///
    /// Only valid for responses.
    Eof,
}

/// Framing declared by a message head: the body kind found in the
/// headers (if any) and whether the peer asked to close the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Framing {
    pub kind: Option<BodyKind>,
    pub close: bool,
}

/// Scan the framing-relevant headers once.
///
/// A message declaring both `Content-Length` and `Transfer-Encoding`
/// smells like request smuggling, so it is rejected outright instead of
/// letting one header win.
pub fn scan(hdrs: &[Header]) -> Result<Framing, ProtocolError> {
    let mut kind = None;
    let mut close = false;
    for h in hdrs {
        if headers::is_transfer_encoding(&h.name) {
            if matches!(kind, Some(BodyKind::Fixed(_))) {
                return Err(ProtocolError::ConflictingFraming);
            }
            let last = h.value.split(|&x| x == b',').last();
            match last {
                Some(enc) if headers::is_chunked(enc) => {
                    kind = Some(BodyKind::Chunked);
                }
                _ => return Err(ProtocolError::UnsupportedTransferEncoding),
            }
        } else if headers::is_content_length(&h.name) {
            match kind {
                Some(BodyKind::Fixed(_)) => {
                    return Err(ProtocolError::DuplicateContentLength);
                }
                Some(BodyKind::Chunked) => {
                    return Err(ProtocolError::ConflictingFraming);
                }
                _ => {}
            }
            let s = from_utf8(&h.value)
                .map_err(|_| ProtocolError::BadContentLength)?;
            let len = s.trim().parse::<u64>()
                .map_err(|_| ProtocolError::BadContentLength)?;
            kind = Some(BodyKind::Fixed(len));
        } else if headers::is_connection(&h.name) {
            if h.value.split(|&x| x == b',').any(headers::is_close) {
                close = true;
            }
        }
    }
    Ok(Framing { kind, close })
}

impl BodyKind {
    /// Body kind of a request. A request without framing headers has
    /// no body; requests are never read until end of stream.
    pub fn for_request(head: &RequestHead) -> Result<Framing, ProtocolError> {
        let mut f = scan(head.headers())?;
        if f.kind.is_none() {
            f.kind = Some(BodyKind::Fixed(0));
        }
        Ok(f)
    }

    /// Body kind of a response. `to_head` marks a response to a HEAD
    /// request, which never carries a body whatever its headers say.
    pub fn for_response(head: &ResponseHead, to_head: bool)
        -> Result<Framing, ProtocolError>
    {
        let mut f = scan(head.headers())?;
        let code = head.code;
        if to_head || (code >= 100 && code < 200)
            || code == 204 || code == 304
        {
            f.kind = Some(BodyKind::Fixed(0));
        } else if f.kind.is_none() {
            f.kind = Some(BodyKind::Eof);
        }
        Ok(f)
    }
}
