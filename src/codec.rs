//! Streaming content codecs.
//!
//! Each encoder/decoder instance is bound to exactly one message body
//! and is detached by the connection state machine the moment it
//! reports completion. Decoders consume from the connection's raw input
//! buffer and must never take bytes past their own body: whatever
//! follows belongs to the next pipelined message.

use std::cmp::min;

use crate::body::BodyKind;
use crate::error::ProtocolError;

/// Upper bound for a `<hex-size>[;extension]\r\n` chunk head and for a
/// single trailer line. Hostile input that never finishes a line is cut
/// off at this point instead of buffering forever.
pub const MAX_CHUNK_HEAD: usize = 16384;

/// Encodes one message body into wire framing.
pub trait ContentEncoder: Send {
    /// Frame a slice of body bytes into `out`. Returns how many bytes
    /// of `src` were accepted, which may be less than offered when the
    /// framing declares a shorter body.
    fn encode(&mut self, src: &[u8], out: &mut Vec<u8>)
        -> Result<usize, ProtocolError>;

    /// Declare the body finished, writing any terminator into `out`.
    /// Fails if fewer bytes were written than the framing declared.
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), ProtocolError>;

    fn is_complete(&self) -> bool;
}

/// Decodes one message body out of wire framing.
pub trait ContentDecoder: Send {
    /// Decode body bytes from the front of `src`, appending them to
    /// `dst`. Returns how many bytes of `src` were consumed. Consuming
    /// zero bytes means the decoder needs more input.
    fn decode(&mut self, src: &[u8], dst: &mut Vec<u8>)
        -> Result<usize, ProtocolError>;

    /// The peer closed the stream. For identity framing this is the
    /// regular end of the body; for everything else mid-body it is a
    /// protocol error.
    fn end_of_input(&mut self) -> Result<(), ProtocolError>;

    fn is_complete(&self) -> bool;
}

pub fn encoder_for(kind: BodyKind) -> Box<dyn ContentEncoder> {
    match kind {
        BodyKind::Fixed(len) => Box::new(LengthDelimitedEncoder::new(len)),
        BodyKind::Chunked => Box::new(ChunkEncoder::new()),
        BodyKind::Eof => Box::new(IdentityEncoder::new()),
    }
}

pub fn decoder_for(kind: BodyKind) -> Box<dyn ContentDecoder> {
    match kind {
        BodyKind::Fixed(len) => Box::new(LengthDelimitedDecoder::new(len)),
        BodyKind::Chunked => Box::new(ChunkDecoder::new()),
        BodyKind::Eof => Box::new(IdentityDecoder::new()),
    }
}

/// Pass-through framing, terminated only by closing the connection
pub struct IdentityEncoder {
    complete: bool,
}

impl IdentityEncoder {
    pub fn new() -> IdentityEncoder {
        IdentityEncoder { complete: false }
    }
}

impl ContentEncoder for IdentityEncoder {
    fn encode(&mut self, src: &[u8], out: &mut Vec<u8>)
        -> Result<usize, ProtocolError>
    {
        if self.complete {
            return Ok(0);
        }
        out.extend_from_slice(src);
        Ok(src.len())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        self.complete = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

pub struct IdentityDecoder {
    complete: bool,
}

impl IdentityDecoder {
    pub fn new() -> IdentityDecoder {
        IdentityDecoder { complete: false }
    }
}

impl ContentDecoder for IdentityDecoder {
    fn decode(&mut self, src: &[u8], dst: &mut Vec<u8>)
        -> Result<usize, ProtocolError>
    {
        // Bytes already buffered when the close arrives still belong
        // to this body, so completion does not stop the pass-through.
        dst.extend_from_slice(src);
        Ok(src.len())
    }

    fn end_of_input(&mut self) -> Result<(), ProtocolError> {
        self.complete = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Exact-byte framing declared by `Content-Length`
pub struct LengthDelimitedEncoder {
    remaining: u64,
}

impl LengthDelimitedEncoder {
    pub fn new(len: u64) -> LengthDelimitedEncoder {
        LengthDelimitedEncoder { remaining: len }
    }
}

impl ContentEncoder for LengthDelimitedEncoder {
    fn encode(&mut self, src: &[u8], out: &mut Vec<u8>)
        -> Result<usize, ProtocolError>
    {
        // Writing more than declared would corrupt the next pipelined
        // message, so the excess is refused rather than sent.
        let n = min(src.len() as u64, self.remaining) as usize;
        out.extend_from_slice(&src[..n]);
        self.remaining -= n as u64;
        Ok(n)
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        if self.remaining > 0 {
            return Err(ProtocolError::BodyLengthMismatch);
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

pub struct LengthDelimitedDecoder {
    remaining: u64,
}

impl LengthDelimitedDecoder {
    pub fn new(len: u64) -> LengthDelimitedDecoder {
        LengthDelimitedDecoder { remaining: len }
    }
}

impl ContentDecoder for LengthDelimitedDecoder {
    fn decode(&mut self, src: &[u8], dst: &mut Vec<u8>)
        -> Result<usize, ProtocolError>
    {
        let n = min(src.len() as u64, self.remaining) as usize;
        dst.extend_from_slice(&src[..n]);
        self.remaining -= n as u64;
        Ok(n)
    }

    fn end_of_input(&mut self) -> Result<(), ProtocolError> {
        if self.remaining > 0 {
            return Err(ProtocolError::PrematureEof);
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// `Transfer-Encoding: chunked` framing
pub struct ChunkEncoder {
    complete: bool,
}

impl ChunkEncoder {
    pub fn new() -> ChunkEncoder {
        ChunkEncoder { complete: false }
    }
}

impl ContentEncoder for ChunkEncoder {
    fn encode(&mut self, src: &[u8], out: &mut Vec<u8>)
        -> Result<usize, ProtocolError>
    {
        // An empty chunk is the terminator on the wire, only finish()
        // may emit it
        if self.complete || src.is_empty() {
            return Ok(0);
        }
        out.extend_from_slice(format!("{:x}\r\n", src.len()).as_bytes());
        out.extend_from_slice(src);
        out.extend_from_slice(b"\r\n");
        Ok(src.len())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        if !self.complete {
            out.extend_from_slice(b"0\r\n\r\n");
            self.complete = true;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[derive(Copy, Clone)]
enum ChunkState {
    /// Parsing a `<hex-size>[;ext]\r\n` line
    Head,
    /// Inside chunk data, bytes left in this chunk
    Data(u64),
    /// Expecting the CRLF that closes a chunk's data (bytes left of it)
    DataEnd(u8),
    /// Past the zero-size chunk, skipping trailer lines
    Trailer,
    Done,
}

pub struct ChunkDecoder {
    state: ChunkState,
}

impl ChunkDecoder {
    pub fn new() -> ChunkDecoder {
        ChunkDecoder { state: ChunkState::Head }
    }
}

impl ContentDecoder for ChunkDecoder {
    fn decode(&mut self, src: &[u8], dst: &mut Vec<u8>)
        -> Result<usize, ProtocolError>
    {
        let mut off = 0;
        loop {
            let rem = &src[off..];
            match self.state {
                ChunkState::Head => {
                    match httparse::parse_chunk_size(rem)? {
                        httparse::Status::Complete((head_len, size)) => {
                            off += head_len;
                            self.state = if size == 0 {
                                ChunkState::Trailer
                            } else {
                                ChunkState::Data(size)
                            };
                        }
                        httparse::Status::Partial => {
                            if rem.len() > MAX_CHUNK_HEAD {
                                return Err(ProtocolError::ChunkHeadTooLong);
                            }
                            return Ok(off);
                        }
                    }
                }
                ChunkState::Data(left) => {
                    if rem.is_empty() {
                        return Ok(off);
                    }
                    let n = min(rem.len() as u64, left) as usize;
                    dst.extend_from_slice(&rem[..n]);
                    off += n;
                    let left = left - n as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd(2)
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataEnd(mut need) => {
                    if rem.is_empty() {
                        return Ok(off);
                    }
                    for &c in rem.iter().take(need as usize) {
                        let want = if need == 2 { b'\r' } else { b'\n' };
                        if c != want {
                            return Err(ProtocolError::InvalidChunkSize(
                                httparse::InvalidChunkSize));
                        }
                        need -= 1;
                        off += 1;
                    }
                    self.state = if need == 0 {
                        ChunkState::Head
                    } else {
                        ChunkState::DataEnd(need)
                    };
                }
                ChunkState::Trailer => {
                    match rem.windows(2).position(|w| w == b"\r\n") {
                        Some(0) => {
                            off += 2;
                            self.state = ChunkState::Done;
                        }
                        Some(line_end) => {
                            // a trailer header line, discarded
                            off += line_end + 2;
                        }
                        None => {
                            if rem.len() > MAX_CHUNK_HEAD {
                                return Err(ProtocolError::TrailerTooLong);
                            }
                            return Ok(off);
                        }
                    }
                }
                ChunkState::Done => {
                    return Ok(off);
                }
            }
        }
    }

    fn end_of_input(&mut self) -> Result<(), ProtocolError> {
        if !matches!(self.state, ChunkState::Done) {
            return Err(ProtocolError::PrematureEof);
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }
}
