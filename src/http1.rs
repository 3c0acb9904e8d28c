//! The per-connection HTTP/1.x message state machine.
//!
//! One [`Http1Connection`] sits on top of one session and drives both
//! directions of the protocol: it formats submitted message heads into
//! the output buffer, binds a content codec chosen by header
//! inspection, and resumes encoding/decoding from wherever the last
//! partial read or write left off. The instant a body completes its
//! codec and message are detached, which is what makes keep-alive and
//! pipelining reuse possible.

use std::io;
use std::mem;

use log::{debug, trace};

use crate::body::BodyKind;
use crate::codec::{decoder_for, encoder_for, ContentDecoder, ContentEncoder};
use crate::error::{HttpError, ProtocolError};
use crate::message::{RequestHead, ResponseHead};
use crate::session::{Channel, CloseMode, EventHandler, EventSet, IoSession,
                     SessionStatus};

const READ_CHUNK: usize = 8192;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Role {
    Client,
    Server,
}

/// Output side of the exchange
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum OutputState {
    /// No message submitted; head buffer may still hold tail bytes of
    /// the previous one
    Idle,
    /// Head formatted, encoder bound, body not yet driven
    Submitted,
    /// Body bytes are flowing through the encoder
    Encoding,
}

/// Per-connection transfer counters
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnMetrics {
    pub requests: u64,
    pub responses: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Lets a handler pull decoded body bytes out of the connection's
/// input buffer through the bound decoder
pub struct DecoderChannel<'a> {
    decoder: &'a mut dyn ContentDecoder,
    src: &'a mut Vec<u8>,
}

impl<'a> DecoderChannel<'a> {
    /// Decode whatever is buffered, appending to `dst`. Returns the
    /// number of body bytes produced; zero means more input is needed.
    pub fn read(&mut self, dst: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        let before = dst.len();
        let consumed = self.decoder.decode(self.src, dst)?;
        self.src.drain(..consumed);
        Ok(dst.len() - before)
    }

    pub fn is_complete(&self) -> bool {
        self.decoder.is_complete()
    }
}

/// Lets a handler push body bytes through the bound encoder into the
/// connection's output buffer
pub struct EncoderChannel<'a> {
    encoder: &'a mut dyn ContentEncoder,
    out: &'a mut Vec<u8>,
}

impl<'a> EncoderChannel<'a> {
    /// Frame body bytes into the output buffer. Returns how many bytes
    /// were accepted; a length-delimited encoder refuses excess.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        self.encoder.encode(data, self.out)
    }

    /// Declare the body complete, writing any terminator
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        self.encoder.finish(self.out)
    }

    pub fn is_complete(&self) -> bool {
        self.encoder.is_complete()
    }
}

/// The application side of a connection.
///
/// All callbacks run on the session's worker thread and must not
/// block; long work belongs in a command handed back to the session.
pub trait HttpHandler: Send {
    /// The transport is up; the first exchange may start
    fn connected(&mut self, _conn: &mut ConnState) {}

    /// Client side: the engine is ready for a request to be submitted
    fn request_ready(&mut self, _conn: &mut ConnState)
        -> Result<(), HttpError>
    {
        Ok(())
    }

    /// Server side: a request head arrived; its body (if any) follows
    /// through `input_ready`
    fn request_received(&mut self, _head: RequestHead, _conn: &mut ConnState)
        -> Result<(), HttpError>
    {
        Ok(())
    }

    /// Server side: the engine is ready for the response to be
    /// submitted
    fn response_ready(&mut self, _conn: &mut ConnState)
        -> Result<(), HttpError>
    {
        Ok(())
    }

    /// Client side: a response head arrived
    fn response_received(&mut self, _head: ResponseHead,
        _conn: &mut ConnState) -> Result<(), HttpError>
    {
        Ok(())
    }

    /// Decoded body bytes are available (or the body just completed)
    fn input_ready(&mut self, _conn: &mut ConnState,
        _decoder: &mut DecoderChannel) -> Result<(), HttpError>
    {
        Ok(())
    }

    /// The bound encoder can take more body bytes
    fn output_ready(&mut self, _conn: &mut ConnState,
        _encoder: &mut EncoderChannel) -> Result<(), HttpError>
    {
        Ok(())
    }

    /// The peer closed its end cleanly between messages
    fn end_of_input(&mut self, _conn: &mut ConnState) {}

    /// Session deadline expired; return `true` to keep the session
    fn timeout(&mut self, _conn: &mut ConnState) -> bool {
        false
    }

    fn exception(&mut self, _conn: &mut ConnState, _err: &HttpError) {}
}

/// Mutable per-connection record shared with handler callbacks
pub struct ConnState {
    role: Role,
    /// raw bytes read but not yet parsed or decoded
    inbuf: Vec<u8>,
    /// bytes formatted but not yet flushed to the socket
    outbuf: Vec<u8>,
    out_state: OutputState,
    encoder: Option<Box<dyn ContentEncoder>>,
    decoder: Option<Box<dyn ContentDecoder>>,
    /// client: HEAD-ness of requests awaiting their response
    sent_head: Vec<bool>,
    /// server: a request head arrived and no response was submitted
    response_due: bool,
    /// ask-the-handler guard so an idle turn asks only once
    ready_asked: bool,
    /// peer asked for `Connection: close` (or identity framing says so)
    peer_close: bool,
    /// close once the current exchange finishes flushing
    close_after_flush: bool,
    eof_seen: bool,
    metrics: ConnMetrics,
}

impl ConnState {
    fn new(role: Role) -> ConnState {
        ConnState {
            role,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            out_state: OutputState::Idle,
            encoder: None,
            decoder: None,
            sent_head: Vec::new(),
            response_due: false,
            ready_asked: false,
            peer_close: false,
            close_after_flush: false,
            eof_seen: false,
            metrics: ConnMetrics::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn metrics(&self) -> ConnMetrics {
        self.metrics
    }

    /// Bytes formatted but not yet flushed
    pub fn buffered_output(&self) -> usize {
        self.outbuf.len()
    }

    /// True when neither direction has a message in flight
    pub fn is_idle(&self) -> bool {
        self.out_state == OutputState::Idle
            && self.outbuf.is_empty()
            && self.decoder.is_none()
            && !self.response_due
    }

    /// Close the connection once everything buffered has flushed
    pub fn request_close(&mut self) {
        self.close_after_flush = true;
    }

    /// Submit a request on a client connection. The head is formatted
    /// into the output buffer immediately; a body encoder is bound
    /// according to the framing headers.
    pub fn submit_request(&mut self, head: RequestHead)
        -> Result<(), HttpError>
    {
        if self.role != Role::Client {
            return Err(HttpError::WrongSide);
        }
        if self.out_state != OutputState::Idle {
            return Err(HttpError::AlreadySubmitted);
        }
        let framing = BodyKind::for_request(&head)
            .map_err(HttpError::Protocol)?;
        let kind = framing.kind.unwrap_or(BodyKind::Fixed(0));
        self.sent_head.push(head.method.eq_ignore_ascii_case("HEAD"));
        head.encode(&mut self.outbuf);
        trace!("submitted request {} {}", head.method, head.uri);
        self.bind_encoder(kind);
        Ok(())
    }

    /// Submit a response on a server connection
    pub fn submit_response(&mut self, head: ResponseHead)
        -> Result<(), HttpError>
    {
        if self.role != Role::Server {
            return Err(HttpError::WrongSide);
        }
        if self.out_state != OutputState::Idle {
            return Err(HttpError::AlreadySubmitted);
        }
        let framing = BodyKind::for_response(&head, false)
            .map_err(HttpError::Protocol)?;
        let kind = framing.kind.unwrap_or(BodyKind::Fixed(0));
        head.encode(&mut self.outbuf);
        trace!("submitted response {}", head.code);
        self.response_due = false;
        // identity framing has no terminator, the close is the end
        if kind == BodyKind::Eof {
            self.close_after_flush = true;
        }
        self.bind_encoder(kind);
        Ok(())
    }

    /// The output side is occupied from here until the head (and body,
    /// if there is one) hits the wire
    fn bind_encoder(&mut self, kind: BodyKind) {
        if kind != BodyKind::Fixed(0) {
            self.encoder = Some(encoder_for(kind));
        }
        self.out_state = OutputState::Submitted;
    }

    fn finish_outgoing(&mut self) {
        self.encoder = None;
        self.out_state = OutputState::Idle;
        match self.role {
            Role::Client => self.metrics.requests += 1,
            Role::Server => self.metrics.responses += 1,
        }
        if self.peer_close {
            self.close_after_flush = true;
        }
    }

    fn finish_incoming(&mut self) {
        self.decoder = None;
        match self.role {
            Role::Client => {
                self.metrics.responses += 1;
                if self.peer_close {
                    self.close_after_flush = true;
                }
            }
            Role::Server => self.metrics.requests += 1,
        }
    }
}

/// An HTTP/1.x connection bound to a session and an application
/// handler
pub struct Http1Connection {
    state: ConnState,
    handler: Box<dyn HttpHandler>,
}

impl Http1Connection {
    pub fn new(role: Role, handler: Box<dyn HttpHandler>)
        -> Http1Connection
    {
        Http1Connection {
            state: ConnState::new(role),
            handler,
        }
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConnState {
        &mut self.state
    }

    /// Flush formatted output. Returns `true` when the channel
    /// saturated (accepted fewer bytes than offered or would block).
    fn flush<C: Channel>(&mut self, chan: &mut C)
        -> Result<bool, HttpError>
    {
        while !self.state.outbuf.is_empty() {
            let offered = self.state.outbuf.len();
            match chan.write(&self.state.outbuf) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.state.outbuf.drain(..n);
                    self.state.metrics.bytes_out += n as u64;
                    if n < offered {
                        return Ok(true);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(true);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Drive the output side for one readiness turn
    pub fn produce_output<C: Channel>(&mut self, chan: &mut C)
        -> Result<(), HttpError>
    {
        self.state.ready_asked = false;
        loop {
            if self.flush(chan)? {
                // saturated: interest stays up, come back on the next
                // writable event
                chan.set_event(EventSet::WRITE);
                return Ok(());
            }
            // everything formatted so far is on the wire
            if chan.status() == SessionStatus::Closing
                || (self.state.close_after_flush
                    && self.state.out_state == OutputState::Idle)
            {
                chan.clear_event(EventSet::WRITE);
                chan.close(CloseMode::Immediate);
                return Ok(());
            }
            match self.state.out_state {
                OutputState::Idle => {
                    let due = match self.state.role {
                        Role::Client => true,
                        Role::Server => self.state.response_due,
                    };
                    if due && !self.state.ready_asked {
                        self.state.ready_asked = true;
                        match self.state.role {
                            Role::Client => self.handler
                                .request_ready(&mut self.state)?,
                            Role::Server => self.handler
                                .response_ready(&mut self.state)?,
                        }
                        // loop again: a message may have been submitted
                        continue;
                    }
                    // nothing to send
                    chan.clear_event(EventSet::WRITE);
                    return Ok(());
                }
                OutputState::Submitted | OutputState::Encoding => {
                    if self.state.encoder.is_none() {
                        // bodyless message, its head just flushed
                        self.state.finish_outgoing();
                        self.process_input()?;
                        continue;
                    }
                    self.state.out_state = OutputState::Encoding;
                    let produced = self.drive_encoder()?;
                    if self.state.encoder.as_ref()
                        .map(|e| e.is_complete()).unwrap_or(true)
                    {
                        self.state.finish_outgoing();
                        // a pipelined head may be sitting in the input
                        // buffer with no readable event coming
                        self.process_input()?;
                        continue;
                    }
                    if produced == 0 && self.state.outbuf.is_empty() {
                        // content producer has nothing buffered; it
                        // re-raises write interest when it does
                        chan.clear_event(EventSet::WRITE);
                        return Ok(());
                    }
                    // flush whatever the encoder framed
                    continue;
                }
            }
        }
    }

    /// Let the handler push body bytes through the encoder. Returns
    /// the number of bytes added to the output buffer.
    fn drive_encoder(&mut self) -> Result<usize, HttpError> {
        let mut encoder = self.state.encoder.take()
            .expect("drive_encoder without encoder");
        let mut out = mem::take(&mut self.state.outbuf);
        let before = out.len();
        let result = {
            let mut chan = EncoderChannel {
                encoder: &mut *encoder,
                out: &mut out,
            };
            self.handler.output_ready(&mut self.state, &mut chan)
        };
        let produced = out.len() - before;
        // a submit inside the callback is rejected, but merge anyway
        out.extend_from_slice(&self.state.outbuf);
        self.state.outbuf = out;
        self.state.encoder = Some(encoder);
        result?;
        Ok(produced)
    }

    /// Drive the input side for one readiness turn
    pub fn consume_input<C: Channel>(&mut self, chan: &mut C)
        -> Result<(), HttpError>
    {
        let mut eof = false;
        let mut buf = [0u8; READ_CHUNK];
        while !self.state.eof_seen {
            match chan.read(&mut buf) {
                Ok(0) => {
                    eof = true;
                    self.state.eof_seen = true;
                    break;
                }
                Ok(n) => {
                    self.state.inbuf.extend_from_slice(&buf[..n]);
                    self.state.metrics.bytes_in += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.process_input()?;

        if eof {
            self.handle_eof(chan)?;
        }
        // a parsed request may have made a response due; make sure the
        // output side runs
        if !self.state.outbuf.is_empty() || self.state.response_due
            || self.state.close_after_flush
        {
            chan.set_event(EventSet::WRITE);
        }
        Ok(())
    }

    /// Parse heads and decode bodies out of the raw input buffer,
    /// possibly several pipelined messages deep
    fn process_input(&mut self) -> Result<(), HttpError> {
        loop {
            if self.state.decoder.is_none() {
                if self.state.inbuf.is_empty() {
                    return Ok(());
                }
                if self.state.role == Role::Server
                    && (self.state.response_due
                        || self.state.out_state != OutputState::Idle)
                {
                    // don't parse ahead of an unfinished exchange; the
                    // bytes stay buffered for the next message
                    return Ok(());
                }
                if !self.parse_head()? {
                    // head incomplete, keep reading
                    return Ok(());
                }
            }
            if self.state.decoder.is_some() {
                let len_before = self.state.inbuf.len();
                self.drive_decoder()?;
                if self.state.decoder.as_ref()
                    .map(|d| d.is_complete()).unwrap_or(true)
                {
                    self.state.finish_incoming();
                    // loop: the next pipelined head may be buffered
                    continue;
                }
                if self.state.inbuf.len() == len_before {
                    // handler did not drain anything this turn
                    return Ok(());
                }
            }
        }
    }

    /// Try to parse one message head. Returns `false` when more bytes
    /// are needed.
    fn parse_head(&mut self) -> Result<bool, HttpError> {
        match self.state.role {
            Role::Client => {
                let parsed = ResponseHead::parse(&self.state.inbuf)
                    .map_err(HttpError::Protocol)?;
                let (head, len) = match parsed {
                    Some(x) => x,
                    None => return Ok(false),
                };
                self.state.inbuf.drain(..len);
                let to_head = if self.state.sent_head.is_empty() {
                    false
                } else {
                    self.state.sent_head.remove(0)
                };
                let framing = BodyKind::for_response(&head, to_head)
                    .map_err(HttpError::Protocol)?;
                self.state.peer_close |= framing.close;
                let kind = framing.kind.unwrap_or(BodyKind::Eof);
                debug!("response {} received, body {:?}", head.code, kind);
                self.state.decoder = Some(decoder_for(kind));
                self.handler.response_received(head, &mut self.state)?;
            }
            Role::Server => {
                let parsed = RequestHead::parse(&self.state.inbuf)
                    .map_err(HttpError::Protocol)?;
                let (head, len) = match parsed {
                    Some(x) => x,
                    None => return Ok(false),
                };
                self.state.inbuf.drain(..len);
                let framing = BodyKind::for_request(&head)
                    .map_err(HttpError::Protocol)?;
                self.state.peer_close |= framing.close;
                let kind = framing.kind.unwrap_or(BodyKind::Fixed(0));
                debug!("request {} {} received, body {:?}",
                    head.method, head.uri, kind);
                self.state.decoder = Some(decoder_for(kind));
                self.state.response_due = true;
                self.handler.request_received(head, &mut self.state)?;
            }
        }
        Ok(true)
    }

    /// Let the handler drain decoded content
    fn drive_decoder(&mut self) -> Result<(), HttpError> {
        let mut decoder = self.state.decoder.take()
            .expect("drive_decoder without decoder");
        let mut src = mem::take(&mut self.state.inbuf);
        let result = {
            let mut chan = DecoderChannel {
                decoder: &mut *decoder,
                src: &mut src,
            };
            self.handler.input_ready(&mut self.state, &mut chan)
        };
        src.extend_from_slice(&self.state.inbuf);
        self.state.inbuf = src;
        self.state.decoder = Some(decoder);
        result
    }

    fn handle_eof<C: Channel>(&mut self, chan: &mut C)
        -> Result<(), HttpError>
    {
        if let Some(decoder) = self.state.decoder.as_mut() {
            // identity bodies end exactly here; framed bodies must not
            decoder.end_of_input().map_err(HttpError::Protocol)?;
            self.drive_decoder()?;
            self.state.finish_incoming();
            self.handler.end_of_input(&mut self.state);
            chan.close(CloseMode::Graceful);
        } else if !self.state.inbuf.is_empty() {
            // stream cut in the middle of a head
            return Err(HttpError::Protocol(ProtocolError::PrematureEof));
        } else {
            self.handler.end_of_input(&mut self.state);
            chan.close(CloseMode::Graceful);
        }
        Ok(())
    }
}

impl EventHandler for Http1Connection {
    fn connected(&mut self, session: &mut IoSession)
        -> Result<(), HttpError>
    {
        session.set_event(EventSet::READ);
        if self.state.role == Role::Client {
            // give the handler a chance to submit the first request
            session.set_event(EventSet::WRITE);
        }
        self.handler.connected(&mut self.state);
        Ok(())
    }

    fn input_ready(&mut self, session: &mut IoSession)
        -> Result<(), HttpError>
    {
        self.consume_input(session)
    }

    fn output_ready(&mut self, session: &mut IoSession)
        -> Result<(), HttpError>
    {
        self.produce_output(session)
    }

    fn timeout(&mut self, _session: &mut IoSession) -> bool {
        self.handler.timeout(&mut self.state)
    }

    fn exception(&mut self, _session: &mut IoSession, err: &HttpError) {
        self.handler.exception(&mut self.state, err);
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::sync::{Arc, Mutex};

    use crate::error::{HttpError, ProtocolError};
    use crate::message::{RequestHead, ResponseHead};
    use crate::session::{Channel, CloseMode, EventSet, SessionStatus};
    use super::{ConnState, DecoderChannel, EncoderChannel, Http1Connection,
                HttpHandler, Role};

    /// In-memory stand-in for an `IoSession`, with a configurable
    /// per-write byte cap to model a saturated socket
    struct MockChannel {
        input: Vec<u8>,
        rpos: usize,
        eof: bool,
        written: Vec<u8>,
        write_cap: usize,
        write_calls: usize,
        interest: EventSet,
        status: SessionStatus,
    }

    impl MockChannel {
        fn new() -> MockChannel {
            MockChannel {
                input: Vec::new(),
                rpos: 0,
                eof: false,
                written: Vec::new(),
                write_cap: usize::MAX,
                write_calls: 0,
                interest: EventSet::NONE,
                status: SessionStatus::Active,
            }
        }

        fn with_input(input: &[u8], eof: bool) -> MockChannel {
            let mut chan = MockChannel::new();
            chan.input = input.to_vec();
            chan.eof = eof;
            chan
        }
    }

    impl Channel for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let avail = self.input.len() - self.rpos;
            if avail == 0 {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = avail.min(buf.len());
            buf[..n].copy_from_slice(&self.input[self.rpos..self.rpos + n]);
            self.rpos += n;
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.write_calls += 1;
            let n = data.len().min(self.write_cap);
            self.written.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn set_event(&mut self, ev: EventSet) {
            self.interest = self.interest | ev;
        }

        fn clear_event(&mut self, ev: EventSet) {
            self.interest = self.interest.without(ev);
        }

        fn status(&self) -> SessionStatus {
            self.status
        }

        fn close(&mut self, mode: CloseMode) {
            match (self.status, mode) {
                (SessionStatus::Closed, _) => {}
                (SessionStatus::Active, CloseMode::Graceful) => {
                    self.status = SessionStatus::Closing;
                    self.interest = self.interest | EventSet::WRITE;
                }
                (SessionStatus::Closing, CloseMode::Graceful) => {}
                (_, CloseMode::Immediate) => {
                    self.status = SessionStatus::Closed;
                }
            }
        }
    }

    struct Null;
    impl HttpHandler for Null {}

    /// Client handler that submits one chunked request and streams a
    /// fixed body through the encoder
    struct OneShot {
        body: Vec<u8>,
        submitted: bool,
    }

    impl HttpHandler for OneShot {
        fn request_ready(&mut self, conn: &mut ConnState)
            -> Result<(), HttpError>
        {
            if !self.submitted {
                self.submitted = true;
                let mut head = RequestHead::new("POST", "/");
                head.add_header("Transfer-Encoding", &b"chunked"[..]);
                conn.submit_request(head)?;
            }
            Ok(())
        }

        fn output_ready(&mut self, _conn: &mut ConnState,
            enc: &mut EncoderChannel) -> Result<(), HttpError>
        {
            if !self.body.is_empty() {
                let body = std::mem::take(&mut self.body);
                enc.write(&body)?;
            }
            enc.finish()?;
            Ok(())
        }
    }

    /// Server handler answering every request with an empty 200
    struct CountingServer {
        requests: usize,
    }

    impl HttpHandler for CountingServer {
        fn request_received(&mut self, _head: RequestHead,
            _conn: &mut ConnState) -> Result<(), HttpError>
        {
            self.requests += 1;
            Ok(())
        }

        fn input_ready(&mut self, conn: &mut ConnState,
            dec: &mut DecoderChannel) -> Result<(), HttpError>
        {
            let mut sink = Vec::new();
            dec.read(&mut sink)?;
            if dec.is_complete() {
                let mut head = ResponseHead::new(200, "OK");
                head.add_header("Content-Length", &b"0"[..]);
                conn.submit_response(head)?;
            }
            Ok(())
        }
    }

    /// Server that echoes the request body back length-delimited
    struct EchoServer {
        received: Vec<u8>,
    }

    impl HttpHandler for EchoServer {
        fn input_ready(&mut self, conn: &mut ConnState,
            dec: &mut DecoderChannel) -> Result<(), HttpError>
        {
            dec.read(&mut self.received)?;
            if dec.is_complete() {
                let mut head = ResponseHead::new(200, "OK");
                head.add_header("Content-Length",
                    format!("{}", self.received.len()));
                conn.submit_response(head)?;
            }
            Ok(())
        }

        fn output_ready(&mut self, _conn: &mut ConnState,
            enc: &mut EncoderChannel) -> Result<(), HttpError>
        {
            let body = std::mem::take(&mut self.received);
            enc.write(&body)?;
            enc.finish()?;
            Ok(())
        }
    }

    /// Client handler that drains the body only once the decoder
    /// reports completion
    struct DrainLate(Arc<Mutex<Vec<u8>>>);

    impl HttpHandler for DrainLate {
        fn input_ready(&mut self, _conn: &mut ConnState,
            dec: &mut DecoderChannel) -> Result<(), HttpError>
        {
            if dec.is_complete() {
                let mut sink = Vec::new();
                dec.read(&mut sink)?;
                self.0.lock().unwrap().extend_from_slice(&sink);
            }
            Ok(())
        }
    }

    /// Client handler collecting a response body
    struct Collect {
        body: Vec<u8>,
        responses: usize,
    }

    impl HttpHandler for Collect {
        fn response_received(&mut self, _head: ResponseHead,
            _conn: &mut ConnState) -> Result<(), HttpError>
        {
            self.responses += 1;
            Ok(())
        }

        fn input_ready(&mut self, _conn: &mut ConnState,
            dec: &mut DecoderChannel) -> Result<(), HttpError>
        {
            dec.read(&mut self.body)?;
            Ok(())
        }
    }

    fn drive_output(conn: &mut Http1Connection, chan: &mut MockChannel) {
        for _ in 0..64 {
            conn.produce_output(chan).unwrap();
            if !chan.interest.contains(EventSet::WRITE)
                || chan.status == SessionStatus::Closed
            {
                return;
            }
        }
        panic!("output did not quiesce");
    }

    #[test]
    fn second_submit_is_rejected() {
        let mut conn = Http1Connection::new(Role::Client, Box::new(Null));
        conn.state_mut().submit_request(RequestHead::new("GET", "/a"))
            .unwrap();
        let err = conn.state_mut()
            .submit_request(RequestHead::new("GET", "/b"))
            .unwrap_err();
        assert!(matches!(err, HttpError::AlreadySubmitted));
    }

    #[test]
    fn submit_allowed_again_after_flush() {
        let mut conn = Http1Connection::new(Role::Client, Box::new(Null));
        let mut chan = MockChannel::new();
        conn.state_mut().submit_request(RequestHead::new("GET", "/a"))
            .unwrap();
        drive_output(&mut conn, &mut chan);
        conn.state_mut().submit_request(RequestHead::new("GET", "/b"))
            .unwrap();
        assert_eq!(conn.state().metrics().requests, 1);
    }

    #[test]
    fn submit_response_on_client_is_rejected() {
        let mut conn = Http1Connection::new(Role::Client, Box::new(Null));
        let err = conn.state_mut()
            .submit_response(ResponseHead::new(200, "OK"))
            .unwrap_err();
        assert!(matches!(err, HttpError::WrongSide));
    }

    #[test]
    fn conflicting_framing_rejected_at_submit() {
        let mut conn = Http1Connection::new(Role::Client, Box::new(Null));
        let mut head = RequestHead::new("POST", "/");
        head.add_header("Content-Length", &b"5"[..])
            .add_header("Transfer-Encoding", &b"chunked"[..]);
        let err = conn.state_mut().submit_request(head).unwrap_err();
        assert!(matches!(err,
            HttpError::Protocol(ProtocolError::ConflictingFraming)));
    }

    #[test]
    fn saturated_channel_takes_exact_write_count() {
        // head is 47 bytes, chunked framing of a 23-byte body is 34,
        // so a channel taking 24 bytes per write needs ceil(81/24) = 4
        let body = b"twenty-three byte body.";
        assert_eq!(body.len(), 23);
        let mut conn = Http1Connection::new(Role::Client,
            Box::new(OneShot { body: body.to_vec(), submitted: false }));
        let mut chan = MockChannel::new();
        chan.write_cap = 24;
        drive_output(&mut conn, &mut chan);
        assert_eq!(chan.write_calls, 4);
        assert_eq!(conn.state().buffered_output(), 0);
        assert!(!chan.interest.contains(EventSet::WRITE));
        let expected_tail = b"17\r\ntwenty-three byte body.\r\n0\r\n\r\n";
        assert!(chan.written.ends_with(expected_tail));
        assert_eq!(conn.state().metrics().requests, 1);
    }

    #[test]
    fn closing_with_buffered_output_flushes_first() {
        let mut conn = Http1Connection::new(Role::Client, Box::new(Null));
        let mut chan = MockChannel::new();
        chan.write_cap = 10;
        conn.state_mut().submit_request(RequestHead::new("GET", "/slow"))
            .unwrap();
        // one partial write, then the close request arrives
        conn.produce_output(&mut chan).unwrap();
        assert!(conn.state().buffered_output() > 0);
        chan.close(CloseMode::Graceful);
        assert_eq!(chan.status, SessionStatus::Closing);
        drive_output(&mut conn, &mut chan);
        assert_eq!(chan.status, SessionStatus::Closed);
        assert_eq!(conn.state().buffered_output(), 0);
        assert!(chan.written.starts_with(b"GET /slow HTTP/1.1\r\n"));
    }

    #[test]
    fn server_echoes_fixed_length_body() {
        let mut conn = Http1Connection::new(Role::Server,
            Box::new(EchoServer { received: Vec::new() }));
        let mut chan = MockChannel::with_input(
            b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello", false);
        conn.consume_input(&mut chan).unwrap();
        assert!(chan.interest.contains(EventSet::WRITE));
        drive_output(&mut conn, &mut chan);
        let written = String::from_utf8_lossy(&chan.written);
        assert!(written.starts_with("HTTP/1.1 200 OK\r\n"), "{}", written);
        assert!(written.ends_with("\r\n\r\nhello"), "{}", written);
        assert_eq!(conn.state().metrics().requests, 1);
        assert_eq!(conn.state().metrics().responses, 1);
    }

    #[test]
    fn server_handles_pipelined_requests_in_order() {
        let mut conn = Http1Connection::new(Role::Server,
            Box::new(CountingServer { requests: 0 }));
        let mut chan = MockChannel::with_input(
            b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n", false);
        conn.consume_input(&mut chan).unwrap();
        drive_output(&mut conn, &mut chan);
        let written = String::from_utf8_lossy(&chan.written);
        assert_eq!(written.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(conn.state().metrics().requests, 2);
        assert_eq!(conn.state().metrics().responses, 2);
        assert!(conn.state().is_idle());
    }

    #[test]
    fn client_collects_response_body() {
        let mut conn = Http1Connection::new(Role::Client,
            Box::new(Collect { body: Vec::new(), responses: 0 }));
        let mut chan = MockChannel::new();
        conn.state_mut().submit_request(RequestHead::new("GET", "/data"))
            .unwrap();
        drive_output(&mut conn, &mut chan);
        chan.input = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc"
            .to_vec();
        conn.consume_input(&mut chan).unwrap();
        assert_eq!(conn.state().metrics().responses, 1);
        assert!(conn.state().is_idle());
    }

    #[test]
    fn chunked_response_split_into_single_bytes() {
        let mut conn = Http1Connection::new(Role::Client,
            Box::new(Collect { body: Vec::new(), responses: 0 }));
        let mut chan = MockChannel::new();
        conn.state_mut().submit_request(RequestHead::new("GET", "/stream"))
            .unwrap();
        drive_output(&mut conn, &mut chan);
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     6\r\nstream\r\n3\r\ned!\r\n0\r\n\r\n";
        for &byte in wire.iter() {
            chan.input.push(byte);
            conn.consume_input(&mut chan).unwrap();
        }
        assert_eq!(conn.state().metrics().responses, 1);
        assert!(conn.state().is_idle());
    }

    #[test]
    fn identity_response_ends_on_peer_close() {
        let mut conn = Http1Connection::new(Role::Client,
            Box::new(Collect { body: Vec::new(), responses: 0 }));
        let mut chan = MockChannel::new();
        conn.state_mut().submit_request(RequestHead::new("GET", "/legacy"))
            .unwrap();
        drive_output(&mut conn, &mut chan);
        chan.input = b"HTTP/1.1 200 OK\r\n\r\nall the bytes".to_vec();
        chan.eof = true;
        conn.consume_input(&mut chan).unwrap();
        assert_eq!(conn.state().metrics().responses, 1);
        assert_ne!(chan.status, SessionStatus::Active);
    }

    #[test]
    fn identity_tail_reaches_a_late_draining_handler() {
        let body = Arc::new(Mutex::new(Vec::new()));
        let mut conn = Http1Connection::new(Role::Client,
            Box::new(DrainLate(Arc::clone(&body))));
        let mut chan = MockChannel::with_input(
            b"HTTP/1.1 200 OK\r\n\r\npartial tail", true);
        conn.state_mut().submit_request(RequestHead::new("GET", "/tail"))
            .unwrap();
        conn.consume_input(&mut chan).unwrap();
        assert_eq!(&body.lock().unwrap()[..], b"partial tail");
        assert_eq!(conn.state().metrics().responses, 1);
        assert_ne!(chan.status, SessionStatus::Active);
    }

    #[test]
    fn eof_mid_fixed_body_is_a_protocol_error() {
        let mut conn = Http1Connection::new(Role::Client,
            Box::new(Collect { body: Vec::new(), responses: 0 }));
        let mut chan = MockChannel::with_input(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nab", true);
        conn.state_mut().submit_request(RequestHead::new("GET", "/cut"))
            .unwrap();
        let err = conn.consume_input(&mut chan).unwrap_err();
        assert!(matches!(err,
            HttpError::Protocol(ProtocolError::PrematureEof)));
    }
}
