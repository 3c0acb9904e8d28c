use std::io;

quick_error! {
    /// Wire-level errors detected while parsing or framing a message
    ///
    /// Note, you should not make an exhaustive match over the enum.
    /// More errors will be added at will.
    #[derive(Debug)]
    pub enum ProtocolError {
        HeadersTooLarge {
            display("message head is larger than MAX_HEADERS_SIZE")
        }
        BadHeaders(err: httparse::Error) {
            from()
            display("error parsing message head: {}", err)
        }
        InvalidChunkSize(err: httparse::InvalidChunkSize) {
            from()
            display("error parsing chunk size: {:?}", err)
        }
        ChunkHeadTooLong {
            display("chunk size line is longer than MAX_CHUNK_HEAD")
        }
        TrailerTooLong {
            display("chunk trailer line is longer than MAX_CHUNK_HEAD")
        }
        DuplicateContentLength {
            display("duplicate `Content-Length` header in message")
        }
        ConflictingFraming {
            display("both `Content-Length` and `Transfer-Encoding` present")
        }
        BadContentLength {
            display("error parsing `Content-Length` header")
        }
        UnsupportedTransferEncoding {
            display("transfer encoding other than `chunked` in message")
        }
        MissingLength {
            display("request carries a body but no framing headers")
        }
        BodyLengthMismatch {
            display("body is shorter than the declared `Content-Length`")
        }
        PrematureEof {
            display("connection closed in the middle of a message body")
        }
    }
}

quick_error! {
    /// An engine-level error delivered to `exception` callbacks and
    /// connect/lease futures
    #[derive(Debug)]
    pub enum HttpError {
        Io(err: io::Error) {
            from()
            display("i/o error: {}", err)
            source(err)
        }
        Protocol(err: ProtocolError) {
            from()
            display("protocol error: {}", err)
            source(err)
        }
        AlreadySubmitted {
            display("a message is already submitted on this connection")
        }
        WrongSide {
            display("message submitted on the wrong side of the connection")
        }
        Timeout {
            display("session timed out")
        }
        /// Explicit shutdown or pool teardown, distinct from failure
        Cancelled {
            display("operation cancelled")
        }
        QueueFull {
            display("bounded command or waiter queue is at capacity")
        }
        SessionClosed {
            display("session is closed")
        }
        ShuttingDown {
            display("reactor is shutting down")
        }
    }
}

impl HttpError {
    /// True for errors that indicate engine teardown rather than a
    /// failed exchange
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HttpError::Cancelled | HttpError::ShuttingDown)
    }
}

impl Clone for HttpError {
    fn clone(&self) -> HttpError {
        use self::HttpError::*;
        match *self {
            // io::Error is not Clone; keep the kind and message
            Io(ref e) => Io(io::Error::new(e.kind(), e.to_string())),
            Protocol(ref e) => Protocol(e.clone()),
            AlreadySubmitted => AlreadySubmitted,
            WrongSide => WrongSide,
            Timeout => Timeout,
            Cancelled => Cancelled,
            QueueFull => QueueFull,
            SessionClosed => SessionClosed,
            ShuttingDown => ShuttingDown,
        }
    }
}

impl Clone for ProtocolError {
    fn clone(&self) -> ProtocolError {
        use self::ProtocolError::*;
        match *self {
            HeadersTooLarge => HeadersTooLarge,
            BadHeaders(e) => BadHeaders(e),
            // httparse::InvalidChunkSize is a unit struct without Clone
            InvalidChunkSize(_) => InvalidChunkSize(httparse::InvalidChunkSize),
            ChunkHeadTooLong => ChunkHeadTooLong,
            TrailerTooLong => TrailerTooLong,
            DuplicateContentLength => DuplicateContentLength,
            ConflictingFraming => ConflictingFraming,
            BadContentLength => BadContentLength,
            UnsupportedTransferEncoding => UnsupportedTransferEncoding,
            MissingLength => MissingLength,
            BodyLengthMismatch => BodyLengthMismatch,
            PrematureEof => PrematureEof,
        }
    }
}
