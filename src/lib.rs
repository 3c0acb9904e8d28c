//! A non-blocking HTTP/1.1 protocol engine on top of mio.
//!
//! A small pool of reactor threads multiplexes many connections; each
//! connection is an event-driven state machine that parses and frames
//! messages incrementally, streaming bodies through content codecs as
//! the socket allows. Nothing here spawns a thread per connection or
//! buffers a whole message unless the peer forces it to.

#[macro_use]
extern crate quick_error;

pub mod body;
pub mod codec;
pub mod http1;
pub mod pool;
pub mod reactor;
pub mod session;
mod error;
mod headers;
mod message;
mod version;

pub use crate::error::{HttpError, ProtocolError};
pub use crate::http1::{ConnMetrics, ConnState, Http1Connection, HttpHandler,
                       Role};
pub use crate::message::{Header, RequestHead, ResponseHead};
pub use crate::pool::{Connect, PoolConfig, PoolStats, SessionPool};
pub use crate::reactor::pool::{ListenerHandle, ReactorPool, SessionFuture,
                               WorkerSelector};
pub use crate::reactor::ReactorConfig;
pub use crate::session::{CloseMode, EventSet, SessionHandle, SessionStatus,
                         SessionUpgrade};
pub use crate::version::Version;
