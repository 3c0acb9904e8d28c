//! Per-socket session state.
//!
//! A session's stream and buffers belong to exactly one worker thread
//! for the session's whole life. The only pieces other threads may
//! touch are the atomic interest set and the command queue, both held
//! in the shared [`SessionCore`]; every cross-thread mutation wakes the
//! owning worker so it is observed on the next loop turn.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::trace;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token, Waker};

use crate::error::HttpError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Interest bits the multiplexer should report for a session
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct EventSet(u8);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(1);
    pub const WRITE: EventSet = EventSet(2);
    pub const CONNECT: EventSet = EventSet(4);

    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }
    pub fn without(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
    fn bits(self) -> u8 {
        self.0
    }
    fn from_bits(bits: u8) -> EventSet {
        EventSet(bits & 0x7)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionStatus {
    Active,
    /// Close requested while output is still buffered; the session
    /// keeps flushing and becomes `Closed` once the buffer drains
    Closing,
    Closed,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CloseMode {
    /// Finish buffered output first, then close
    Graceful,
    /// Discard buffered state and close the channel right away
    Immediate,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Priority {
    Immediate,
    Normal,
}

/// A cancellable unit of work executed on the session's worker thread.
///
/// Commands are how any other thread gets code run against a session:
/// "execute an exchange", "shut down", "upgrade the transport". The
/// submitting thread never blocks; a command that cannot be queued is
/// cancelled instead.
pub trait Command: Send {
    fn execute(self: Box<Self>, session: &mut IoSession)
        -> Result<(), HttpError>;
    fn cancel(self: Box<Self>);
}

struct FnCommand<F>(F);

impl<F> Command for FnCommand<F>
    where F: FnOnce(&mut IoSession) -> Result<(), HttpError> + Send,
{
    fn execute(self: Box<Self>, session: &mut IoSession)
        -> Result<(), HttpError>
    {
        (self.0)(session)
    }
    fn cancel(self: Box<Self>) {}
}

/// Wrap a closure into a command with a no-op cancel
pub fn command<F>(f: F) -> Box<dyn Command>
    where F: FnOnce(&mut IoSession) -> Result<(), HttpError> + Send + 'static,
{
    Box::new(FnCommand(f))
}

/// Requests a close from any thread
pub struct ShutdownCommand(pub CloseMode);

impl Command for ShutdownCommand {
    fn execute(self: Box<Self>, session: &mut IoSession)
        -> Result<(), HttpError>
    {
        session.close(self.0);
        Ok(())
    }
    fn cancel(self: Box<Self>) {}
}

struct QueueInner {
    immediate: VecDeque<Box<dyn Command>>,
    normal: VecDeque<Box<dyn Command>>,
    closed: bool,
}

/// Bounded two-level command queue.
///
/// IMMEDIATE commands run before NORMAL ones and bypass the capacity
/// cap (they are how shutdown gets through a storm); within a priority
/// the order is FIFO. Overflow rejects and cancels the incoming
/// command, it never blocks the submitter or grows without bound.
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> CommandQueue {
        CommandQueue {
            inner: Mutex::new(QueueInner {
                immediate: VecDeque::new(),
                normal: VecDeque::new(),
                closed: false,
            }),
            capacity,
        }
    }

    pub fn enqueue(&self, cmd: Box<dyn Command>, priority: Priority)
        -> Result<(), HttpError>
    {
        let rejected = {
            let mut q = self.inner.lock().expect("command queue poisoned");
            if q.closed {
                Some((cmd, HttpError::SessionClosed))
            } else {
                match priority {
                    Priority::Immediate => {
                        q.immediate.push_back(cmd);
                        None
                    }
                    Priority::Normal if q.normal.len() >= self.capacity => {
                        Some((cmd, HttpError::QueueFull))
                    }
                    Priority::Normal => {
                        q.normal.push_back(cmd);
                        None
                    }
                }
            }
        };
        // cancel outside the lock
        match rejected {
            Some((cmd, err)) => {
                cmd.cancel();
                Err(err)
            }
            None => Ok(()),
        }
    }

    pub fn pop(&self) -> Option<Box<dyn Command>> {
        let mut q = self.inner.lock().expect("command queue poisoned");
        q.immediate.pop_front().or_else(|| q.normal.pop_front())
    }

    pub fn len(&self) -> usize {
        let q = self.inner.lock().expect("command queue poisoned");
        q.immediate.len() + q.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the queue closed and hand back everything still pending so
    /// the caller can cancel it
    pub fn close(&self) -> Vec<Box<dyn Command>> {
        let mut q = self.inner.lock().expect("command queue poisoned");
        q.closed = true;
        let mut pending: Vec<Box<dyn Command>> =
            q.immediate.drain(..).collect();
        pending.extend(q.normal.drain(..));
        pending
    }
}

/// The thread-safe half of a session, shared between the owning worker
/// and any [`SessionHandle`]
pub struct SessionCore {
    token: Token,
    interest: AtomicU8,
    status: AtomicU8,
    queue: CommandQueue,
    waker: Arc<Waker>,
}

const ST_ACTIVE: u8 = 0;
const ST_CLOSING: u8 = 1;
const ST_CLOSED: u8 = 2;

impl SessionCore {
    pub fn new(token: Token, waker: Arc<Waker>, queue_capacity: usize)
        -> SessionCore
    {
        SessionCore {
            token,
            interest: AtomicU8::new(0),
            status: AtomicU8::new(ST_ACTIVE),
            queue: CommandQueue::new(queue_capacity),
            waker,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn interest(&self) -> EventSet {
        EventSet::from_bits(self.interest.load(Ordering::SeqCst))
    }

    pub fn set_event(&self, ev: EventSet) {
        self.interest.fetch_or(ev.bits(), Ordering::SeqCst);
    }

    pub fn clear_event(&self, ev: EventSet) {
        self.interest.fetch_and(!ev.bits(), Ordering::SeqCst);
    }

    pub fn status(&self) -> SessionStatus {
        match self.status.load(Ordering::SeqCst) {
            ST_ACTIVE => SessionStatus::Active,
            ST_CLOSING => SessionStatus::Closing,
            _ => SessionStatus::Closed,
        }
    }

    fn set_status(&self, status: SessionStatus) {
        let v = match status {
            SessionStatus::Active => ST_ACTIVE,
            SessionStatus::Closing => ST_CLOSING,
            SessionStatus::Closed => ST_CLOSED,
        };
        self.status.store(v, Ordering::SeqCst);
    }

    fn wake(&self) {
        // a failed wake means the worker is already gone
        let _ = self.waker.wake();
    }
}

/// Cross-thread controller for a session owned by some worker.
///
/// Everything here is safe to call from any thread; none of it touches
/// the socket directly.
#[derive(Clone)]
pub struct SessionHandle {
    core: Arc<SessionCore>,
}

impl SessionHandle {
    pub fn token(&self) -> Token {
        self.core.token()
    }

    pub fn status(&self) -> SessionStatus {
        self.core.status()
    }

    pub fn is_open(&self) -> bool {
        self.core.status() == SessionStatus::Active
    }

    pub fn set_event(&self, ev: EventSet) {
        self.core.set_event(ev);
        self.core.wake();
    }

    pub fn clear_event(&self, ev: EventSet) {
        self.core.clear_event(ev);
        self.core.wake();
    }

    /// Queue a command for the owning worker. On a closed session the
    /// command is cancelled synchronously instead of queued.
    pub fn enqueue(&self, cmd: Box<dyn Command>, priority: Priority)
        -> Result<(), HttpError>
    {
        if self.core.status() == SessionStatus::Closed {
            cmd.cancel();
            return Err(HttpError::SessionClosed);
        }
        self.core.queue.enqueue(cmd, priority)?;
        self.core.wake();
        Ok(())
    }

    /// Ask the owning worker to close the session
    pub fn request_close(&self, mode: CloseMode) {
        let _ = self.enqueue(Box::new(ShutdownCommand(mode)),
            Priority::Immediate);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("token", &self.core.token())
            .field("status", &self.core.status())
            .finish()
    }
}

/// Receives readiness dispatch for one session from the worker loop.
///
/// The worker guarantees no two callbacks run concurrently for the
/// same session. A returned error is routed to `exception` and the
/// session is closed; the loop itself survives.
pub trait EventHandler: Send {
    /// Transport is connected (accepted, or an outgoing connect
    /// finished), possibly already upgraded
    fn connected(&mut self, session: &mut IoSession)
        -> Result<(), HttpError>;
    fn input_ready(&mut self, session: &mut IoSession)
        -> Result<(), HttpError>;
    fn output_ready(&mut self, session: &mut IoSession)
        -> Result<(), HttpError>;
    /// Session deadline expired. The default contract closes the
    /// session unless the handler returns `true` to keep it.
    fn timeout(&mut self, _session: &mut IoSession) -> bool {
        false
    }
    fn exception(&mut self, _session: &mut IoSession, _err: &HttpError) {}
}

/// Prepares a freshly connected transport before the protocol handler
/// attaches, e.g. tuning socket options or arming a tighter deadline
/// for a TLS-style handshake driven by the handler. Plain sessions use
/// no upgrade at all.
pub trait SessionUpgrade: Send {
    fn upgrade(&mut self, session: &mut IoSession) -> Result<(), HttpError>;
}

/// What the HTTP state machine needs from its transport. `IoSession`
/// is the real implementation; tests substitute an in-memory one.
pub trait Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
    fn set_event(&mut self, ev: EventSet);
    fn clear_event(&mut self, ev: EventSet);
    fn status(&self) -> SessionStatus;
    fn close(&mut self, mode: CloseMode);
}

/// A non-blocking socket plus its lifecycle, owned by one worker
pub struct IoSession {
    core: Arc<SessionCore>,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    /// interest as last applied to the poll registration
    applied: EventSet,
    timeout: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
    last_event: Instant,
    on_close: Option<Box<dyn FnOnce(Token) + Send>>,
}

fn mio_interest(ev: EventSet) -> Interest {
    // The readable side stays registered so peer close is always
    // observed; the READ bit only gates dispatch.
    if ev.intersects(EventSet::WRITE | EventSet::CONNECT) {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

impl IoSession {
    pub fn new(stream: TcpStream, token: Token, waker: Arc<Waker>,
        queue_capacity: usize) -> IoSession
    {
        let now = Instant::now();
        let peer = stream.peer_addr().ok();
        IoSession {
            core: Arc::new(SessionCore::new(token, waker, queue_capacity)),
            stream,
            peer,
            applied: EventSet::NONE,
            timeout: None,
            last_read: now,
            last_write: now,
            last_event: now,
            on_close: None,
        }
    }

    pub fn token(&self) -> Token {
        self.core.token()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle { core: Arc::clone(&self.core) }
    }

    pub fn interest(&self) -> EventSet {
        self.core.interest()
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Instant at which this session times out, if a timeout is set
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.last_event + t)
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    pub fn last_write(&self) -> Instant {
        self.last_write
    }

    /// Reset the inactivity clock, e.g. when a timeout handler decides
    /// to keep the session alive
    pub fn touch(&mut self) {
        self.last_event = Instant::now();
    }

    pub fn set_close_callback<F>(&mut self, f: F)
        where F: FnOnce(Token) + Send + 'static,
    {
        self.on_close = Some(Box::new(f));
    }

    /// First registration with the worker's poll
    pub(crate) fn register(&mut self, registry: &Registry)
        -> io::Result<()>
    {
        let wanted = self.core.interest();
        registry.register(&mut self.stream, self.core.token(),
            mio_interest(wanted))?;
        self.applied = wanted;
        Ok(())
    }

    /// Bring the poll registration in line with the atomic interest
    /// set. Returns the bits raised since the last sync so the worker
    /// can dispatch them immediately (the socket may already be ready
    /// and, being edge-triggered, would never report it otherwise).
    pub(crate) fn sync_interest(&mut self, registry: &Registry)
        -> io::Result<EventSet>
    {
        let wanted = self.core.interest();
        let added = wanted.without(self.applied);
        if wanted != self.applied {
            if mio_interest(wanted) != mio_interest(self.applied) {
                registry.reregister(&mut self.stream, self.core.token(),
                    mio_interest(wanted))?;
            }
            self.applied = wanted;
        }
        Ok(added)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
    }

    /// Did a pending non-blocking connect finish, and how
    pub(crate) fn check_connect(&mut self) -> io::Result<()> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(addr) => {
                self.peer = Some(addr);
                self.core.clear_event(EventSet::CONNECT);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                // spurious wakeup, connect still in flight
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn queue(&self) -> &CommandQueue {
        &self.core.queue
    }

    pub fn status(&self) -> SessionStatus {
        self.core.status()
    }

    pub fn is_closed(&self) -> bool {
        self.core.status() == SessionStatus::Closed
    }
}

impl Channel for IoSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        let now = Instant::now();
        self.last_read = now;
        self.last_event = now;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(data)?;
        let now = Instant::now();
        self.last_write = now;
        self.last_event = now;
        Ok(n)
    }

    fn set_event(&mut self, ev: EventSet) {
        self.core.set_event(ev);
    }

    fn clear_event(&mut self, ev: EventSet) {
        self.core.clear_event(ev);
    }

    fn status(&self) -> SessionStatus {
        self.core.status()
    }

    /// Idempotent close, either flavor. Graceful keeps the session in
    /// `Closing` with write interest up so buffered output can drain;
    /// immediate drops everything now.
    fn close(&mut self, mode: CloseMode) {
        match (self.core.status(), mode) {
            (SessionStatus::Closed, _) => {}
            (SessionStatus::Closing, CloseMode::Graceful) => {}
            (SessionStatus::Active, CloseMode::Graceful) => {
                trace!("session {:?}: graceful close requested",
                    self.core.token());
                self.core.set_status(SessionStatus::Closing);
                self.core.set_event(EventSet::WRITE);
            }
            (_, CloseMode::Immediate) => {
                trace!("session {:?}: closed", self.core.token());
                self.core.set_status(SessionStatus::Closed);
                for cmd in self.core.queue.close() {
                    cmd.cancel();
                }
                let _ = self.stream.shutdown(Shutdown::Both);
                if let Some(cb) = self.on_close.take() {
                    cb(self.core.token());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::error::HttpError;
    use super::{Command, CommandQueue, EventSet, IoSession, Priority};

    struct CountCancels {
        cancelled: Arc<AtomicUsize>,
    }

    impl Command for CountCancels {
        fn execute(self: Box<Self>, _session: &mut IoSession)
            -> Result<(), HttpError>
        {
            unreachable!("queue tests never execute")
        }
        fn cancel(self: Box<Self>) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted(cancelled: &Arc<AtomicUsize>) -> Box<CountCancels> {
        Box::new(CountCancels { cancelled: Arc::clone(cancelled) })
    }

    #[test]
    fn event_set_ops() {
        let mut ev = EventSet::READ;
        ev |= EventSet::WRITE;
        assert!(ev.contains(EventSet::READ));
        assert!(ev.contains(EventSet::WRITE));
        assert!(!ev.contains(EventSet::CONNECT));
        let ev = ev.without(EventSet::READ);
        assert!(!ev.contains(EventSet::READ));
        assert!(ev.intersects(EventSet::WRITE | EventSet::CONNECT));
        // idempotent updates
        assert_eq!(ev | EventSet::WRITE, ev);
    }

    #[test]
    fn overflow_cancels_newest_normal_command() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CommandQueue::new(3);
        for _ in 0..3 {
            queue.enqueue(counted(&cancelled), Priority::Normal).unwrap();
        }
        let err = queue.enqueue(counted(&cancelled), Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, HttpError::QueueFull));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn immediate_bypasses_capacity() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CommandQueue::new(1);
        queue.enqueue(counted(&cancelled), Priority::Normal).unwrap();
        queue.enqueue(counted(&cancelled), Priority::Immediate).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn closed_queue_cancels_synchronously() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let queue = CommandQueue::new(8);
        queue.enqueue(counted(&cancelled), Priority::Normal).unwrap();
        for cmd in queue.close() {
            cmd.cancel();
        }
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        let err = queue.enqueue(counted(&cancelled), Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, HttpError::SessionClosed));
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn immediate_runs_before_normal_fifo_within() {
        struct Tagged(usize, Arc<std::sync::Mutex<Vec<usize>>>);
        impl Command for Tagged {
            fn execute(self: Box<Self>, _s: &mut IoSession)
                -> Result<(), HttpError>
            {
                unreachable!()
            }
            fn cancel(self: Box<Self>) {
                self.1.lock().unwrap().push(self.0);
            }
        }
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let queue = CommandQueue::new(8);
        let tag = |n| Box::new(Tagged(n, Arc::clone(&order)));
        queue.enqueue(tag(1), Priority::Normal).unwrap();
        queue.enqueue(tag(2), Priority::Immediate).unwrap();
        queue.enqueue(tag(3), Priority::Normal).unwrap();
        queue.enqueue(tag(4), Priority::Immediate).unwrap();
        while let Some(cmd) = queue.pop() {
            // drain order is observed through cancel
            cmd.cancel();
        }
        assert_eq!(&*order.lock().unwrap(), &[2, 4, 1, 3]);
    }
}
