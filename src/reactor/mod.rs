//! The readiness multiplexer.
//!
//! A [`ReactorPool`](pool::ReactorPool) owns a fixed set of worker
//! threads. Each worker runs one `mio::Poll` and fully owns every
//! session attached to it; other threads reach a session only through
//! its atomic interest set and command queue, then wake the worker.
//! Each loop turn dispatches readiness first, then drains control
//! messages, sweeps timeouts, executes queued commands and finally
//! syncs interest registrations. Newly raised interest bits are
//! dispatched in the same turn because the socket may already be ready
//! and an edge-triggered poll would never report it again.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::HttpError;
use crate::session::{Channel, CloseMode, EventHandler, EventSet, IoSession,
                     SessionHandle, SessionUpgrade, DEFAULT_QUEUE_CAPACITY};

pub mod pool;

pub(crate) const WAKER: Token = Token(0);

/// Called exactly once with the outcome of an outgoing connect
pub type ConnectCallback =
    Box<dyn FnOnce(Result<SessionHandle, HttpError>) + Send>;

/// Creates the event handler for each accepted connection
pub type HandlerFactory =
    Box<dyn Fn(SocketAddr) -> Box<dyn EventHandler> + Send>;

/// Creates the transport upgrade for each accepted connection
pub type UpgradeFactory =
    Box<dyn Fn(SocketAddr) -> Box<dyn SessionUpgrade> + Send>;

/// Called on worker-level failures that are not tied to one exchange
pub type ErrorListener = Arc<dyn Fn(&HttpError) + Send + Sync>;

pub struct ReactorConfig {
    /// Number of worker threads (and polls)
    pub workers: usize,
    /// Per-session command queue capacity
    pub queue_capacity: usize,
    /// Default inactivity deadline for sessions that don't set one
    pub session_timeout: Option<Duration>,
    /// Readiness events buffered per poll call
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            workers: 2,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            session_timeout: None,
            events_capacity: 256,
        }
    }
}

pub(crate) enum WorkerMsg {
    /// Adopt a stream with a connect in flight
    Connect {
        stream: TcpStream,
        handler: Box<dyn EventHandler>,
        upgrade: Option<Box<dyn SessionUpgrade>>,
        timeout: Option<Duration>,
        notify: ConnectCallback,
    },
    /// Adopt an already-connected stream (from an acceptor)
    Accept {
        stream: TcpStream,
        handler: Box<dyn EventHandler>,
        upgrade: Option<Box<dyn SessionUpgrade>>,
    },
    Listen {
        token: Token,
        listener: TcpListener,
        factory: HandlerFactory,
        upgrades: Option<UpgradeFactory>,
        dispatch: Dispatcher,
    },
    PauseListener(Token),
    ResumeListener(Token),
    CloseListener(Token),
    Shutdown(CloseMode),
}

/// One worker as seen from other threads: a message channel plus the
/// waker that interrupts its poll
#[derive(Clone)]
pub(crate) struct WorkerLink {
    sender: mpsc::Sender<WorkerMsg>,
    waker: Arc<Waker>,
}

impl WorkerLink {
    pub(crate) fn new(sender: mpsc::Sender<WorkerMsg>, waker: Arc<Waker>)
        -> WorkerLink
    {
        WorkerLink { sender, waker }
    }

    pub(crate) fn send(&self, msg: WorkerMsg) -> Result<(), HttpError> {
        self.sender.send(msg).map_err(|_| HttpError::ShuttingDown)?;
        let _ = self.waker.wake();
        Ok(())
    }

    /// Like `send`, but hands the message back when the worker is gone
    /// so callbacks inside it can still be fired
    pub(crate) fn send_recover(&self, msg: WorkerMsg)
        -> Result<(), WorkerMsg>
    {
        self.sender.send(msg).map_err(|e| e.0)?;
        let _ = self.waker.wake();
        Ok(())
    }
}

/// Spreads accepted connections over all workers round-robin
#[derive(Clone)]
pub(crate) struct Dispatcher {
    links: Arc<Vec<WorkerLink>>,
    next: Arc<std::sync::atomic::AtomicUsize>,
}

impl Dispatcher {
    pub(crate) fn new(links: Arc<Vec<WorkerLink>>,
        next: Arc<std::sync::atomic::AtomicUsize>) -> Dispatcher
    {
        Dispatcher { links, next }
    }

    fn dispatch(&self, stream: TcpStream, handler: Box<dyn EventHandler>,
        upgrade: Option<Box<dyn SessionUpgrade>>) -> Result<(), HttpError>
    {
        let i = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.links.len();
        self.links[i].send(WorkerMsg::Accept { stream, handler, upgrade })
    }
}

struct SessionEntry {
    session: IoSession,
    handler: Box<dyn EventHandler>,
    /// applied once, right before the handler's `connected`
    upgrade: Option<Box<dyn SessionUpgrade>>,
    /// pending connect notification, fired once
    on_connected: Option<ConnectCallback>,
}

struct ListenerEntry {
    listener: TcpListener,
    factory: HandlerFactory,
    upgrades: Option<UpgradeFactory>,
    dispatch: Dispatcher,
    active: bool,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum WorkerState {
    Running,
    /// Not accepting new sessions; existing ones flush and close
    Draining,
    Stopped,
}

pub(crate) struct Worker {
    poll: Poll,
    events: Events,
    rx: mpsc::Receiver<WorkerMsg>,
    waker: Arc<Waker>,
    sessions: HashMap<Token, SessionEntry>,
    listeners: HashMap<Token, ListenerEntry>,
    /// sessions get even tokens, listeners odd ones, waker is zero
    next_token: usize,
    queue_capacity: usize,
    default_timeout: Option<Duration>,
    state: WorkerState,
    on_error: ErrorListener,
}

impl Worker {
    pub(crate) fn new(poll: Poll, rx: mpsc::Receiver<WorkerMsg>,
        waker: Arc<Waker>, config: &ReactorConfig, on_error: ErrorListener)
        -> Worker
    {
        Worker {
            events: Events::with_capacity(config.events_capacity),
            poll,
            rx,
            waker,
            sessions: HashMap::new(),
            listeners: HashMap::new(),
            next_token: 2,
            queue_capacity: config.queue_capacity,
            default_timeout: config.session_timeout,
            state: WorkerState::Running,
            on_error,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("reactor worker started");
        loop {
            let now = Instant::now();
            let timeout = self.poll_timeout(now);
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => {
                    error!("poll failed, worker exiting: {}", e);
                    (self.on_error)(&HttpError::Io(e));
                    self.close_all(CloseMode::Immediate);
                    self.refuse_pending();
                    return;
                }
            }

            let mut ready: Vec<(Token, EventSet)> = Vec::new();
            let mut accepts: Vec<Token> = Vec::new();
            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                if token.0 % 2 == 1 {
                    accepts.push(token);
                    continue;
                }
                let mut ev = EventSet::NONE;
                if event.is_readable() || event.is_read_closed() {
                    ev |= EventSet::READ;
                }
                if event.is_writable() || event.is_write_closed()
                    || event.is_error()
                {
                    ev |= EventSet::WRITE | EventSet::CONNECT;
                }
                if !ev.is_empty() {
                    ready.push((token, ev));
                }
            }
            for (token, ev) in ready {
                self.dispatch(token, ev);
            }
            for token in accepts {
                self.accept_ready(token);
            }

            loop {
                match self.rx.try_recv() {
                    Ok(msg) => self.handle_msg(msg),
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        // the pool is gone, no new work can arrive
                        if self.state == WorkerState::Running {
                            self.begin_shutdown(CloseMode::Graceful);
                        }
                        break;
                    }
                }
            }

            self.sweep_timeouts(Instant::now());
            self.drain_commands();
            self.sync_interests();

            if self.state != WorkerState::Running && self.sessions.is_empty()
            {
                debug!("reactor worker drained, exiting");
                self.refuse_pending();
                return;
            }
        }
    }

    fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        let mut min: Option<Instant> = None;
        for entry in self.sessions.values() {
            if let Some(d) = entry.session.deadline() {
                min = Some(min.map_or(d, |m| m.min(d)));
            }
        }
        let mut timeout = min.map(|d| d.saturating_duration_since(now));
        if self.state == WorkerState::Draining {
            // re-check the drain condition even with silent peers
            let cap = Duration::from_millis(500);
            timeout = Some(timeout.map_or(cap, |t| t.min(cap)));
        }
        timeout
    }

    fn handle_msg(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Connect {
                stream, handler, upgrade, timeout, notify,
            } => {
                self.attach(stream, handler, upgrade, timeout,
                    Some(notify), true);
            }
            WorkerMsg::Accept { stream, handler, upgrade } => {
                self.attach(stream, handler, upgrade, None, None, false);
            }
            WorkerMsg::Listen {
                token, listener, factory, upgrades, dispatch,
            } => {
                self.add_listener(token, listener, factory, upgrades,
                    dispatch);
            }
            WorkerMsg::PauseListener(token) => {
                if let Some(entry) = self.listeners.get_mut(&token) {
                    if entry.active {
                        let _ = self.poll.registry()
                            .deregister(&mut entry.listener);
                        entry.active = false;
                        debug!("listener {:?} paused", token);
                    }
                }
            }
            WorkerMsg::ResumeListener(token) => {
                let resumed = match self.listeners.get_mut(&token) {
                    Some(entry) if !entry.active => {
                        match self.poll.registry().register(
                            &mut entry.listener, token, Interest::READABLE)
                        {
                            Ok(()) => {
                                entry.active = true;
                                true
                            }
                            Err(e) => {
                                warn!("listener {:?} resume failed: {}",
                                    token, e);
                                false
                            }
                        }
                    }
                    _ => false,
                };
                if resumed {
                    // the backlog may have filled while paused
                    self.accept_ready(token);
                }
            }
            WorkerMsg::CloseListener(token) => {
                if let Some(mut entry) = self.listeners.remove(&token) {
                    if entry.active {
                        let _ = self.poll.registry()
                            .deregister(&mut entry.listener);
                    }
                    debug!("listener {:?} closed", token);
                }
            }
            WorkerMsg::Shutdown(mode) => {
                self.begin_shutdown(mode);
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 2;
        token
    }

    fn attach(&mut self, stream: TcpStream,
        handler: Box<dyn EventHandler>,
        upgrade: Option<Box<dyn SessionUpgrade>>,
        timeout: Option<Duration>, notify: Option<ConnectCallback>,
        connecting: bool)
    {
        if self.state != WorkerState::Running {
            if let Some(cb) = notify {
                cb(Err(HttpError::ShuttingDown));
            }
            return;
        }
        let token = self.alloc_token();
        let mut session = IoSession::new(stream, token,
            Arc::clone(&self.waker), self.queue_capacity);
        session.set_timeout(timeout.or(self.default_timeout));
        let mut entry = SessionEntry {
            session,
            handler,
            upgrade,
            on_connected: notify,
        };
        if connecting {
            entry.session.set_event(EventSet::CONNECT);
        } else if let Err(err) = Worker::ready(&mut entry) {
            entry.handler.exception(&mut entry.session, &err);
            entry.session.close(CloseMode::Immediate);
            return;
        }
        if let Err(e) = entry.session.register(self.poll.registry()) {
            warn!("session {:?}: registration failed: {}", token, e);
            let err = HttpError::Io(e);
            entry.handler.exception(&mut entry.session, &err);
            if let Some(cb) = entry.on_connected.take() {
                cb(Err(err));
            }
            entry.session.close(CloseMode::Immediate);
            return;
        }
        trace!("session {:?}: attached (connecting: {})", token, connecting);
        self.sessions.insert(token, entry);
    }

    fn add_listener(&mut self, token: Token, mut listener: TcpListener,
        factory: HandlerFactory, upgrades: Option<UpgradeFactory>,
        dispatch: Dispatcher)
    {
        if self.state != WorkerState::Running {
            return;
        }
        match self.poll.registry()
            .register(&mut listener, token, Interest::READABLE)
        {
            Ok(()) => {
                debug!("listener {:?} registered", token);
                self.listeners.insert(token, ListenerEntry {
                    listener,
                    factory,
                    upgrades,
                    dispatch,
                    active: true,
                });
            }
            Err(e) => {
                warn!("listener {:?} registration failed: {}", token, e);
                (self.on_error)(&HttpError::Io(e));
            }
        }
    }

    fn accept_ready(&mut self, token: Token) {
        loop {
            let entry = match self.listeners.get_mut(&token) {
                Some(entry) if entry.active => entry,
                _ => return,
            };
            match entry.listener.accept() {
                Ok((stream, peer)) => {
                    trace!("listener {:?}: accepted {}", token, peer);
                    let handler = (entry.factory)(peer);
                    let upgrade =
                        entry.upgrades.as_ref().map(|make| make(peer));
                    let sent =
                        entry.dispatch.dispatch(stream, handler, upgrade);
                    if sent.is_err() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // transient accept errors must not kill the loop
                    warn!("listener {:?}: accept failed: {}", token, e);
                    return;
                }
            }
        }
    }

    /// Run the session's callbacks for the given readiness. Any error
    /// goes to `exception` and closes the session; the loop survives.
    fn dispatch(&mut self, token: Token, ready: EventSet) {
        let entry = match self.sessions.get_mut(&token) {
            Some(entry) => entry,
            None => return,
        };
        if let Err(err) = Worker::drive(entry, ready) {
            entry.handler.exception(&mut entry.session, &err);
            if let Some(cb) = entry.on_connected.take() {
                cb(Err(err));
            }
            entry.session.close(CloseMode::Immediate);
        }
        if entry.session.is_closed() {
            self.remove(token);
        }
    }

    /// The transport is up: run the upgrade (if any), then hand the
    /// session to its handler
    fn ready(entry: &mut SessionEntry) -> Result<(), HttpError> {
        if let Some(mut upgrade) = entry.upgrade.take() {
            upgrade.upgrade(&mut entry.session)?;
        }
        entry.handler.connected(&mut entry.session)
    }

    fn drive(entry: &mut SessionEntry, ready: EventSet)
        -> Result<(), HttpError>
    {
        if entry.session.interest().contains(EventSet::CONNECT)
            && ready.intersects(EventSet::WRITE | EventSet::CONNECT)
        {
            match entry.session.check_connect() {
                Ok(()) => {
                    trace!("session {:?}: connected", entry.session.token());
                    Worker::ready(entry)?;
                    if let Some(cb) = entry.on_connected.take() {
                        cb(Ok(entry.session.handle()));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        if ready.contains(EventSet::READ) && !entry.session.is_closed()
            && entry.session.interest().contains(EventSet::READ)
        {
            entry.handler.input_ready(&mut entry.session)?;
        }
        if ready.contains(EventSet::WRITE) && !entry.session.is_closed()
            && entry.session.interest().contains(EventSet::WRITE)
        {
            entry.handler.output_ready(&mut entry.session)?;
        }
        Ok(())
    }

    fn sweep_timeouts(&mut self, now: Instant) {
        let expired: Vec<Token> = self.sessions.iter()
            .filter(|(_, e)| {
                e.session.deadline().map_or(false, |d| d <= now)
            })
            .map(|(t, _)| *t)
            .collect();
        for token in expired {
            let entry = match self.sessions.get_mut(&token) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.handler.timeout(&mut entry.session) {
                entry.session.touch();
                continue;
            }
            debug!("session {:?}: timed out", token);
            let err = HttpError::Timeout;
            entry.handler.exception(&mut entry.session, &err);
            if let Some(cb) = entry.on_connected.take() {
                cb(Err(err));
            }
            entry.session.close(CloseMode::Immediate);
            self.remove(token);
        }
    }

    fn drain_commands(&mut self) {
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            loop {
                let entry = match self.sessions.get_mut(&token) {
                    Some(entry) => entry,
                    None => break,
                };
                let cmd = match entry.session.queue().pop() {
                    Some(cmd) => cmd,
                    None => break,
                };
                if let Err(err) = cmd.execute(&mut entry.session) {
                    entry.handler.exception(&mut entry.session, &err);
                    entry.session.close(CloseMode::Immediate);
                }
                if entry.session.is_closed() {
                    self.remove(token);
                    break;
                }
            }
        }
    }

    /// Bring poll registrations in line with the interest sets and
    /// dispatch any newly raised bits right away
    fn sync_interests(&mut self) {
        loop {
            let mut raised: Vec<(Token, EventSet)> = Vec::new();
            let mut failed: Vec<(Token, io::Error)> = Vec::new();
            for (token, entry) in self.sessions.iter_mut() {
                match entry.session.sync_interest(self.poll.registry()) {
                    Ok(added) if !added.is_empty() => {
                        raised.push((*token, added));
                    }
                    Ok(_) => {}
                    Err(e) => failed.push((*token, e)),
                }
            }
            for (token, e) in failed {
                warn!("session {:?}: reregister failed: {}", token, e);
                if let Some(entry) = self.sessions.get_mut(&token) {
                    let err = HttpError::Io(e);
                    entry.handler.exception(&mut entry.session, &err);
                    if let Some(cb) = entry.on_connected.take() {
                        cb(Err(err));
                    }
                    entry.session.close(CloseMode::Immediate);
                    self.remove(token);
                }
            }
            if raised.is_empty() {
                return;
            }
            for (token, added) in raised {
                self.dispatch(token, added);
            }
        }
    }

    fn remove(&mut self, token: Token) {
        if let Some(mut entry) = self.sessions.remove(&token) {
            entry.session.deregister(self.poll.registry());
            trace!("session {:?}: removed", token);
        }
    }

    fn begin_shutdown(&mut self, mode: CloseMode) {
        debug!("worker shutdown requested ({:?})", mode);
        let registry = self.poll.registry();
        for (_, mut entry) in self.listeners.drain() {
            if entry.active {
                let _ = registry.deregister(&mut entry.listener);
            }
        }
        match mode {
            CloseMode::Immediate => {
                self.close_all(CloseMode::Immediate);
                self.state = WorkerState::Stopped;
            }
            CloseMode::Graceful => {
                let tokens: Vec<Token> =
                    self.sessions.keys().copied().collect();
                for token in tokens {
                    let entry = match self.sessions.get_mut(&token) {
                        Some(entry) => entry,
                        None => continue,
                    };
                    if entry.on_connected.is_some() {
                        // connects in flight have nothing to flush
                        if let Some(cb) = entry.on_connected.take() {
                            cb(Err(HttpError::ShuttingDown));
                        }
                        entry.session.close(CloseMode::Immediate);
                        self.remove(token);
                    } else {
                        entry.session.close(CloseMode::Graceful);
                    }
                }
                self.state = WorkerState::Draining;
            }
        }
    }

    /// Fire the callbacks of connects still sitting in the channel so
    /// submitters are never left waiting on a dead worker
    fn refuse_pending(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            if let WorkerMsg::Connect { notify, .. } = msg {
                notify(Err(HttpError::ShuttingDown));
            }
        }
    }

    fn close_all(&mut self, mode: CloseMode) {
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            if let Some(entry) = self.sessions.get_mut(&token) {
                if let Some(cb) = entry.on_connected.take() {
                    cb(Err(HttpError::ShuttingDown));
                }
                entry.session.close(mode);
            }
            self.remove(token);
        }
    }
}
