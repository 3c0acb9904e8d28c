//! The worker pool and its thread-safe front door.

use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Poll, Token, Waker};

use crate::error::HttpError;
use crate::reactor::{ConnectCallback, Dispatcher, ErrorListener,
                     HandlerFactory, ReactorConfig, UpgradeFactory, Worker,
                     WorkerLink, WorkerMsg, WAKER};
use crate::session::{CloseMode, EventHandler, SessionHandle,
                     SessionUpgrade};

/// Picks the worker a new connect or listener is assigned to
pub trait WorkerSelector: Send + Sync {
    fn pick(&self, workers: usize) -> usize;
}

struct RoundRobin(AtomicUsize);

impl WorkerSelector for RoundRobin {
    fn pick(&self, workers: usize) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed) % workers
    }
}

/// A fixed set of reactor workers plus the operations other threads
/// use to feed them sockets
pub struct ReactorPool {
    links: Arc<Vec<WorkerLink>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    selector: Box<dyn WorkerSelector>,
    listener_ids: AtomicUsize,
    accept_rr: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl ReactorPool {
    pub fn new(config: ReactorConfig) -> io::Result<ReactorPool> {
        let on_error: ErrorListener =
            Arc::new(|err| warn!("reactor error: {}", err));
        ReactorPool::with_error_listener(config, on_error)
    }

    pub fn with_error_listener(config: ReactorConfig,
        on_error: ErrorListener) -> io::Result<ReactorPool>
    {
        let workers = config.workers.max(1);
        let mut links = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
            let (tx, rx) = mpsc::channel();
            let worker = Worker::new(poll, rx, Arc::clone(&waker),
                &config, Arc::clone(&on_error));
            let handle = thread::Builder::new()
                .name(format!("http-reactor-{}", i))
                .spawn(move || worker.run())?;
            links.push(WorkerLink::new(tx, waker));
            threads.push(handle);
        }
        debug!("reactor pool started with {} workers", workers);
        Ok(ReactorPool {
            links: Arc::new(links),
            threads: Mutex::new(threads),
            selector: Box::new(RoundRobin(AtomicUsize::new(0))),
            listener_ids: AtomicUsize::new(0),
            accept_rr: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_selector(&mut self, selector: Box<dyn WorkerSelector>) {
        self.selector = selector;
    }

    fn link(&self) -> &WorkerLink {
        &self.links[self.selector.pick(self.links.len())]
    }

    /// Start a non-blocking connect and adopt the socket on a worker.
    /// The returned future resolves once the transport is up (or the
    /// connect failed or timed out).
    pub fn connect(&self, addr: SocketAddr, timeout: Option<Duration>,
        handler: Box<dyn EventHandler>)
        -> Result<SessionFuture, HttpError>
    {
        let future = SessionFuture::new();
        self.connect_cb(addr, timeout, handler, future.completer())?;
        Ok(future)
    }

    /// Like [`connect`](ReactorPool::connect), with a transport
    /// upgrade applied before the handler attaches
    pub fn connect_upgraded(&self, addr: SocketAddr,
        timeout: Option<Duration>, upgrade: Box<dyn SessionUpgrade>,
        handler: Box<dyn EventHandler>)
        -> Result<SessionFuture, HttpError>
    {
        let future = SessionFuture::new();
        self.start_connect(addr, timeout, handler, Some(upgrade),
            future.completer())?;
        Ok(future)
    }

    /// Callback flavor of [`connect`](ReactorPool::connect); the
    /// callback fires exactly once, on the worker thread
    pub fn connect_cb(&self, addr: SocketAddr, timeout: Option<Duration>,
        handler: Box<dyn EventHandler>, notify: ConnectCallback)
        -> Result<(), HttpError>
    {
        self.start_connect(addr, timeout, handler, None, notify)
    }

    fn start_connect(&self, addr: SocketAddr, timeout: Option<Duration>,
        handler: Box<dyn EventHandler>,
        upgrade: Option<Box<dyn SessionUpgrade>>, notify: ConnectCallback)
        -> Result<(), HttpError>
    {
        if self.closed.load(Ordering::SeqCst) {
            notify(Err(HttpError::ShuttingDown));
            return Err(HttpError::ShuttingDown);
        }
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                let err = HttpError::Io(e);
                notify(Err(err.clone()));
                return Err(err);
            }
        };
        let sent = self.link().send_recover(WorkerMsg::Connect {
            stream,
            handler,
            upgrade,
            timeout,
            notify,
        });
        match sent {
            Ok(()) => Ok(()),
            Err(WorkerMsg::Connect { notify, .. }) => {
                notify(Err(HttpError::ShuttingDown));
                Err(HttpError::ShuttingDown)
            }
            Err(_) => Err(HttpError::ShuttingDown),
        }
    }

    /// Bind a listening socket and hand it to a worker. Accepted
    /// connections are spread over all workers round-robin, each with
    /// a handler from `factory`.
    pub fn listen(&self, addr: SocketAddr, factory: HandlerFactory)
        -> Result<ListenerHandle, HttpError>
    {
        self.start_listen(addr, factory, None)
    }

    /// Like [`listen`](ReactorPool::listen), applying a transport
    /// upgrade from `upgrades` to every accepted connection
    pub fn listen_upgraded(&self, addr: SocketAddr,
        factory: HandlerFactory, upgrades: UpgradeFactory)
        -> Result<ListenerHandle, HttpError>
    {
        self.start_listen(addr, factory, Some(upgrades))
    }

    fn start_listen(&self, addr: SocketAddr, factory: HandlerFactory,
        upgrades: Option<UpgradeFactory>)
        -> Result<ListenerHandle, HttpError>
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HttpError::ShuttingDown);
        }
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        // odd tokens so they never collide with worker session tokens
        let token =
            Token(self.listener_ids.fetch_add(1, Ordering::SeqCst) * 2 + 1);
        let dispatch = Dispatcher::new(Arc::clone(&self.links),
            Arc::clone(&self.accept_rr));
        let link = self.link().clone();
        link.send(WorkerMsg::Listen {
            token,
            listener,
            factory,
            upgrades,
            dispatch,
        })?;
        debug!("listening on {}", local_addr);
        Ok(ListenerHandle { token, link, local_addr })
    }

    /// Stop the pool. Graceful lets sessions flush buffered output
    /// first; immediate drops everything. Joins the worker threads.
    pub fn shutdown(&self, mode: CloseMode) {
        self.closed.store(true, Ordering::SeqCst);
        for link in self.links.iter() {
            let _ = link.send(WorkerMsg::Shutdown(mode));
        }
        let threads = mem::take(
            &mut *self.threads.lock().expect("reactor pool poisoned"));
        for handle in threads {
            let _ = handle.join();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.shutdown(CloseMode::Immediate);
        }
    }
}

/// Remote control for a bound listener
pub struct ListenerHandle {
    token: Token,
    link: WorkerLink,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// The actually bound address (port resolved for `:0` binds)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting; pending backlog stays queued in the kernel
    pub fn pause(&self) -> Result<(), HttpError> {
        self.link.send(WorkerMsg::PauseListener(self.token))
    }

    pub fn resume(&self) -> Result<(), HttpError> {
        self.link.send(WorkerMsg::ResumeListener(self.token))
    }

    pub fn close(&self) -> Result<(), HttpError> {
        self.link.send(WorkerMsg::CloseListener(self.token))
    }
}

struct FutureState {
    result: Option<Result<SessionHandle, HttpError>>,
    cancelled: bool,
}

struct FutureShared {
    state: Mutex<FutureState>,
    cond: Condvar,
}

/// Blocks a submitting thread until its connect resolves.
///
/// Cancellation is cooperative: a session that connects after `cancel`
/// is closed immediately and the future resolves to `Cancelled`.
pub struct SessionFuture {
    shared: Arc<FutureShared>,
}

impl SessionFuture {
    fn new() -> SessionFuture {
        SessionFuture {
            shared: Arc::new(FutureShared {
                state: Mutex::new(FutureState {
                    result: None,
                    cancelled: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    fn completer(&self) -> ConnectCallback {
        let shared = Arc::clone(&self.shared);
        Box::new(move |result| {
            let mut st = shared.state.lock().expect("future poisoned");
            if st.cancelled {
                if let Ok(handle) = result {
                    handle.request_close(CloseMode::Immediate);
                }
                st.result = Some(Err(HttpError::Cancelled));
            } else {
                st.result = Some(result);
            }
            shared.cond.notify_all();
        })
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().expect("future poisoned").result.is_some()
    }

    /// Block until the connect resolves
    pub fn wait(&self) -> Result<SessionHandle, HttpError> {
        let mut st = self.shared.state.lock().expect("future poisoned");
        loop {
            if let Some(ref result) = st.result {
                return result.clone();
            }
            st = self.shared.cond.wait(st).expect("future poisoned");
        }
    }

    /// Block until the connect resolves or the wait itself times out
    pub fn wait_timeout(&self, timeout: Duration)
        -> Result<SessionHandle, HttpError>
    {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock().expect("future poisoned");
        loop {
            if let Some(ref result) = st.result {
                return result.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HttpError::Timeout);
            }
            let (guard, _) = self.shared.cond
                .wait_timeout(st, deadline - now)
                .expect("future poisoned");
            st = guard;
        }
    }

    /// Give up on the connect. A handle delivered before the cancel is
    /// closed; waiters see `Cancelled`.
    pub fn cancel(&self) {
        let mut st = self.shared.state.lock().expect("future poisoned");
        st.cancelled = true;
        if let Some(Ok(ref handle)) = st.result {
            handle.request_close(CloseMode::Immediate);
        }
        st.result = Some(Err(HttpError::Cancelled));
        self.shared.cond.notify_all();
    }
}

impl fmt::Debug for SessionFuture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionFuture")
            .field("done", &self.is_done())
            .finish()
    }
}
