//! Client-side session pooling.
//!
//! Sessions are pooled per remote address. A lease either reuses an
//! idle session, joins a connect already in flight for that address,
//! or starts a new one; concurrent leases for the same address never
//! race into parallel connects. Both the connected session and a
//! connect failure fan out to every waiter in arrival order.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::HttpError;
use crate::reactor::pool::ReactorPool;
use crate::reactor::ConnectCallback;
use crate::session::{CloseMode, EventHandler, SessionHandle};

/// Starts a non-blocking connect, reporting the result through the
/// callback exactly once. [`ReactorPool`] is the real implementation.
pub trait Connect: Send + Sync {
    fn connect(&self, addr: SocketAddr, timeout: Option<Duration>,
        handler: Box<dyn EventHandler>, notify: ConnectCallback)
        -> Result<(), HttpError>;
}

impl Connect for ReactorPool {
    fn connect(&self, addr: SocketAddr, timeout: Option<Duration>,
        handler: Box<dyn EventHandler>, notify: ConnectCallback)
        -> Result<(), HttpError>
    {
        self.connect_cb(addr, timeout, handler, notify)
    }
}

/// Called exactly once with the outcome of a lease
pub type LeaseCallback =
    Box<dyn FnOnce(Result<SessionHandle, HttpError>) + Send>;

/// Creates the per-connection event handler for pooled sessions
pub type PoolHandlerFactory =
    Box<dyn Fn(SocketAddr) -> Box<dyn EventHandler> + Send + Sync>;

/// Decides whether an idle session is still fit to lease out
pub type SessionValidator = Box<dyn Fn(&SessionHandle) -> bool + Send + Sync>;

pub struct PoolConfig {
    /// Default deadline for connects the pool starts; a lease may
    /// override it per call
    pub connect_timeout: Option<Duration>,
    /// Extra validation on top of the session-still-open check
    pub validate: Option<SessionValidator>,
    /// Leases queued behind one connect; the newest lease past the cap
    /// fails with `QueueFull` instead of growing the queue
    pub max_waiters: usize,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            connect_timeout: Some(Duration::from_secs(10)),
            validate: None,
            max_waiters: 32,
        }
    }
}

#[derive(Default)]
struct PoolEntry {
    idle: Option<(SessionHandle, Instant)>,
    connecting: bool,
    waiters: VecDeque<LeaseCallback>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub connecting: usize,
    pub waiting: usize,
}

struct PoolInner {
    connector: Arc<dyn Connect>,
    factory: PoolHandlerFactory,
    entries: Mutex<HashMap<SocketAddr, PoolEntry>>,
    connect_timeout: Option<Duration>,
    validate: Option<SessionValidator>,
    max_waiters: usize,
    closed: AtomicBool,
}

impl PoolInner {
    fn usable(&self, handle: &SessionHandle) -> bool {
        handle.is_open()
            && self.validate.as_ref().map_or(true, |check| check(handle))
    }
}

/// A shareable pool of client sessions keyed by remote address
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn Connect>, factory: PoolHandlerFactory,
        config: PoolConfig) -> SessionPool
    {
        SessionPool {
            inner: Arc::new(PoolInner {
                connector,
                factory,
                entries: Mutex::new(HashMap::new()),
                connect_timeout: config.connect_timeout,
                validate: config.validate,
                max_waiters: config.max_waiters,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Lease a session for `addr`. The callback fires with an idle
    /// session right away, or once the (possibly shared) connect for
    /// that address resolves. `timeout` bounds a connect this lease
    /// starts; joined leases share the deadline of the connect already
    /// in flight.
    pub fn get_session(&self, addr: SocketAddr, timeout: Option<Duration>,
        cb: LeaseCallback)
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            cb(Err(HttpError::ShuttingDown));
            return;
        }
        enum Action {
            Leased(SessionHandle, LeaseCallback),
            Refused(LeaseCallback),
            StartConnect,
            Joined,
        }
        let action = {
            let mut entries =
                self.inner.entries.lock().expect("session pool poisoned");
            let entry = entries.entry(addr).or_default();
            // an idle session may have died since it was parked
            let valid = match entry.idle.take() {
                Some((handle, _)) if self.inner.usable(&handle) => {
                    Some(handle)
                }
                Some((handle, _)) => {
                    trace!("discarding unusable idle session for {}", addr);
                    handle.request_close(CloseMode::Graceful);
                    None
                }
                None => None,
            };
            match valid {
                Some(handle) => Action::Leased(handle, cb),
                None if entry.waiters.len() >= self.inner.max_waiters => {
                    Action::Refused(cb)
                }
                None => {
                    entry.waiters.push_back(cb);
                    if entry.connecting {
                        Action::Joined
                    } else {
                        entry.connecting = true;
                        Action::StartConnect
                    }
                }
            }
        };
        match action {
            Action::Leased(handle, cb) => {
                trace!("leased idle session for {}", addr);
                cb(Ok(handle));
            }
            Action::Refused(cb) => {
                debug!("waiter queue for {} is full, lease refused", addr);
                cb(Err(HttpError::QueueFull));
            }
            Action::Joined => {
                trace!("joined connect in flight for {}", addr);
            }
            Action::StartConnect => {
                debug!("connecting to {}", addr);
                let inner = Arc::clone(&self.inner);
                let notify: ConnectCallback = Box::new(move |result| {
                    SessionPool::connect_done(&inner, addr, result);
                });
                let handler = (self.inner.factory)(addr);
                // a synchronous failure is reported via the callback
                let _ = self.inner.connector.connect(addr,
                    timeout.or(self.inner.connect_timeout), handler,
                    notify);
            }
        }
    }

    /// Fan the connect outcome out to everything queued behind it
    fn connect_done(inner: &Arc<PoolInner>, addr: SocketAddr,
        result: Result<SessionHandle, HttpError>)
    {
        if inner.closed.load(Ordering::SeqCst) {
            // the pool was closed while this connect was in flight; a
            // session parked now would never be reaped
            let waiters: Vec<LeaseCallback> = {
                let mut entries =
                    inner.entries.lock().expect("session pool poisoned");
                entries.remove(&addr)
                    .map(|mut e| e.waiters.drain(..).collect())
                    .unwrap_or_default()
            };
            if let Ok(handle) = result {
                handle.request_close(CloseMode::Immediate);
            }
            for cb in waiters {
                cb(Err(HttpError::Cancelled));
            }
            return;
        }
        let waiters = {
            let mut entries =
                inner.entries.lock().expect("session pool poisoned");
            let entry = entries.entry(addr).or_default();
            entry.connecting = false;
            let waiters: Vec<LeaseCallback> =
                entry.waiters.drain(..).collect();
            if waiters.is_empty() {
                // everyone was served from a release in the meantime
                if let Ok(ref handle) = result {
                    entry.idle = Some((handle.clone(), Instant::now()));
                }
                Vec::new()
            } else {
                waiters
            }
        };
        match &result {
            Ok(_) => debug!("connected to {}, {} waiters served",
                addr, waiters.len()),
            Err(e) => debug!("connect to {} failed: {}", addr, e),
        }
        for cb in waiters {
            cb(result.clone());
        }
    }

    /// Hand a leased session back. A reusable open session goes to the
    /// next waiter or parks as idle; anything else is closed.
    pub fn release(&self, addr: SocketAddr, handle: SessionHandle,
        reusable: bool)
    {
        if !reusable || !self.inner.usable(&handle)
            || self.inner.closed.load(Ordering::SeqCst)
        {
            handle.request_close(CloseMode::Graceful);
            return;
        }
        let handoff = {
            let mut entries =
                self.inner.entries.lock().expect("session pool poisoned");
            let entry = entries.entry(addr).or_default();
            match entry.waiters.pop_front() {
                Some(cb) => Some(cb),
                None => {
                    entry.idle = Some((handle.clone(), Instant::now()));
                    None
                }
            }
        };
        if let Some(cb) = handoff {
            trace!("released session for {} handed to a waiter", addr);
            cb(Ok(handle));
        }
    }

    /// Close idle sessions that have been parked longer than `max_idle`
    pub fn close_idle(&self, max_idle: Duration) {
        let stale: Vec<SessionHandle> = {
            let mut entries =
                self.inner.entries.lock().expect("session pool poisoned");
            let now = Instant::now();
            let mut stale = Vec::new();
            for entry in entries.values_mut() {
                let expired = entry.idle.as_ref()
                    .map_or(false, |(_, since)| now - *since >= max_idle);
                if expired {
                    if let Some((handle, _)) = entry.idle.take() {
                        stale.push(handle);
                    }
                }
            }
            stale
        };
        for handle in stale {
            handle.request_close(CloseMode::Graceful);
        }
    }

    /// Shut the pool down: idle sessions close, queued waiters are
    /// cancelled, later leases fail fast
    pub fn close(&self, mode: CloseMode) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let (handles, waiters) = {
            let mut entries =
                self.inner.entries.lock().expect("session pool poisoned");
            let mut handles = Vec::new();
            let mut waiters = Vec::new();
            for (_, mut entry) in entries.drain() {
                if let Some((handle, _)) = entry.idle.take() {
                    handles.push(handle);
                }
                waiters.extend(entry.waiters.drain(..));
            }
            (handles, waiters)
        };
        debug!("session pool closed, {} idle dropped, {} waiters cancelled",
            handles.len(), waiters.len());
        for handle in handles {
            handle.request_close(mode);
        }
        for cb in waiters {
            cb(Err(HttpError::Cancelled));
        }
    }

    pub fn stats(&self) -> PoolStats {
        let entries =
            self.inner.entries.lock().expect("session pool poisoned");
        let mut stats = PoolStats::default();
        for entry in entries.values() {
            if entry.idle.is_some() {
                stats.idle += 1;
            }
            if entry.connecting {
                stats.connecting += 1;
            }
            stats.waiting += entry.waiters.len();
        }
        stats
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use mio::{Poll, Token, Waker};

    use crate::error::HttpError;
    use crate::reactor::ConnectCallback;
    use crate::session::{CloseMode, EventHandler, IoSession,
                         SessionHandle};
    use super::{Connect, PoolConfig, SessionPool};

    /// Connector that parks callbacks until the test resolves them
    struct ManualConnector {
        calls: AtomicUsize,
        pending: Mutex<Vec<ConnectCallback>>,
    }

    impl ManualConnector {
        fn new() -> Arc<ManualConnector> {
            Arc::new(ManualConnector {
                calls: AtomicUsize::new(0),
                pending: Mutex::new(Vec::new()),
            })
        }

        fn resolve(&self, result: Result<SessionHandle, HttpError>) {
            let cb = self.pending.lock().unwrap().remove(0);
            cb(result);
        }
    }

    impl Connect for ManualConnector {
        fn connect(&self, _addr: SocketAddr, _timeout: Option<Duration>,
            _handler: Box<dyn EventHandler>, notify: ConnectCallback)
            -> Result<(), HttpError>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pending.lock().unwrap().push(notify);
            Ok(())
        }
    }

    struct Null;
    impl EventHandler for Null {
        fn connected(&mut self, _s: &mut IoSession)
            -> Result<(), HttpError>
        {
            Ok(())
        }
        fn input_ready(&mut self, _s: &mut IoSession)
            -> Result<(), HttpError>
        {
            Ok(())
        }
        fn output_ready(&mut self, _s: &mut IoSession)
            -> Result<(), HttpError>
        {
            Ok(())
        }
    }

    fn pool(connector: &Arc<ManualConnector>) -> SessionPool {
        SessionPool::new(
            Arc::clone(connector) as Arc<dyn Connect>,
            Box::new(|_| Box::new(Null)),
            PoolConfig::default(),
        )
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    /// A handle backed by a real socket so `is_open` behaves; the
    /// session itself never joins a reactor
    fn test_handle() -> SessionHandle {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream =
            mio::net::TcpStream::connect(listener.local_addr().unwrap())
                .unwrap();
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let session = IoSession::new(stream, Token(2), waker, 8);
        session.handle()
    }

    type Results = Arc<Mutex<Vec<Result<SessionHandle, HttpError>>>>;

    fn lease(pool: &SessionPool, results: &Results) {
        let results = Arc::clone(results);
        pool.get_session(addr(), None, Box::new(move |r| {
            results.lock().unwrap().push(r);
        }));
    }

    #[test]
    fn concurrent_leases_share_one_connect() {
        let connector = ManualConnector::new();
        let pool = pool(&connector);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            lease(&pool, &results);
        }
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().waiting, 3);

        connector.resolve(Ok(test_handle()));
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 3);
        let token = results[0].as_ref().unwrap().token();
        for r in results.iter() {
            assert_eq!(r.as_ref().unwrap().token(), token);
        }
    }

    #[test]
    fn connect_failure_fans_out_to_all_waiters() {
        let connector = ManualConnector::new();
        let pool = pool(&connector);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        lease(&pool, &results);
        lease(&pool, &results);

        connector.resolve(Err(HttpError::Timeout));
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        for r in results.iter() {
            assert!(matches!(r, Err(HttpError::Timeout)));
        }
    }

    #[test]
    fn released_session_is_reused_without_connecting() {
        let connector = ManualConnector::new();
        let pool = pool(&connector);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        lease(&pool, &results);
        connector.resolve(Ok(test_handle()));
        let handle = results.lock().unwrap().remove(0).unwrap();

        pool.release(addr(), handle, true);
        assert_eq!(pool.stats().idle, 1);
        lease(&pool, &results);
        // served from the idle slot, no second connect
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert!(results.lock().unwrap()[0].is_ok());
    }

    #[test]
    fn non_reusable_release_discards_the_session() {
        let connector = ManualConnector::new();
        let pool = pool(&connector);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        lease(&pool, &results);
        connector.resolve(Ok(test_handle()));
        let handle = results.lock().unwrap().remove(0).unwrap();

        pool.release(addr(), handle, false);
        assert_eq!(pool.stats().idle, 0);
        lease(&pool, &results);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_hands_straight_to_a_waiter() {
        let connector = ManualConnector::new();
        let pool = pool(&connector);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        lease(&pool, &results);
        connector.resolve(Ok(test_handle()));
        let handle = results.lock().unwrap().remove(0).unwrap();

        // second lease goes into the queue behind a fresh connect
        lease(&pool, &results);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
        pool.release(addr(), handle, true);
        assert_eq!(results.lock().unwrap().len(), 1);
        assert!(results.lock().unwrap()[0].is_ok());
        assert_eq!(pool.stats().waiting, 0);
    }

    #[test]
    fn failed_validation_discards_the_idle_session() {
        let connector = ManualConnector::new();
        let pool = SessionPool::new(
            Arc::clone(&connector) as Arc<dyn Connect>,
            Box::new(|_| Box::new(Null)),
            super::PoolConfig {
                validate: Some(Box::new(|_| false)),
                ..Default::default()
            },
        );
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        lease(&pool, &results);
        connector.resolve(Ok(test_handle()));
        let handle = results.lock().unwrap().remove(0).unwrap();

        // release already applies the validator, so nothing is parked
        pool.release(addr(), handle, true);
        assert_eq!(pool.stats().idle, 0);
        lease(&pool, &results);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_cancels_waiters_and_fails_later_leases() {
        let connector = ManualConnector::new();
        let pool = pool(&connector);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        lease(&pool, &results);

        pool.close(CloseMode::Immediate);
        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert!(matches!(results[0], Err(HttpError::Cancelled)));
        }
        lease(&pool, &results);
        assert!(matches!(results.lock().unwrap()[1],
            Err(HttpError::ShuttingDown)));
    }

    #[test]
    fn connect_resolving_after_close_is_not_parked() {
        let connector = ManualConnector::new();
        let pool = pool(&connector);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        lease(&pool, &results);

        pool.close(CloseMode::Immediate);
        assert!(matches!(results.lock().unwrap()[0],
            Err(HttpError::Cancelled)));

        // the in-flight connect resolves into a closed pool
        connector.resolve(Ok(test_handle()));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().waiting, 0);
        assert_eq!(pool.stats().connecting, 0);
    }

    #[test]
    fn waiter_queue_overflow_fails_newest_lease() {
        let connector = ManualConnector::new();
        let pool = SessionPool::new(
            Arc::clone(&connector) as Arc<dyn Connect>,
            Box::new(|_| Box::new(Null)),
            super::PoolConfig { max_waiters: 2, ..Default::default() },
        );
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            lease(&pool, &results);
        }
        // still one physical connect; the third lease is refused
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().waiting, 2);
        {
            let results = results.lock().unwrap();
            assert_eq!(results.len(), 1);
            assert!(matches!(results[0], Err(HttpError::QueueFull)));
        }

        connector.resolve(Ok(test_handle()));
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[1].is_ok());
        assert!(results[2].is_ok());
    }

    #[test]
    fn close_idle_reaps_parked_sessions() {
        let connector = ManualConnector::new();
        let pool = pool(&connector);
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        lease(&pool, &results);
        connector.resolve(Ok(test_handle()));
        let handle = results.lock().unwrap().remove(0).unwrap();
        pool.release(addr(), handle, true);
        assert_eq!(pool.stats().idle, 1);

        pool.close_idle(Duration::from_secs(0));
        assert_eq!(pool.stats().idle, 0);
    }
}
