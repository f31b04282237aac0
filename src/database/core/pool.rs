//! Bounded session pool
//!
//! The pool opens sessions lazily up to its size and lends them out behind a
//! [`PooledSession`] guard that returns the session on drop. Waiting for a
//! session is bounded by the acquire timeout. Embedded engines run with a pool
//! of one, which serialises every operation against the physical store.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::database::core::backend::BackendKind;
use crate::database::core::connection::Session;
use crate::error::{ConnectionError, ResourceError, StorageError};

/// Opens one new session against the configured store
pub type SessionOpener =
    Box<dyn Fn() -> Result<Box<dyn Session>, ConnectionError> + Send + Sync + 'static>;

struct PoolState {
    idle: Vec<Box<dyn Session>>,
    /// Sessions alive, idle or borrowed
    open: usize,
    borrowed: usize,
    closing: bool,
}

struct PoolInner {
    kind: BackendKind,
    size: usize,
    acquire_timeout: Duration,
    opener: SessionOpener,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Outcome of [`ConnectionPool::drain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Idle sessions closed
    pub closed: usize,
    /// Sessions still borrowed when the timeout expired; they are closed as
    /// soon as their borrower releases them
    pub forced: usize,
}

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        kind: BackendKind,
        size: usize,
        acquire_timeout: Duration,
        opener: SessionOpener,
    ) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                kind,
                size: size.max(1),
                acquire_timeout,
                opener,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    open: 0,
                    borrowed: 0,
                    closing: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.kind
    }

    /// Number of live driver connections, idle or borrowed
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().open
    }

    pub fn borrowed(&self) -> usize {
        self.inner.state.lock().borrowed
    }

    /// Borrow a session, waiting at most the configured acquire timeout
    pub fn acquire(&self) -> Result<PooledSession, StorageError> {
        self.acquire_within(self.inner.acquire_timeout)
    }

    pub fn acquire_within(&self, timeout: Duration) -> Result<PooledSession, StorageError> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = inner.state.lock();

        loop {
            if state.closing {
                return Err(StorageError::NotReady {
                    state: "closing".to_string(),
                });
            }

            if let Some(session) = state.idle.pop() {
                state.borrowed += 1;
                return Ok(PooledSession::new(session, Arc::clone(inner)));
            }

            if state.open < inner.size {
                // reserve the slot before opening outside the lock
                state.open += 1;
                state.borrowed += 1;
                drop(state);

                return match (inner.opener)() {
                    Ok(session) => {
                        debug!("opened {} session", inner.kind.engine());
                        Ok(PooledSession::new(session, Arc::clone(inner)))
                    }
                    Err(e) => {
                        let mut state = inner.state.lock();
                        state.open -= 1;
                        state.borrowed -= 1;
                        inner.available.notify_one();
                        Err(e.into())
                    }
                };
            }

            if inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.idle.is_empty()
                && state.open >= inner.size
            {
                return Err(ResourceError::PoolExhausted {
                    waited: started.elapsed(),
                    size: inner.size,
                }
                .into());
            }
        }
    }

    /// Stop lending sessions, close idle ones, and wait up to `timeout` for
    /// borrowed sessions to come back
    pub fn drain(&self, timeout: Duration) -> DrainReport {
        let deadline = Instant::now() + timeout;
        let mut closed = 0;

        let mut state = self.inner.state.lock();
        state.closing = true;
        self.inner.available.notify_all();

        loop {
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.open -= idle.len();
            closed += idle.len();
            if !idle.is_empty() {
                drop(state);
                for session in idle {
                    session.close();
                }
                state = self.inner.state.lock();
            }

            if state.borrowed == 0 {
                break;
            }
            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }

        let forced = state.borrowed;
        if forced > 0 {
            warn!(
                "{} {} session(s) still borrowed after {:?}; closing them on release",
                forced,
                self.inner.kind.engine(),
                timeout
            );
        }
        DrainReport { closed, forced }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let idle: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.closing = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.open -= idle.len();
            idle
        };
        for session in idle {
            session.close();
        }
    }
}

/// A session on loan from the pool
pub struct PooledSession {
    session: Option<Box<dyn Session>>,
    pool: Arc<PoolInner>,
    broken: bool,
}

impl PooledSession {
    fn new(session: Box<dyn Session>, pool: Arc<PoolInner>) -> Self {
        PooledSession {
            session: Some(session),
            pool,
            broken: false,
        }
    }

    /// Discard this session on release instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.as_ref(),
            None => unreachable!("session is only taken on drop"),
        }
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(session) => session.as_mut(),
            None => unreachable!("session is only taken on drop"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let mut state = self.pool.state.lock();
        state.borrowed -= 1;
        if self.broken || state.closing {
            state.open -= 1;
            let closing = state.closing;
            drop(state);
            session.close();
            if closing {
                self.pool.available.notify_all();
            } else {
                self.pool.available.notify_one();
            }
        } else {
            state.idle.push(session);
            drop(state);
            self.pool.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::connection::{Param, Row};
    use crate::error::QueryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Dummy {
        closed: Arc<AtomicUsize>,
    }

    impl Session for Dummy {
        fn backend(&self) -> BackendKind {
            BackendKind::NetworkedEngineB
        }
        fn execute(&mut self, _sql: &str, _params: &[Param]) -> Result<u64, QueryError> {
            Ok(1)
        }
        fn query(
            &mut self,
            _sql: &str,
            _params: &[Param],
            _columns: usize,
        ) -> Result<Vec<Row>, QueryError> {
            Ok(vec![])
        }
        fn execute_batch(&mut self, _sql: &str) -> Result<(), QueryError> {
            Ok(())
        }
        fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(size: usize, timeout: Duration) -> (ConnectionPool, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (o, c) = (Arc::clone(&opened), Arc::clone(&closed));
        let opener: SessionOpener = Box::new(move || {
            o.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Dummy {
                closed: Arc::clone(&c),
            }) as Box<dyn Session>)
        });
        (
            ConnectionPool::new(BackendKind::NetworkedEngineB, size, timeout, opener),
            opened,
            closed,
        )
    }

    #[test]
    fn test_sessions_are_reused() {
        let (pool, opened, _) = pool(2, Duration::from_millis(100));
        for _ in 0..5 {
            let mut session = pool.acquire().unwrap();
            session.execute("SELECT 1", &[]).unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_connections(), 1);
        assert_eq!(pool.borrowed(), 0);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let (pool, _, _) = pool(1, Duration::from_millis(50));
        let _held = pool.acquire().unwrap();
        match pool.acquire() {
            Err(StorageError::Resource(ResourceError::PoolExhausted { size, .. })) => {
                assert_eq!(size, 1)
            }
            other => panic!("expected PoolExhausted, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_waiter_succeeds_when_session_returns() {
        let (pool, _, _) = pool(1, Duration::from_secs(5));
        let pool = Arc::new(pool);
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|_| ()).is_ok())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);

        assert!(waiter.join().unwrap());
        assert_eq!(pool.open_connections(), 1);
    }

    #[test]
    fn test_broken_session_is_discarded() {
        let (pool, opened, closed) = pool(1, Duration::from_millis(100));
        {
            let mut session = pool.acquire().unwrap();
            session.mark_broken();
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_connections(), 0);
        let _session = pool.acquire().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drain_closes_everything() {
        let (pool, _, closed) = pool(3, Duration::from_millis(100));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.open_connections(), 2);

        let report = pool.drain(Duration::from_millis(100));
        assert_eq!(report, DrainReport { closed: 2, forced: 0 });
        assert_eq!(pool.open_connections(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(matches!(
            pool.acquire(),
            Err(StorageError::NotReady { .. })
        ));
    }

    #[test]
    fn test_drain_forces_borrowed_sessions() {
        let (pool, _, closed) = pool(1, Duration::from_millis(100));
        let held = pool.acquire().unwrap();
        let report = pool.drain(Duration::from_millis(20));
        assert_eq!(report.forced, 1);
        assert_eq!(pool.open_connections(), 1);

        drop(held);
        assert_eq!(pool.open_connections(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_open_releases_slot() {
        let opener: SessionOpener = Box::new(|| {
            Err(ConnectionError::Unreachable {
                backend: BackendKind::NetworkedEngineA,
                target: "nowhere:3306/db".to_string(),
                reason: "refused".to_string(),
            })
        });
        let pool = ConnectionPool::new(
            BackendKind::NetworkedEngineA,
            1,
            Duration::from_millis(10),
            opener,
        );
        assert!(matches!(
            pool.acquire(),
            Err(StorageError::Connection(ConnectionError::Unreachable { .. }))
        ));
        assert_eq!(pool.open_connections(), 0);
        assert_eq!(pool.borrowed(), 0);
    }
}
