//! Reference-counted lifecycle for a session shared by both device classes
//!
//! Some backends ride one process-wide resource (an access-daemon
//! connection, the x86_adapt driver handle) that both the core and the
//! uncore facet need. The session is established on the first facet acquire
//! and torn down when the last facet releases; teardown is the session
//! value's `Drop`.

use parking_lot::Mutex;

use crate::backend::DeviceClass;
use crate::error::{FreqError, Result};

pub struct FacetSession<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    facets: [bool; DeviceClass::COUNT],
    session: Option<T>,
}

impl<T> FacetSession<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                facets: [false; DeviceClass::COUNT],
                session: None,
            }),
        }
    }

    /// Mark a facet active, connecting first if no session is live.
    ///
    /// A second acquire while the session is live only sets the facet flag;
    /// `connect` runs at most once per session lifetime.
    pub fn acquire(&self, facet: DeviceClass, connect: impl FnOnce() -> Result<T>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            inner.session = Some(connect()?);
            tracing::debug!("shared session established for {} facet", facet.name());
        }
        inner.facets[facet.index()] = true;
        Ok(())
    }

    /// Mark a facet inactive; drops the session when no facet remains.
    ///
    /// Releasing a facet that was never acquired is a no-op.
    pub fn release(&self, facet: DeviceClass) {
        let mut inner = self.inner.lock();
        inner.facets[facet.index()] = false;
        if !inner.facets.iter().any(|active| *active) {
            if inner.session.take().is_some() {
                tracing::debug!("shared session torn down after {} release", facet.name());
            }
        }
    }

    /// Whether a session is currently established.
    pub fn is_active(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Run `f` against the live session.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        match inner.session.as_mut() {
            Some(session) => Ok(f(session)),
            None => Err(FreqError::NotReady("shared session not established".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Probe {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe_session() -> (FacetSession<Probe>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (FacetSession::new(), Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    fn connect(
        connects: &Arc<AtomicUsize>,
        drops: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> Result<Probe> {
        let connects = Arc::clone(connects);
        let drops = Arc::clone(drops);
        move || {
            connects.fetch_add(1, Ordering::SeqCst);
            Ok(Probe { drops })
        }
    }

    #[test]
    fn test_connects_once_for_both_facets() {
        let (session, connects, drops) = probe_session();

        session
            .acquire(DeviceClass::Core, connect(&connects, &drops))
            .unwrap();
        session
            .acquire(DeviceClass::Uncore, connect(&connects, &drops))
            .unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(session.is_active());
    }

    #[test]
    fn test_survives_first_release_tears_down_on_last() {
        let (session, connects, drops) = probe_session();

        session
            .acquire(DeviceClass::Core, connect(&connects, &drops))
            .unwrap();
        session
            .acquire(DeviceClass::Uncore, connect(&connects, &drops))
            .unwrap();

        session.release(DeviceClass::Core);
        assert!(session.is_active());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        session.release(DeviceClass::Uncore);
        assert!(!session.is_active());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let (session, connects, drops) = probe_session();

        session.release(DeviceClass::Uncore);
        assert!(!session.is_active());

        // A live session held by the other facet is untouched
        session
            .acquire(DeviceClass::Core, connect(&connects, &drops))
            .unwrap();
        session.release(DeviceClass::Uncore);
        assert!(session.is_active());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_connect_leaves_facet_inactive() {
        let session: FacetSession<Probe> = FacetSession::new();
        let err = session
            .acquire(DeviceClass::Core, || {
                Err(FreqError::NotFound {
                    path: "/var/run/freqd.sock".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, FreqError::NotFound { .. }));
        assert!(!session.is_active());
        assert!(session.with(|_| ()).is_err());
    }

    #[test]
    fn test_reacquire_after_teardown_reconnects() {
        let (session, connects, drops) = probe_session();

        session
            .acquire(DeviceClass::Core, connect(&connects, &drops))
            .unwrap();
        session.release(DeviceClass::Core);
        session
            .acquire(DeviceClass::Core, connect(&connects, &drops))
            .unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(session.is_active());
    }
}
