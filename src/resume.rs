//! Pluggable policy deciding where suspended coroutines resume.
//!
//! The kernel never resumes a parked coroutine directly. Whenever a signal
//! emission, a tasklet completion or a worker-thread result wants to wake an
//! awaiter, it hands the frame's [Coro] token to the thread's installed
//! [Resumer]. The default [SyncResumer] steps the coroutine in place; an
//! event loop installs a queueing policy instead and calls [Coro::resume] on
//! its own scheduling thread. That queueing policy is what makes
//! worker-thread completions safe to consume from single-threaded coroutines.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use static_assertions::{assert_impl_all, assert_not_impl_any};

pub(crate) trait Step {
    fn step(self: Arc<Self>);
    fn coro_id(&self) -> u64;
}

/// Resume token for one suspended coroutine frame.
pub struct Coro {
    frame: Arc<dyn Step>,
}

// SAFETY: the token is an atomically refcounted pointer, so it may travel to
// a worker thread and back inside a queueing resumer. The frame behind it is
// single-threaded; the contract is that `resume` runs on the thread that owns
// the frame.
unsafe impl Send for Coro {}

assert_impl_all!(Coro: Send);

impl Coro {
    pub(crate) fn new(frame: Arc<dyn Step>) -> Coro {
        Coro { frame }
    }

    /// Identifier of the underlying coroutine frame.
    pub fn id(&self) -> u64 {
        self.frame.coro_id()
    }

    /// Steps the coroutine once.
    ///
    /// Must run on the thread that owns the frame.
    pub fn resume(self) {
        self.frame.step()
    }
}

impl fmt::Debug for Coro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coro({})", self.id())
    }
}

/// Host hook invoked whenever the kernel wants to resume a suspended
/// coroutine.
///
/// `resume` must eventually cause [Coro::resume] to run on the thread owning
/// the frame; it may do so synchronously. The registration hooks fire on
/// tasklet construction and destruction and default to no-ops for hosts that
/// do not track coroutine liveness.
pub trait Resumer: Send + Sync {
    fn resume(&self, coro: Coro);

    fn register_coro(&self, _coro: &Coro) {}

    fn deregister_coro(&self, _coro: &Coro) {}
}

/// Default policy: resume in place, on the calling thread.
///
/// Suitable for single-threaded programs with no worker-thread producers.
pub struct SyncResumer;

impl Resumer for SyncResumer {
    fn resume(&self, coro: Coro) {
        coro.resume();
    }
}

thread_local! {
    static INSTALLED: RefCell<Vec<Arc<dyn Resumer>>> = RefCell::new(Vec::new());
}

/// Installs `resumer` as the calling thread's resume policy and returns a
/// guard restoring the previous policy on drop. Guards nest.
///
/// Tasklets capture the installed policy at construction, so a host loop
/// installs its policy before creating the coroutines it will drive.
pub fn install(resumer: Arc<dyn Resumer>) -> ResumerGuard {
    INSTALLED.with(|stack| stack.borrow_mut().push(resumer));
    ResumerGuard { marker: PhantomData }
}

/// Scope guard for an [install]ed resume policy.
pub struct ResumerGuard {
    marker: PhantomData<Rc<()>>,
}

assert_not_impl_any!(ResumerGuard: Send, Sync);

impl Drop for ResumerGuard {
    fn drop(&mut self) {
        INSTALLED.with(|stack| {
            stack.borrow_mut().pop().expect("no resume policy installed");
        });
    }
}

pub(crate) fn current() -> Arc<dyn Resumer> {
    INSTALLED.with(|stack| stack.borrow().last().cloned()).unwrap_or_else(synchronous)
}

fn synchronous() -> Arc<dyn Resumer> {
    static SYNC: OnceLock<Arc<SyncResumer>> = OnceLock::new();
    SYNC.get_or_init(|| Arc::new(SyncResumer)).clone()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    struct Probe {
        hits: AtomicUsize,
    }

    impl Resumer for Probe {
        fn resume(&self, coro: Coro) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            coro.resume();
        }
    }

    #[test]
    fn default_is_synchronous() {
        let policy = current();
        // The fallback is process-wide and shared.
        assert!(Arc::ptr_eq(&policy, &current()));
    }

    #[test]
    fn install_nests_and_restores() {
        let outer = Arc::new(Probe { hits: AtomicUsize::new(0) });
        let inner = Arc::new(Probe { hits: AtomicUsize::new(0) });
        let default = current();
        {
            let _outer = install(outer.clone());
            assert!(Arc::ptr_eq(&current(), &(outer.clone() as Arc<dyn Resumer>)));
            {
                let _inner = install(inner.clone());
                assert!(Arc::ptr_eq(&current(), &(inner.clone() as Arc<dyn Resumer>)));
            }
            assert!(Arc::ptr_eq(&current(), &(outer.clone() as Arc<dyn Resumer>)));
        }
        assert!(Arc::ptr_eq(&current(), &default));
        assert_eq!(outer.hits.load(Ordering::Relaxed), 0);
        assert_eq!(inner.hits.load(Ordering::Relaxed), 0);
    }
}
