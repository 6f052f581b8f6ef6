//! Awaitable adapter for blocking calls, backed by a worker thread.
//!
//! This is the only place the kernel crosses thread boundaries. The worker
//! and the consumer share one mutex-guarded slot pair: the worker's final
//! action stores the result and takes any parked waker; the consumer's poll
//! re-checks the result under the same mutex before parking. Consuming the
//! result, or dropping the adapter, joins the worker.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;

use ignore_result::Ignore;
use static_assertions::assert_impl_all;

use crate::error::TaskError;

struct Slot<V> {
    result: Option<Result<V, TaskError>>,
    waker: Option<Waker>,
}

/// Awaitable completion of a blocking call running on a worker thread.
///
/// Resolves with the call's return value, or with the captured panic. The
/// wake is delivered through the consumer's resume policy, so consuming a
/// `CoThread` from a coroutine requires a queueing policy (see
/// [crate::resume]); the default in-place policy would resume the consumer on
/// the worker thread.
pub struct CoThread<V> {
    slot: Arc<Mutex<Slot<V>>>,
    worker: Option<thread::JoinHandle<()>>,
}

assert_impl_all!(CoThread<()>: Send);

/// Runs `f` on a new worker thread and returns the awaitable of its result.
pub fn co_thread<F, V>(f: F) -> CoThread<V>
where
    F: FnOnce() -> V + Send + 'static,
    V: Send + 'static,
{
    let slot = Arc::new(Mutex::new(Slot { result: None, waker: None }));
    let worker = thread::spawn({
        let slot = Arc::clone(&slot);
        move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(TaskError::panicked);
            let waker = {
                let mut slot = slot.lock().unwrap();
                slot.result = Some(result);
                slot.waker.take()
            };
            // Waking outside the lock keeps an in-place resume policy from
            // polling the consumer while the slot is held.
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    });
    CoThread { slot, worker: Some(worker) }
}

impl<V> CoThread<V> {
    /// Returns true once the worker has landed its result.
    pub fn ready(&self) -> bool {
        self.slot.lock().unwrap().result.is_some()
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            // The worker catches panics, so join reports none.
            worker.join().ignore();
        }
    }
}

impl<V> Future for CoThread<V> {
    type Output = Result<V, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let landed = {
            let mut slot = this.slot.lock().unwrap();
            match slot.result.take() {
                Some(result) => Some(result),
                None => {
                    slot.waker = Some(cx.waker().clone());
                    None
                },
            }
        };
        match landed {
            Some(result) => {
                this.join_worker();
                Poll::Ready(result)
            },
            None => Poll::Pending,
        }
    }
}

impl<V> Drop for CoThread<V> {
    fn drop(&mut self) {
        self.join_worker();
    }
}
