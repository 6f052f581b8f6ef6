//! Lazy single-shot coroutines whose completion is itself a signal.
//!
//! A [Tasklet] wraps a future that does not run until someone starts it:
//! explicitly via [Tasklet::start], or implicitly by reading or awaiting it.
//! The frame carries two broadcast signals, `completed` and `failed`, so
//! observers can wire up terminal notifications without consuming the value.
//! Awaiting a tasklet from another coroutine parks the awaiter in the
//! target's frame; the terminal transition hands every parked awaiter to the
//! resume policy.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use static_assertions::assert_not_impl_any;

use crate::error::TaskError;
use crate::resume::{self, Coro, Resumer, Step};
use crate::signal::Signal;

static CORO_ID: AtomicU64 = AtomicU64::new(1);

/// Lifetime observer attached to a tasklet frame.
///
/// Exactly one terminal callback is delivered: [Tracker::terminated] when the
/// coroutine returns or its frame is destroyed before completing,
/// [Tracker::failed] when the body panics. The tracker is released as soon as
/// the callback has run.
pub trait Tracker {
    fn terminated(&mut self) {}

    fn failed(&mut self, _error: &TaskError) {}
}

type TaskletBody<V> = Pin<Box<dyn Future<Output = V> + 'static>>;

struct Frame<V> {
    id: u64,
    name: RefCell<Option<String>>,
    started: Cell<bool>,
    finished: Cell<bool>,
    repoll: Cell<bool>,
    body: RefCell<Option<TaskletBody<V>>>,
    result: RefCell<Option<Result<V, TaskError>>>,
    completed: Signal<()>,
    failed: Signal<TaskError>,
    awaiters: RefCell<Vec<Waker>>,
    tracker: RefCell<Option<Box<dyn Tracker>>>,
    resumer: Arc<dyn Resumer>,
}

struct WakeNode {
    frame: Arc<dyn Step>,
    resumer: Arc<dyn Resumer>,
}

// SAFETY: wakers travel to worker threads, where waking only clones the
// atomically refcounted frame pointer and hands it to the resume policy.
// The frame's interior is touched exclusively on its owning thread, which is
// where a conforming policy delivers the resume.
unsafe impl Send for WakeNode {}
unsafe impl Sync for WakeNode {}

impl Wake for WakeNode {
    fn wake(self: Arc<Self>) {
        self.resumer.resume(Coro::new(self.frame.clone()));
    }
}

fn frame_waker<V: 'static>(frame: &Arc<Frame<V>>) -> Waker {
    Waker::from(Arc::new(WakeNode {
        frame: frame.clone() as Arc<dyn Step>,
        resumer: frame.resumer.clone(),
    }))
}

impl<V: 'static> Frame<V> {
    fn finish(&self, result: Result<V, TaskError>) {
        if self.finished.get() {
            return;
        }
        self.finished.set(true);
        let error = result.as_ref().err().cloned();
        *self.result.borrow_mut() = Some(result);
        let tracker = self.tracker.borrow_mut().take();
        if let Some(mut tracker) = tracker {
            match &error {
                Some(error) => tracker.failed(error),
                None => tracker.terminated(),
            }
        }
        // Awaiters resume (through the policy) before external subscribers
        // hear about the completion. The snapshot keeps the walk valid when
        // an awaiter drops itself while resuming.
        let awaiters = mem::take(&mut *self.awaiters.borrow_mut());
        for waker in awaiters {
            waker.wake();
        }
        if let Some(error) = error {
            self.failed.emit(error);
        }
        self.completed.emit(());
    }

    fn take_result(&self) -> Result<V, TaskError> {
        let mut slot = self.result.borrow_mut();
        match mem::take(&mut *slot) {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => {
                // Failures are shared; leave a clone for later readers.
                *slot = Some(Err(error.clone()));
                Err(error)
            },
            None => Err(TaskError::consumed()),
        }
    }
}

impl<V: 'static> Step for Frame<V> {
    fn step(self: Arc<Self>) {
        if self.finished.get() {
            // Stale wake, e.g. a signal emission landing after a worker
            // result already completed the frame.
            return;
        }
        let taken = self.body.borrow_mut().take();
        let Some(mut body) = taken else {
            // A wake landed while this frame is mid-poll further down the
            // stack; have that poll run another round instead of reentering.
            self.repoll.set(true);
            return;
        };
        loop {
            self.repoll.set(false);
            let waker = frame_waker(&self);
            let mut cx = Context::from_waker(&waker);
            match panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx))) {
                Ok(Poll::Pending) => {
                    if self.repoll.get() {
                        continue;
                    }
                    if !self.finished.get() {
                        *self.body.borrow_mut() = Some(body);
                    }
                    return;
                },
                Ok(Poll::Ready(value)) => {
                    drop(body);
                    self.finish(Ok(value));
                    return;
                },
                Err(panicked) => {
                    drop(body);
                    self.finish(Err(TaskError::panicked(panicked)));
                    return;
                },
            }
        }
    }

    fn coro_id(&self) -> u64 {
        self.id
    }
}

fn start<V: 'static>(frame: &Arc<Frame<V>>) {
    frame.started.set(true);
    frame.clone().step();
}

/// Builder attaching a debug name and a [Tracker] before construction.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    tracker: Option<Box<dyn Tracker>>,
}

impl Builder {
    /// Constructs a new tasklet builder.
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Specifies a debug label for the new tasklet.
    pub fn name(&mut self, name: impl Into<String>) -> &mut Builder {
        self.name = Some(name.into());
        self
    }

    /// Attaches a lifetime observer to the new tasklet.
    pub fn tracker(&mut self, tracker: impl Tracker + 'static) -> &mut Builder {
        self.tracker = Some(Box::new(tracker));
        self
    }

    /// Wraps `body` as a lazily-started coroutine.
    ///
    /// The thread's installed resume policy is captured here; install a host
    /// policy before building the coroutines it will drive.
    pub fn spawn<V: 'static>(&mut self, body: impl Future<Output = V> + 'static) -> Tasklet<V> {
        let frame = Arc::new(Frame {
            id: CORO_ID.fetch_add(1, Ordering::Relaxed),
            name: RefCell::new(self.name.take()),
            started: Cell::new(false),
            finished: Cell::new(false),
            repoll: Cell::new(false),
            body: RefCell::new(Some(Box::pin(body))),
            result: RefCell::new(None),
            completed: Signal::new(),
            failed: Signal::new(),
            awaiters: RefCell::new(Vec::new()),
            tracker: RefCell::new(self.tracker.take()),
            resumer: resume::current(),
        });
        let tasklet = Tasklet { frame };
        tasklet.frame.resumer.register_coro(&tasklet.coro());
        tasklet
    }
}

/// Handle to a lazily-started coroutine returning `V`.
///
/// The handle exclusively owns the frame. Dropping it destroys the frame,
/// even if the coroutine never ran; a live tracker observes the termination.
pub struct Tasklet<V: 'static> {
    frame: Arc<Frame<V>>,
}

assert_not_impl_any!(Tasklet<()>: Send, Sync);

impl<V: 'static> Tasklet<V> {
    /// Wraps `body` as a lazily-started coroutine.
    pub fn new(body: impl Future<Output = V> + 'static) -> Tasklet<V> {
        Builder::new().spawn(body)
    }

    fn coro(&self) -> Coro {
        Coro::new(self.frame.clone() as Arc<dyn Step>)
    }

    /// Frame identifier, as seen by the resume policy's registration hooks.
    pub fn id(&self) -> u64 {
        self.frame.id
    }

    /// Returns true once the coroutine has been resumed for the first time.
    pub fn started(&self) -> bool {
        self.frame.started.get()
    }

    /// Returns true while the frame has not reached a terminal state.
    pub fn running(&self) -> bool {
        !self.frame.finished.get()
    }

    /// Resumes the coroutine for the first time.
    ///
    /// # Panics
    /// Panics if the tasklet was already started.
    pub fn start(&mut self) {
        assert!(!self.frame.started.get(), "tasklet already started");
        assert!(!self.frame.finished.get(), "tasklet already finished");
        start(&self.frame);
    }

    /// Reads the coroutine's result, starting it first if nothing has.
    ///
    /// Fails with [TaskError::is_not_finished] while the coroutine is still
    /// suspended. The value is taken by the first successful read; a stored
    /// failure is delivered to every reader.
    pub fn get(&mut self) -> Result<V, TaskError> {
        if !self.frame.started.get() {
            start(&self.frame);
        }
        if !self.frame.finished.get() {
            return Err(TaskError::not_finished());
        }
        self.frame.take_result()
    }

    /// Signal fired once when the frame reaches any terminal state.
    pub fn completed(&self) -> Signal<()> {
        self.frame.completed.clone()
    }

    /// Signal fired once, before `completed`, when the body panics.
    pub fn failed(&self) -> Signal<TaskError> {
        self.frame.failed.clone()
    }

    /// Specifies a debug label.
    pub fn set_name(&mut self, name: impl Into<String>) {
        *self.frame.name.borrow_mut() = Some(name.into());
    }

    /// Debug label, if one was set.
    pub fn name(&self) -> Option<String> {
        self.frame.name.borrow().clone()
    }
}

impl<V: 'static> Drop for Tasklet<V> {
    fn drop(&mut self) {
        if !self.frame.finished.get() {
            // The coroutine will never complete: destroy the body and let a
            // live tracker observe the termination. Waking leftover awaiter
            // wakers is harmless; their frames observe no result.
            self.frame.finished.set(true);
            drop(self.frame.body.borrow_mut().take());
            let tracker = self.frame.tracker.borrow_mut().take();
            if let Some(mut tracker) = tracker {
                tracker.terminated();
            }
            let awaiters = mem::take(&mut *self.frame.awaiters.borrow_mut());
            for waker in awaiters {
                waker.wake();
            }
        }
        self.frame.resumer.deregister_coro(&self.coro());
    }
}

impl<V: 'static> fmt::Debug for Tasklet<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasklet")
            .field("id", &self.frame.id)
            .field("name", &self.frame.name.borrow().as_deref().unwrap_or(".."))
            .field("started", &self.frame.started.get())
            .field("finished", &self.frame.finished.get())
            .finish()
    }
}

fn poll_frame<V: 'static>(
    frame: &Arc<Frame<V>>,
    slot: &mut Option<usize>,
    cx: &mut Context<'_>,
) -> Poll<Result<V, TaskError>> {
    // Awaiting kicks lazy work.
    if !frame.started.get() {
        start(frame);
    }
    if frame.finished.get() {
        return Poll::Ready(frame.take_result());
    }
    let mut awaiters = frame.awaiters.borrow_mut();
    match *slot {
        // Awaiter entries are stable until the terminal drain, so a re-poll
        // replaces its waker instead of parking a duplicate.
        Some(index) => awaiters[index] = cx.waker().clone(),
        None => {
            awaiters.push(cx.waker().clone());
            *slot = Some(awaiters.len() - 1);
        },
    }
    Poll::Pending
}

/// Future consuming a tasklet handle. Created by awaiting a [Tasklet].
pub struct TaskletFuture<V: 'static> {
    task: Tasklet<V>,
    slot: Option<usize>,
}

impl<V: 'static> Future for TaskletFuture<V> {
    type Output = Result<V, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        poll_frame(&this.task.frame, &mut this.slot, cx)
    }
}

impl<V: 'static> IntoFuture for Tasklet<V> {
    type Output = Result<V, TaskError>;
    type IntoFuture = TaskletFuture<V>;

    fn into_future(self) -> TaskletFuture<V> {
        TaskletFuture { task: self, slot: None }
    }
}

/// Future borrowing a tasklet handle. Created by awaiting `&Tasklet`.
///
/// The borrow keeps the target alive across the await, so an awaiter can
/// never outlive its target.
pub struct TaskletRef<'a, V: 'static> {
    frame: &'a Arc<Frame<V>>,
    slot: Option<usize>,
}

impl<V: 'static> Future for TaskletRef<'_, V> {
    type Output = Result<V, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        poll_frame(this.frame, &mut this.slot, cx)
    }
}

impl<'a, V: 'static> IntoFuture for &'a Tasklet<V> {
    type Output = Result<V, TaskError>;
    type IntoFuture = TaskletRef<'a, V>;

    fn into_future(self) -> TaskletRef<'a, V> {
        TaskletRef { frame: &self.frame, slot: None }
    }
}
