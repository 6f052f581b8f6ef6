//! # Signals, tasklets and worker-thread awaitables
//! `strand` is a small concurrency kernel unifying three primitives for
//! event-driven programs:
//!
//! ### Signals
//! * Use [signal::Signal] to broadcast a typed payload to connected slots.
//! * Use [signal::Receiver] to own subscriptions; dropping it unsubscribes.
//! * Use [signal::Signal::next] to await a signal's next emission.
//!
//! ### Tasklets
//! * Use [tasklet::Tasklet] to wrap a future as a lazily-started coroutine.
//! * Await a tasklet (or a reference to one) to compose coroutines; awaiting
//!   starts the target.
//! * Use [tasklet::Tasklet::completed] and [tasklet::Tasklet::failed] to
//!   observe terminal transitions, and [tasklet::Tracker] for lifetime
//!   accounting.
//!
//! ### Worker threads
//! * Use [thread::co_thread] to run a blocking call on a worker thread and
//!   await its result. Consuming it from a coroutine requires a queueing
//!   [resume::Resumer], installed with [resume::install], so the wake is
//!   marshalled back onto the loop thread.
//!
//! ## Example
//! ```rust
//! use strand::{Signal, Tasklet};
//!
//! let signal = Signal::<i32>::new();
//! let mut doubled = Tasklet::new({
//!     let signal = signal.clone();
//!     async move { 2 * signal.next().await }
//! });
//! doubled.start();
//! signal.emit(21);
//! assert_eq!(doubled.get().unwrap(), 42);
//! ```

pub mod error;
pub mod resume;
pub mod signal;
pub mod tasklet;
pub mod thread;

pub use error::TaskError;
pub use resume::{install, Coro, Resumer, SyncResumer};
pub use signal::{Receiver, Signal};
pub use tasklet::{Tasklet, Tracker};
pub use thread::{co_thread, CoThread};
