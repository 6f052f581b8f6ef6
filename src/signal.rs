//! Multicast signals with lifetime-safe subscriptions.
//!
//! A [Signal] delivers one typed payload to every connected slot. Slots are
//! owned by a [Receiver] group; the signal and the receiver each keep an edge
//! to the other, and dropping either side severs both edges. Connections are
//! matched by stable integer ids, never by address.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use hashbrown::HashMap;
use static_assertions::assert_not_impl_any;

static NODE_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NODE_ID.fetch_add(1, Ordering::Relaxed)
}

trait Sender {
    fn disconnect_receiver(&self, receiver: u64);
}

struct ReceiverCore {
    id: u64,
    senders: RefCell<HashMap<u64, Weak<dyn Sender>>>,
}

impl ReceiverCore {
    fn add_sender(&self, id: u64, sender: Weak<dyn Sender>) {
        self.senders.borrow_mut().entry(id).or_insert(sender);
    }

    fn remove_sender(&self, id: u64) {
        self.senders.borrow_mut().remove(&id);
    }

    fn disconnect_all(&self) {
        // Drain first so sweep callbacks see no stale borrow.
        let senders: Vec<_> = self.senders.borrow_mut().drain().collect();
        for (_, sender) in senders {
            if let Some(sender) = sender.upgrade() {
                sender.disconnect_receiver(self.id);
            }
        }
    }
}

impl Drop for ReceiverCore {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

/// Receiver group owning subscriptions to any number of signals.
///
/// Dropping the group is the primary interface: every connection made with it
/// is severed.
pub struct Receiver {
    core: Rc<ReceiverCore>,
}

assert_not_impl_any!(Receiver: Send, Sync);

impl Receiver {
    pub fn new() -> Receiver {
        Receiver { core: Rc::new(ReceiverCore { id: next_id(), senders: RefCell::new(HashMap::new()) }) }
    }

    /// Severs every connection made with this group.
    pub fn disconnect_all(&self) {
        self.core.disconnect_all();
    }

    /// Number of signals this group is currently attached to.
    pub fn sender_count(&self) -> usize {
        self.core.senders.borrow().len()
    }

    /// Returns true if this group holds a back-edge to `signal`.
    pub fn attached<T: 'static>(&self, signal: &Signal<T>) -> bool {
        self.core.senders.borrow().contains_key(&signal.core.id)
    }
}

impl Default for Receiver {
    fn default() -> Receiver {
        Receiver::new()
    }
}

struct Connection<T> {
    receiver: u64,
    backref: Weak<ReceiverCore>,
    slot: Box<dyn Fn(&T)>,
    once: bool,
    expired: Cell<bool>,
}

struct SignalCore<T> {
    id: u64,
    connections: RefCell<Vec<Rc<Connection<T>>>>,
}

impl<T> SignalCore<T> {
    fn has_connection(&self, receiver: u64) -> bool {
        self.connections.borrow().iter().any(|conn| conn.receiver == receiver)
    }

    // Deletes expired connections and the back-edges of receivers left with
    // no surviving connection.
    fn sweep(&self) {
        let mut dead = Vec::new();
        {
            let mut connections = self.connections.borrow_mut();
            let mut index = 0;
            while index < connections.len() {
                if connections[index].expired.get() {
                    dead.push(connections.remove(index));
                } else {
                    index += 1;
                }
            }
        }
        for conn in dead {
            if self.has_connection(conn.receiver) {
                continue;
            }
            if let Some(receiver) = conn.backref.upgrade() {
                receiver.remove_sender(self.id);
            }
        }
    }
}

impl<T> Sender for SignalCore<T> {
    fn disconnect_receiver(&self, receiver: u64) {
        for conn in self.connections.borrow().iter() {
            if conn.receiver == receiver {
                conn.expired.set(true);
            }
        }
        self.sweep();
    }
}

impl<T> Drop for SignalCore<T> {
    fn drop(&mut self) {
        let connections = mem::take(self.connections.get_mut());
        for conn in connections {
            if let Some(receiver) = conn.backref.upgrade() {
                receiver.remove_sender(self.id);
            }
        }
    }
}

/// Multicast emitter carrying a typed payload.
///
/// Handles are cheap clones of the same underlying signal, so a `'static`
/// coroutine body can own one side while the emitter keeps the other.
/// Slots receive the payload by reference; emission never clones it.
pub struct Signal<T = ()> {
    core: Rc<SignalCore<T>>,
}

assert_not_impl_any!(Signal<()>: Send, Sync);

impl<T: 'static> Signal<T> {
    pub fn new() -> Signal<T> {
        Signal { core: Rc::new(SignalCore { id: next_id(), connections: RefCell::new(Vec::new()) }) }
    }

    fn attach(&self, receiver: &Receiver, slot: Box<dyn Fn(&T)>, once: bool) {
        self.core.connections.borrow_mut().push(Rc::new(Connection {
            receiver: receiver.core.id,
            backref: Rc::downgrade(&receiver.core),
            slot,
            once,
            expired: Cell::new(false),
        }));
        receiver.core.add_sender(self.core.id, Rc::downgrade(&self.core) as Weak<dyn Sender>);
    }

    /// Appends a connection owned by `receiver`.
    ///
    /// A receiver may connect to the same signal repeatedly; every connection
    /// is delivered to in insertion order.
    pub fn connect(&self, receiver: &Receiver, slot: impl Fn(&T) + 'static) {
        self.attach(receiver, Box::new(slot), false);
    }

    /// Appends a connection that expires after its first delivery.
    pub fn connect_once(&self, receiver: &Receiver, slot: impl Fn(&T) + 'static) {
        self.attach(receiver, Box::new(slot), true);
    }

    /// Appends a connection owned by a fresh anonymous receiver group.
    ///
    /// Dropping the returned handle severs the connection.
    pub fn connect_owned(&self, slot: impl Fn(&T) + 'static) -> Receiver {
        let receiver = Receiver::new();
        self.connect(&receiver, slot);
        receiver
    }

    /// Removes every connection owned by `receiver`, and the back-edge.
    pub fn disconnect(&self, receiver: &Receiver) {
        self.core.disconnect_receiver(receiver.core.id);
    }

    /// Removes every connection.
    pub fn disconnect_all(&self) {
        for conn in self.core.connections.borrow().iter() {
            conn.expired.set(true);
        }
        self.core.sweep();
    }

    /// Delivers `args` to every live connection, in insertion order.
    ///
    /// Slots may connect and disconnect on this signal while the emission is
    /// in flight: connections added during the emission are not visited, and
    /// a connection disconnected before its turn is skipped. One-shot
    /// connections expire before their slot runs.
    pub fn emit(&self, args: T) {
        let snapshot: Vec<Rc<Connection<T>>> = self.core.connections.borrow().clone();
        for conn in snapshot {
            if conn.expired.get() {
                continue;
            }
            if conn.once {
                conn.expired.set(true);
            }
            (conn.slot)(&args);
        }
        self.core.sweep();
        // Receivers may have reconnected while their last connection was
        // expiring; restore the back-edges of every survivor.
        let survivors = self.core.connections.borrow().clone();
        for conn in survivors {
            if let Some(receiver) = conn.backref.upgrade() {
                receiver.add_sender(self.core.id, Rc::downgrade(&self.core) as Weak<dyn Sender>);
            }
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.core.connections.borrow().len()
    }

    /// Returns true if any connection is owned by `receiver`.
    pub fn connected(&self, receiver: &Receiver) -> bool {
        self.core.has_connection(receiver.core.id)
    }
}

impl<T: Clone + 'static> Signal<T> {
    /// Awaitable for the next emission of this signal.
    ///
    /// The future resolves with a clone of the payload. If the emission lands
    /// before the first poll, the poll completes immediately; if the future
    /// is dropped first, its connection is severed.
    pub fn next(&self) -> SignalFuture<T> {
        let receiver = Receiver::new();
        let state = Rc::new(RefCell::new(SignalWait { payload: None, waker: None }));
        let shared = Rc::clone(&state);
        self.connect_once(&receiver, move |args: &T| {
            let waker = {
                let mut state = shared.borrow_mut();
                state.payload = Some(args.clone());
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        SignalFuture { state, _receiver: receiver }
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Signal<T> {
        Signal::new()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Signal<T> {
        Signal { core: Rc::clone(&self.core) }
    }
}

struct SignalWait<T> {
    payload: Option<T>,
    waker: Option<Waker>,
}

/// Future of a signal's next emission. Created by [Signal::next].
pub struct SignalFuture<T> {
    state: Rc<RefCell<SignalWait<T>>>,
    _receiver: Receiver,
}

impl<T> Future for SignalFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        if let Some(payload) = state.payload.take() {
            return Poll::Ready(payload);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll, Wake, Waker};

    use pretty_assertions::assert_eq;

    use super::*;

    fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        struct Noop;
        impl Wake for Noop {
            fn wake(self: Arc<Self>) {}
        }
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn emit_bool() {
        let signal = Signal::<bool>::new();
        let receiver = Receiver::new();
        let result = Rc::new(Cell::new(None));
        signal.connect(&receiver, {
            let result = result.clone();
            move |value: &bool| result.set(Some(*value))
        });
        signal.emit(true);
        assert_eq!(result.get(), Some(true));
        result.set(None);
        signal.emit(false);
        assert_eq!(result.get(), Some(false));
    }

    #[test]
    fn emit_one_shot() {
        let signal = Signal::<bool>::new();
        let receiver = Receiver::new();
        let result = Rc::new(Cell::new(None));
        signal.connect_once(&receiver, {
            let result = result.clone();
            move |value: &bool| result.set(Some(*value))
        });
        signal.emit(true);
        assert_eq!(result.get(), Some(true));
        assert_eq!(signal.connection_count(), 0);
        assert_eq!(receiver.sender_count(), 0);
        result.set(None);
        signal.emit(false);
        assert_eq!(result.get(), None);
    }

    #[test]
    fn emit_nullary() {
        let signal = Signal::<()>::new();
        let receiver = Receiver::new();
        let fired = Rc::new(Cell::new(false));
        signal.connect(&receiver, {
            let fired = fired.clone();
            move |_: &()| fired.set(true)
        });
        signal.emit(());
        assert_eq!(fired.get(), true);
        fired.set(false);
        signal.emit(());
        assert_eq!(fired.get(), true);
    }

    #[test]
    fn receiver_drop_disconnects() {
        let signal = Signal::<bool>::new();
        let hits = Rc::new(Cell::new(0));
        {
            let receiver = Receiver::new();
            signal.connect(&receiver, {
                let hits = hits.clone();
                move |_: &bool| hits.set(hits.get() + 1)
            });
            signal.emit(true);
            assert_eq!(signal.connection_count(), 1);
        }
        assert_eq!(signal.connection_count(), 0);
        signal.emit(false);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn owned_receiver_drop_disconnects() {
        let signal = Signal::<i32>::new();
        let receiver = signal.connect_owned(|_| {});
        assert_eq!(signal.connection_count(), 1);
        assert_eq!(receiver.sender_count(), 1);
        drop(receiver);
        assert_eq!(signal.connection_count(), 0);
    }

    #[test]
    fn signal_drop_removes_backedge() {
        let receiver = Receiver::new();
        {
            let signal = Signal::<i32>::new();
            signal.connect(&receiver, |_| {});
            assert_eq!(receiver.sender_count(), 1);
        }
        assert_eq!(receiver.sender_count(), 0);
    }

    #[test]
    fn backedge_symmetry() {
        let signal = Signal::<i32>::new();
        let receiver = Receiver::new();
        signal.connect(&receiver, |_| {});
        signal.connect(&receiver, |_| {});
        assert_eq!(signal.connection_count(), 2);
        assert!(signal.connected(&receiver));
        assert!(receiver.attached(&signal));

        signal.disconnect(&receiver);
        assert_eq!(signal.connection_count(), 0);
        assert!(!signal.connected(&receiver));
        assert!(!receiver.attached(&signal));
    }

    #[test]
    fn partial_expiry_keeps_backedge() {
        let signal = Signal::<i32>::new();
        let receiver = Receiver::new();
        signal.connect_once(&receiver, |_| {});
        signal.connect(&receiver, |_| {});
        signal.emit(0);
        assert_eq!(signal.connection_count(), 1);
        assert!(receiver.attached(&signal));
    }

    #[test]
    fn emission_order_is_insertion_order() {
        let signal = Signal::<i32>::new();
        let receiver = Receiver::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for index in 0..3 {
            signal.connect(&receiver, {
                let order = order.clone();
                move |_: &i32| order.borrow_mut().push(index)
            });
        }
        signal.emit(0);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn connect_during_emit_is_deferred() {
        let signal = Signal::<i32>::new();
        let receiver = Rc::new(Receiver::new());
        let hits = Rc::new(Cell::new(0));
        signal.connect(&receiver, {
            let signal = signal.clone();
            let receiver = receiver.clone();
            let hits = hits.clone();
            move |_: &i32| {
                let hits = hits.clone();
                signal.connect(&receiver, move |_: &i32| hits.set(hits.get() + 1));
            }
        });
        signal.emit(0);
        assert_eq!(hits.get(), 0);
        signal.emit(0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn disconnect_during_emit_tombstones() {
        let signal = Signal::<i32>::new();
        let first = Receiver::new();
        let third = Rc::new(Receiver::new());
        let order = Rc::new(RefCell::new(Vec::new()));
        signal.connect(&first, {
            let signal = signal.clone();
            let third = third.clone();
            let order = order.clone();
            move |_: &i32| {
                order.borrow_mut().push("first");
                signal.disconnect(&third);
            }
        });
        signal.connect(&third, {
            let order = order.clone();
            move |_: &i32| order.borrow_mut().push("third")
        });
        signal.emit(0);
        assert_eq!(*order.borrow(), vec!["first"]);
        assert_eq!(signal.connection_count(), 1);
    }

    #[test]
    fn reconnect_during_emit_refreshes_backedge() {
        let signal = Signal::<i32>::new();
        let receiver = Rc::new(Receiver::new());
        signal.connect_once(&receiver, {
            let signal = signal.clone();
            let receiver = receiver.clone();
            move |_: &i32| signal.connect(&receiver, |_: &i32| {})
        });
        signal.emit(0);
        assert_eq!(signal.connection_count(), 1);
        assert!(receiver.attached(&signal));
    }

    #[test]
    fn next_resolves_with_payload() {
        let signal = Signal::<i32>::new();
        let mut next = signal.next();
        assert_eq!(poll_once(&mut next), Poll::Pending);
        signal.emit(7);
        assert_eq!(poll_once(&mut next), Poll::Ready(7));
    }

    #[test]
    fn next_pre_armed() {
        let signal = Signal::<i32>::new();
        let mut next = signal.next();
        signal.emit(7);
        assert_eq!(poll_once(&mut next), Poll::Ready(7));
    }

    #[test]
    fn next_drop_disconnects() {
        let signal = Signal::<i32>::new();
        let next = signal.next();
        assert_eq!(signal.connection_count(), 1);
        drop(next);
        assert_eq!(signal.connection_count(), 0);
    }
}
