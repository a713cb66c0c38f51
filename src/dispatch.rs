//! Observer registry fanning inbound messages out to waiting callers.
//!
//! Every decoded inbound message is offered to the registered observers in
//! registration order until one of them claims it. Observers are tagged
//! variants stored by value and removed through an explicit [`ObserverId`]
//! handle: a [one-shot](ObserverKind::OneShot) observer is removed by the
//! registry itself the moment it consumes a message, so owners never have to
//! deregister from inside a delivery callback; a
//! [persistent](ObserverKind::Persistent) observer keeps firing until its
//! owner deregisters it.
//!
//! Delivery is a non-blocking channel send performed under the registry lock.
//! The dispatching task never waits for the owner to process the message.

use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{Opcode, ProtocolMessage};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle identifying a registered observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObserverId({})", self.0)
    }
}

/// Whether an observer survives its first match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverKind {
    /// Removed by the registry immediately after its first consumed message.
    OneShot,
    /// Fires on every matching message until explicitly deregistered.
    Persistent,
}

/// A registered matcher paired with the channel its owner listens on.
///
/// Construct one with [`Observer::one_shot`] or [`Observer::persistent`],
/// which return the observer together with the receiving half of its
/// delivery channel.
#[derive(Clone, Debug)]
pub struct Observer {
    id: ObserverId,
    opcode: Opcode,
    kind: ObserverKind,
    tx: mpsc::UnboundedSender<ProtocolMessage>,
}

impl Observer {
    fn new(opcode: Opcode, kind: ObserverKind) -> (Self, mpsc::UnboundedReceiver<ProtocolMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ObserverId(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed));
        (
            Self {
                id,
                opcode,
                kind,
                tx,
            },
            rx,
        )
    }

    /// Create an observer that consumes exactly one message with `opcode`.
    #[must_use]
    pub fn one_shot(opcode: Opcode) -> (Self, mpsc::UnboundedReceiver<ProtocolMessage>) {
        Self::new(opcode, ObserverKind::OneShot)
    }

    /// Create an observer that consumes every message with `opcode` until
    /// deregistered.
    #[must_use]
    pub fn persistent(opcode: Opcode) -> (Self, mpsc::UnboundedReceiver<ProtocolMessage>) {
        Self::new(opcode, ObserverKind::Persistent)
    }

    /// Handle used to deregister this observer.
    #[must_use]
    pub fn id(&self) -> ObserverId { self.id }

    /// Operation code this observer matches.
    #[must_use]
    pub fn opcode(&self) -> Opcode { self.opcode }

    /// Whether this observer is one-shot or persistent.
    #[must_use]
    pub fn kind(&self) -> ObserverKind { self.kind }
}

/// Errors surfaced by [`DispatchRegistry`] mutation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The same observer instance was registered twice. A programming error;
    /// the registry is left unchanged.
    #[error("observer {0} is already registered")]
    AlreadyRegistered(ObserverId),
}

/// Ordered, shared set of observers attached to a connection.
///
/// Registration order is dispatch order. Mutation and dispatch are mutually
/// exclusive; delivery itself is a channel post, so holding the lock during
/// dispatch never blocks on an observer's owner.
#[derive(Debug, Default)]
pub struct DispatchRegistry {
    observers: Mutex<Vec<Observer>>,
}

impl DispatchRegistry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn observers(&self) -> MutexGuard<'_, Vec<Observer>> {
        // Dispatch never runs caller code under the lock, so a poisoned lock
        // only means a panic between mutations; the Vec is still coherent.
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an observer to the end of the dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if an observer with the
    /// same identity is already present. The registry is unchanged on error.
    pub fn register(&self, observer: Observer) -> Result<ObserverId, RegistryError> {
        let mut observers = self.observers();
        if observers.iter().any(|o| o.id == observer.id) {
            return Err(RegistryError::AlreadyRegistered(observer.id));
        }
        let id = observer.id;
        observers.push(observer);
        Ok(id)
    }

    /// Remove the observer with `id` if present.
    ///
    /// Returns `false` when the observer is absent. Absence is not an error:
    /// a one-shot observer may already have been removed by a dispatch racing
    /// its owner's cleanup.
    pub fn deregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers();
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    /// Whether an observer with `id` is currently registered.
    #[must_use]
    pub fn contains(&self, id: ObserverId) -> bool {
        self.observers().iter().any(|o| o.id == id)
    }

    /// Number of live observers.
    #[must_use]
    pub fn len(&self) -> usize { self.observers().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.observers().is_empty() }

    /// Remove every observer, closing their delivery channels.
    pub fn clear(&self) { self.observers().clear(); }

    /// Offer `message` to each observer in registration order until one
    /// consumes it.
    ///
    /// A one-shot consumer is removed before the method returns. An observer
    /// whose owner has dropped its receiver did not consume the message; the
    /// dead entry is pruned and dispatch moves on to the next observer. A
    /// message no observer claims is dropped with a log line.
    pub fn dispatch(&self, message: ProtocolMessage) {
        let opcode = message.opcode();
        let mut observers = self.observers();
        let mut index = 0;
        while index < observers.len() {
            let observer = &observers[index];
            if observer.opcode != opcode {
                index += 1;
                continue;
            }
            match observer.tx.send(message.clone()) {
                Ok(()) => {
                    debug!(%opcode, observer = %observer.id, kind = ?observer.kind, "message consumed");
                    if observer.kind == ObserverKind::OneShot {
                        observers.remove(index);
                    }
                    return;
                }
                Err(_) => {
                    warn!(%opcode, observer = %observer.id, "observer channel closed; pruning");
                    observers.remove(index);
                    // Same index now holds the next observer.
                }
            }
        }
        debug!(%opcode, timestamp = message.timestamp(), "no observer claimed message; dropping");
    }
}
