//! Dispatcher: listener registry, signal delivery and key-change batching.
//!
//! Delivery rules:
//! - Listeners see a snapshot taken when a delivery pass starts. Subscribing or
//!   unsubscribing during the pass only affects later passes.
//! - An `emit` for an entity that is already mid-delivery is queued behind the
//!   running pass instead of recursing.
//! - `Ready` is delivered once per entity; `Terminal` is delivered once and
//!   then drops every listener.
//! - Direct emits return the first listener error after every listener ran.
//!   Batched flushes log each failure and carry on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::{EntityId, ListenerEntry, Status};
use crate::entity::Entity;
use crate::error::Result;
use crate::hash::FastHashSet;
use crate::scheduler;
use crate::signal::{Listener, Reply, Signal};
use crate::value::Key;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Where a delivery was triggered from, which decides error propagation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Direct,
    Batched,
}

/// Handle returned by listener registration. `cancel` is idempotent.
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    entity: EntityId,
    id: u64,
}

impl Subscription {
    fn inert(entity: EntityId) -> Self {
        Self { entity, id: 0 }
    }

    pub fn cancel(&self) {
        if self.id == 0 {
            return;
        }
        self.entity.with_state(|state| {
            state.listeners.retain(|entry| entry.id != self.id);
        });
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.id != 0
            && self
                .entity
                .with_state(|state| state.listeners.iter().any(|entry| entry.id == self.id))
                .unwrap_or(false)
    }
}

/// Register a listener for every signal of `entity`.
///
/// If the entity is already active the listener is called with
/// [`Signal::Ready`] right away, so late subscribers still observe the
/// initial state.
pub fn add_listener<F>(entity: Entity, callback: F) -> Subscription
where
    F: Fn(&Signal, Entity) -> Result<Reply> + Send + Sync + 'static,
{
    attach(entity, None, Arc::new(callback))
}

/// Register a listener that only sees the given keys (plus `Terminal`).
pub fn add_key_listener<I, K, F>(entity: Entity, keys: I, callback: F) -> Subscription
where
    I: IntoIterator<Item = K>,
    K: Into<Key>,
    F: Fn(&Signal, Entity) -> Result<Reply> + Send + Sync + 'static,
{
    let filter = keys.into_iter().map(Into::into).collect();
    attach(entity, Some(filter), Arc::new(callback))
}

pub(crate) fn attach(
    entity: Entity,
    filter: Option<FastHashSet<Key>>,
    callback: Listener,
) -> Subscription {
    enum Attach {
        Queued,
        ReadyNow,
        Dead,
    }

    let id = entity.id();
    let entry = Arc::new(ListenerEntry {
        id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
        filter,
        callback,
    });

    let outcome = id
        .with_state(|state| {
            if state.is_frozen() {
                return Attach::Dead;
            }
            let late = entry.filter.is_none() && state.ready_sent;
            if !late && state.listeners.is_empty() && state.status == Status::Constructing {
                state.awaiting_ready = true;
            }
            // Registered before the late Ready so the callback's own emits reach it.
            state.listeners.push(entry.clone());
            if late { Attach::ReadyNow } else { Attach::Queued }
        })
        .unwrap_or(Attach::Dead);

    match outcome {
        Attach::Dead => {
            cov_mark::hit!(listener_on_destroyed_entity);
            Subscription::inert(id)
        }
        Attach::Queued => Subscription {
            entity: id,
            id: entry.id,
        },
        Attach::ReadyNow => {
            cov_mark::hit!(late_listener_sees_ready);
            let subscription = Subscription {
                entity: id,
                id: entry.id,
            };
            match (entry.callback)(&Signal::Ready, entity) {
                Ok(Reply::Keep) => {}
                Ok(Reply::Remove) => {
                    subscription.cancel();
                    return Subscription::inert(id);
                }
                Ok(Reply::Defer(callback)) => scheduler::defer_boxed(callback),
                Err(error) => {
                    tracing::warn!(entity = %entity, %error, "listener failed on ready");
                }
            }
            subscription
        }
    }
}

/// Deliver a signal to the entity's listeners right now.
///
/// Returns the first error raised by a listener; every listener still runs.
pub fn emit(entity: Entity, signal: Signal) -> Result<()> {
    deliver(entity.id(), signal, Delivery::Direct)
}

/// Clears the in-flight marker even if a listener panics.
struct InFlightGuard(EntityId);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.with_state(|state| state.in_flight = None);
    }
}

pub(crate) fn deliver(id: EntityId, signal: Signal, mode: Delivery) -> Result<()> {
    enum Gate {
        Skip,
        Merge,
        Run,
    }

    let gate = id
        .with_state(|state| {
            if signal == Signal::Ready {
                if state.ready_sent {
                    return Gate::Skip;
                }
                state.ready_sent = true;
            }
            match &mut state.in_flight {
                Some(queue) => {
                    queue.push_back(signal.clone());
                    Gate::Merge
                }
                None => {
                    state.in_flight = Some(VecDeque::new());
                    Gate::Run
                }
            }
        })
        .unwrap_or(Gate::Skip);

    match gate {
        Gate::Skip => {
            cov_mark::hit!(duplicate_ready_skipped);
            return Ok(());
        }
        Gate::Merge => {
            cov_mark::hit!(reentrant_emit_merged);
            return Ok(());
        }
        Gate::Run => {}
    }

    let _guard = InFlightGuard(id);
    let entity = Entity::from_id(id);
    let mut first_error = None;
    let mut current = signal;

    loop {
        let snapshot: Vec<Arc<ListenerEntry>> = id
            .with_state(|state| {
                state
                    .listeners
                    .iter()
                    .filter(|entry| current.passes(entry.filter.as_ref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tracing::trace!(entity = ?id, signal = ?current, listeners = snapshot.len(), "deliver");

        let mut removed = Vec::new();
        for entry in snapshot {
            match (entry.callback)(&current, entity) {
                Ok(Reply::Keep) => {}
                Ok(Reply::Remove) => removed.push(entry.id),
                Ok(Reply::Defer(callback)) => scheduler::defer_boxed(callback),
                Err(error) => match mode {
                    Delivery::Direct => {
                        first_error.get_or_insert(error);
                    }
                    Delivery::Batched => {
                        tracing::warn!(entity = ?id, signal = ?current, %error, "listener failed during flush");
                    }
                },
            }
        }

        let terminal = current == Signal::Terminal;
        let next = id
            .with_state(|state| {
                if terminal {
                    state.listeners.clear();
                } else if !removed.is_empty() {
                    state.listeners.retain(|entry| !removed.contains(&entry.id));
                }
                let next = state.in_flight.as_mut().and_then(VecDeque::pop_front);
                if next.is_none() {
                    state.in_flight = None;
                }
                next
            })
            .flatten();

        match next {
            Some(signal) => current = signal,
            None => break,
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Record `key` in the entity's pending batch.
///
/// The first key since the last flush queues the entity for the next tick.
/// Unless `silent`, listeners also get a synchronous [`Signal::Key`]. Silent
/// keys still land in the eventual [`Signal::Flushed`] batch.
pub fn schedule_key_change(entity: Entity, key: Key, silent: bool) -> Result<()> {
    let id = entity.id();
    let first = id
        .with_state(|state| {
            if state.is_frozen() {
                return None;
            }
            let first = state.batch.is_empty();
            state.batch.insert(key.clone());
            Some(first)
        })
        .flatten();

    let Some(first) = first else {
        return Ok(());
    };
    if first {
        scheduler::enqueue_flush(id);
    }
    if silent {
        cov_mark::hit!(silent_key_recorded);
        return Ok(());
    }
    deliver(id, Signal::Key(key), Delivery::Direct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use crate::error::Error;
    use crate::scheduler::run_until_idle;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn plain() -> Entity {
        Class::builder("Plain")
            .field("a", 0)
            .build()
            .create(Vec::new())
            .unwrap()
    }

    #[test]
    fn reentrant_emit_is_merged_not_recursed() {
        cov_mark::check!(reentrant_emit_merged);
        let entity = plain();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        add_listener(entity, move |signal, entity| {
            s.lock().push(signal.clone());
            if signal.key().is_some_and(|key| key.as_str() == "outer") {
                emit(entity, Signal::Key("inner".into()))?;
                // The nested signal is queued, not delivered inside this call.
                assert_eq!(s.lock().last(), Some(&Signal::Key("outer".into())));
            }
            Ok(Reply::Keep)
        });

        emit(entity, Signal::Key("outer".into())).unwrap();

        assert_eq!(
            *seen.lock(),
            [
                Signal::Ready,
                Signal::Key("outer".into()),
                Signal::Key("inner".into())
            ]
        );
    }

    #[test]
    fn removal_mid_delivery_does_not_skip_siblings() {
        let entity = plain();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        add_key_listener(entity, ["ping"], move |_, _| {
            f.fetch_add(1, Ordering::Relaxed);
            Ok(Reply::Remove)
        });
        let s = second.clone();
        add_key_listener(entity, ["ping"], move |_, _| {
            s.fetch_add(1, Ordering::Relaxed);
            Ok(Reply::Keep)
        });

        emit(entity, Signal::Key("ping".into())).unwrap();
        emit(entity, Signal::Key("ping".into())).unwrap();

        assert_eq!(first.load(Ordering::Relaxed), 1);
        assert_eq!(second.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn direct_emit_returns_first_error_after_all_listeners_ran() {
        let entity = plain();
        let reached = Arc::new(AtomicUsize::new(0));

        add_key_listener(entity, ["boom"], |_, _| Err(Error::failed("first")));
        add_key_listener(entity, ["boom"], |_, _| Err(Error::failed("second")));
        let r = reached.clone();
        add_key_listener(entity, ["boom"], move |_, _| {
            r.fetch_add(1, Ordering::Relaxed);
            Ok(Reply::Keep)
        });

        let result = emit(entity, Signal::Key("boom".into()));

        assert_eq!(result, Err(Error::failed("first")));
        assert_eq!(reached.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn batched_flush_swallows_listener_errors() {
        let entity = plain();
        let flushed = Arc::new(AtomicUsize::new(0));

        add_listener(entity, |signal, _| match signal {
            Signal::Flushed(_) => Err(Error::failed("broken subscriber")),
            _ => Ok(Reply::Keep),
        });
        let f = flushed.clone();
        add_listener(entity, move |signal, _| {
            if matches!(signal, Signal::Flushed(_)) {
                f.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Reply::Keep)
        });

        entity.set("a", 1.into()).unwrap();
        run_until_idle().unwrap();

        assert_eq!(flushed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn silent_keys_join_the_flush_without_key_signals() {
        cov_mark::check!(silent_key_recorded);
        let entity = plain();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        add_listener(entity, move |signal, _| {
            s.lock().push(signal.clone());
            Ok(Reply::Keep)
        });

        schedule_key_change(entity, "quiet".into(), true).unwrap();
        schedule_key_change(entity, "loud".into(), false).unwrap();
        run_until_idle().unwrap();

        let batch: Arc<[Key]> = vec![Key::from("quiet"), Key::from("loud")].into();
        assert_eq!(
            *seen.lock(),
            [
                Signal::Ready,
                Signal::Key("loud".into()),
                Signal::Flushed(batch)
            ]
        );
    }

    #[test]
    fn late_listener_receives_its_own_emits_from_ready() {
        cov_mark::check!(late_listener_sees_ready);
        let entity = plain();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let subscription = add_listener(entity, move |signal, this| {
            s.lock().push(signal.clone());
            if *signal == Signal::Ready {
                emit(this, Signal::Key("hello".into()))?;
            }
            Ok(Reply::Keep)
        });
        let once = add_listener(entity, |_, _| Ok(Reply::Remove));

        assert_eq!(*seen.lock(), [Signal::Ready, Signal::Key("hello".into())]);
        assert!(subscription.is_active());
        assert!(!once.is_active());
    }

    #[test]
    fn cancel_is_idempotent() {
        let entity = plain();
        let subscription = add_listener(entity, |_, _| Ok(Reply::Keep));
        assert!(subscription.is_active());

        subscription.cancel();
        subscription.cancel();
        assert!(!subscription.is_active());
    }
}
