use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::arena::{EntityId, Status};
use crate::dispatch::{self, Subscription};
use crate::entity::Entity;
use crate::hash::{FastHashSet, FastIndexMap, FastIndexSet};
use crate::pending::Access;
use crate::scheduler;
use crate::signal::{Deferred, Reply, Signal};
use crate::value::Key;

/// Keys read during one tracked invocation, grouped by entity.
type Watched = FastIndexMap<EntityId, FastIndexSet<Key>>;

// Thread-local tracker for the effect currently running.
// `None` means reads are not being recorded.
thread_local! {
    static CURRENT_TRACKER: RefCell<Option<Watched>> = const { RefCell::new(None) };
}

/// RAII guard that installs a tracker and restores the previous one on drop,
/// even if the tracked closure panics.
struct TrackerGuard {
    previous: Option<Option<Watched>>,
}

impl TrackerGuard {
    fn new(tracker: Option<Watched>) -> Self {
        let previous = CURRENT_TRACKER.with(|current| current.replace(tracker));
        Self {
            previous: Some(previous),
        }
    }

    /// Restore the previous tracker and return what this one recorded.
    fn finish(mut self) -> Watched {
        let previous = self.previous.take().flatten();
        CURRENT_TRACKER
            .with(|current| current.replace(previous))
            .unwrap_or_default()
    }
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            CURRENT_TRACKER.with(|current| *current.borrow_mut() = previous);
        }
    }
}

/// Record a property read against the running effect, if any.
pub(crate) fn track_read(entity: EntityId, key: &Key) {
    CURRENT_TRACKER.with(|current| {
        if let Some(watched) = current.borrow_mut().as_mut() {
            watched.entry(entity).or_default().insert(key.clone());
        }
    });
}

/// Run a closure without recording property reads.
///
/// # Example
/// ```ignore
/// entity.effect(move |current| {
///     let name = ready!(current.get("name"));          // re-runs when name changes
///     let hint = untracked(|| current.peek("hint"));   // does not
///     Access::Ready(None)
/// });
/// ```
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = TrackerGuard::new(None);
    f()
}

/// Why an effect's cleanup is being called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown {
    /// The effect is about to re-run.
    Stale,
    /// [`EffectHandle::cancel`] was called.
    Cancelled,
    /// The entity the effect is attached to was destroyed.
    Destroyed,
}

/// Cleanup returned by an effect body.
pub type Cleanup = Box<dyn FnOnce(Teardown) + Send>;

type EffectFn = Box<dyn FnMut(Entity) -> Access<Option<Cleanup>> + Send>;

struct EffectInner {
    entity: Entity,
    /// Taken out while the body runs.
    callback: Mutex<Option<EffectFn>>,
    cleanup: Mutex<Option<Cleanup>>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// A re-run is already queued.
    queued: AtomicBool,
    finished: AtomicBool,
    /// Bumped on every run so stale suspensions don't re-trigger.
    epoch: AtomicU64,
    runs: AtomicU64,
}

/// Handle to a running effect.
///
/// Dropping the handle leaves the effect running for as long as its entity
/// lives; call [`cancel`](EffectHandle::cancel) to stop it earlier.
#[derive(Clone)]
pub struct EffectHandle {
    inner: Arc<EffectInner>,
}

impl EffectHandle {
    /// Stop the effect and call its last cleanup with [`Teardown::Cancelled`].
    /// Idempotent.
    pub fn cancel(&self) {
        finish(&self.inner, Teardown::Cancelled);
    }

    pub fn is_active(&self) -> bool {
        !self.inner.finished.load(Ordering::Acquire)
    }

    /// How many times the body has run.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }
}

/// Run `f` against `entity`, re-running it whenever a property it read changes.
///
/// Every property read during an invocation (through any entity) becomes part
/// of the subscription filter for the next one. Re-runs are queued onto the
/// next tick, so several writes in one tick cause a single re-run. If the body
/// returns [`Access::Pending`] it is suspended until that marker settles.
///
/// On an entity that is not active yet, the first run happens on activation.
pub fn tracked_effect<F>(entity: Entity, f: F) -> EffectHandle
where
    F: FnMut(Entity) -> Access<Option<Cleanup>> + Send + 'static,
{
    let inner = Arc::new(EffectInner {
        entity,
        callback: Mutex::new(Some(Box::new(f))),
        cleanup: Mutex::new(None),
        subscriptions: Mutex::new(Vec::new()),
        queued: AtomicBool::new(false),
        finished: AtomicBool::new(false),
        epoch: AtomicU64::new(0),
        runs: AtomicU64::new(0),
    });

    let ready = entity
        .id()
        .with_state(|state| (state.status, state.ready_sent));
    match ready {
        None | Some((Status::Destroyed, _)) => {
            inner.finished.store(true, Ordering::Release);
            inner.callback.lock().take();
        }
        Some((_, true)) => run(&inner),
        Some((_, false)) => {
            cov_mark::hit!(effect_waits_for_ready);
            let waiting = inner.clone();
            let subscription = dispatch::add_listener(entity, move |signal, _| match signal {
                Signal::Ready => {
                    run(&waiting);
                    Ok(Reply::Remove)
                }
                Signal::Terminal => {
                    finish(&waiting, Teardown::Destroyed);
                    Ok(Reply::Remove)
                }
                _ => Ok(Reply::Keep),
            });
            inner.subscriptions.lock().push(subscription);
        }
    }

    EffectHandle { inner }
}

/// Queue a re-run unless one is already queued.
fn rerun(inner: &Arc<EffectInner>) -> Option<Deferred> {
    if inner.finished.load(Ordering::Acquire) || inner.queued.swap(true, Ordering::AcqRel) {
        cov_mark::hit!(effect_rerun_coalesced);
        return None;
    }
    let inner = inner.clone();
    Some(Box::new(move || run(&inner)))
}

fn run(inner: &Arc<EffectInner>) {
    inner.queued.store(false, Ordering::Release);
    if inner.finished.load(Ordering::Acquire) {
        return;
    }
    let entity = inner.entity;

    let stale = inner.cleanup.lock().take();
    if let Some(cleanup) = stale {
        cleanup(Teardown::Stale);
    }
    let old = std::mem::take(&mut *inner.subscriptions.lock());
    for subscription in old {
        subscription.cancel();
    }

    let Some(mut callback) = inner.callback.lock().take() else {
        // The body triggered its own re-run synchronously.
        return;
    };
    let epoch = inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
    inner.runs.fetch_add(1, Ordering::Relaxed);

    let tracker = TrackerGuard::new(Some(Watched::default()));
    let outcome = callback(entity);
    let mut watched = tracker.finish();

    let finished = inner.finished.load(Ordering::Acquire);
    if !finished {
        *inner.callback.lock() = Some(callback);
    }

    // The own entity is always watched so destruction tears the effect down.
    let own: FastHashSet<Key> = watched
        .shift_remove(&entity.id())
        .map(|keys| keys.into_iter().collect())
        .unwrap_or_default();
    tracing::trace!(entity = %entity, keys = own.len(), others = watched.len(), "effect ran");

    let mut subscriptions = Vec::with_capacity(watched.len() + 1);
    let owner = inner.clone();
    subscriptions.push(dispatch::attach(
        entity,
        Some(own),
        Arc::new(move |signal: &Signal, _: Entity| match signal {
            Signal::Terminal => {
                finish(&owner, Teardown::Destroyed);
                Ok(Reply::Keep)
            }
            // Nothing written yet.
            Signal::Assigning(_) => Ok(Reply::Keep),
            _ => Ok(rerun(&owner).map_or(Reply::Keep, Reply::Defer)),
        }),
    ));
    for (id, keys) in watched {
        let dependent = inner.clone();
        subscriptions.push(dispatch::attach(
            Entity::from_id(id),
            Some(keys.into_iter().collect()),
            Arc::new(move |signal: &Signal, _: Entity| match signal {
                Signal::Terminal | Signal::Assigning(_) => Ok(Reply::Keep),
                _ => Ok(rerun(&dependent).map_or(Reply::Keep, Reply::Defer)),
            }),
        ));
    }

    if inner.finished.load(Ordering::Acquire) {
        for subscription in &subscriptions {
            subscription.cancel();
        }
    } else {
        *inner.subscriptions.lock() = subscriptions;
    }

    match outcome {
        Access::Ready(Some(cleanup)) => {
            if inner.finished.load(Ordering::Acquire) {
                cleanup(Teardown::Cancelled);
            } else {
                *inner.cleanup.lock() = Some(cleanup);
            }
        }
        Access::Ready(None) => {}
        Access::Pending(pending) => {
            cov_mark::hit!(effect_suspended);
            tracing::trace!(entity = %entity, key = %pending.key(), "effect suspended");
            let suspended = inner.clone();
            pending.on_settle(move |_| {
                if suspended.epoch.load(Ordering::Acquire) != epoch {
                    return;
                }
                if let Some(callback) = rerun(&suspended) {
                    scheduler::defer_boxed(callback);
                }
            });
        }
        Access::Failed(error) => {
            tracing::error!(entity = %entity, %error, "effect failed");
        }
    }

    // The body itself may have destroyed the entity.
    if matches!(entity.id().status(), None | Some(Status::Destroyed)) {
        finish(inner, Teardown::Destroyed);
    }
}

fn finish(inner: &EffectInner, teardown: Teardown) {
    if inner.finished.swap(true, Ordering::AcqRel) {
        return;
    }
    tracing::trace!(entity = %inner.entity, ?teardown, "effect finished");
    let callback = inner.callback.lock().take();
    drop(callback);
    let subscriptions = std::mem::take(&mut *inner.subscriptions.lock());
    for subscription in subscriptions {
        subscription.cancel();
    }
    let cleanup = inner.cleanup.lock().take();
    if let Some(cleanup) = cleanup {
        cleanup(teardown);
    }
}
