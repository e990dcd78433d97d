//! Tick scheduling for batched flushes
//!
//! All mutation is synchronous. What is deferred lives in a per-thread flush
//! queue and runs on the next *tick*:
//!
//! - **Flushes**: every entity with pending key changes receives one
//!   [`Signal::Flushed`] carrying the union of keys written since its last flush.
//! - **Deferred callbacks**: queued by listeners replying [`Reply::Defer`]
//!   (this is how effects re-run) or by [`defer`].
//! - **Local tasks**: futures spawned with [`spawn_local`], polled until stalled.
//!
//! Each thread is its own event loop. The engine never ticks by itself: the
//! host calls [`tick`] (or [`run_until_idle`]) after its synchronous phase.
//! To learn *when* a tick is needed, install a hook with [`Scheduler`]; it fires
//! once each time the thread goes from idle to tick-pending.
//!
//! ## Usage
//!
//! ```ignore
//! // Tests and synchronous hosts
//! entity.set("a", 1.into())?;
//! entity.set("b", 2.into())?;
//! run_until_idle()?;   // one Flushed { a, b } per listener
//!
//! // Event-loop hosts
//! Scheduler::new()
//!     .max_ticks(64)
//!     .on_tick_requested(|| wake_main_loop())
//!     .install();
//! ```
//!
//! Work queued while a tick runs (a flush listener writing a property, an
//! effect re-running and writing) lands in the *next* tick, never the current
//! one, so an effect that writes what it reads cannot loop inside a tick.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::sync::Arc;

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;

use crate::arena::EntityId;
use crate::dispatch::{self, Delivery};
use crate::error::{Error, Result};
use crate::hash::FastIndexSet;
use crate::signal::{Deferred, Signal};
use crate::value::Key;

/// Default bound on ticks in [`run_until_idle`].
pub const DEFAULT_MAX_TICKS: usize = 1000;

/// Hook invoked when a thread needs a tick.
pub type TickHook = Arc<dyn Fn() + Send + Sync>;

struct SchedulerConfig {
    max_ticks: usize,
    hook: Option<TickHook>,
}

struct FlushQueue {
    entities: FastIndexSet<EntityId>,
    deferred: Vec<Deferred>,
    scheduled: bool,
}

thread_local! {
    static CONFIG: RefCell<SchedulerConfig> = RefCell::new(SchedulerConfig {
        max_ticks: DEFAULT_MAX_TICKS,
        hook: None,
    });

    static FLUSH_QUEUE: RefCell<FlushQueue> = RefCell::new(FlushQueue {
        entities: FastIndexSet::default(),
        deferred: Vec::new(),
        scheduled: false,
    });

    static TASKS: RefCell<LocalPool> = RefCell::new(LocalPool::new());
    static SPAWNER: LocalSpawner = TASKS.with(|pool| pool.borrow().spawner());

    static TICKING: Cell<bool> = const { Cell::new(false) };
}

/// Builder for the current thread's scheduler settings.
///
/// # Example
///
/// ```ignore
/// Scheduler::new()
///     .max_ticks(100)
///     .on_tick_requested(|| notify_host())
///     .install();
/// ```
pub struct Scheduler {
    max_ticks: usize,
    hook: Option<TickHook>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Defaults: `max_ticks` = 1000, no hook.
    pub fn new() -> Self {
        Self {
            max_ticks: DEFAULT_MAX_TICKS,
            hook: None,
        }
    }

    /// Bound on ticks [`run_until_idle`] performs before reporting
    /// [`Error::Runaway`].
    pub fn max_ticks(mut self, ticks: usize) -> Self {
        self.max_ticks = ticks.max(1);
        self
    }

    /// Callback fired whenever the thread goes from idle to tick-pending.
    ///
    /// This is the "run after the current synchronous phase" primitive the host
    /// supplies; it should arrange for [`tick`] to be called soon on this thread.
    pub fn on_tick_requested<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(f));
        self
    }

    /// Apply these settings to the current thread, replacing earlier ones.
    pub fn install(self) {
        CONFIG.with(|config| {
            *config.borrow_mut() = SchedulerConfig {
                max_ticks: self.max_ticks,
                hook: self.hook,
            };
        });
    }
}

/// Mark the thread tick-pending, firing the hook on the idle -> pending edge.
fn request_tick() {
    let newly_scheduled = FLUSH_QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        !std::mem::replace(&mut queue.scheduled, true)
    });
    if newly_scheduled {
        let hook = CONFIG.with(|config| config.borrow().hook.clone());
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Queue an entity for a flush on the next tick.
pub(crate) fn enqueue_flush(id: EntityId) {
    FLUSH_QUEUE.with(|queue| {
        queue.borrow_mut().entities.insert(id);
    });
    request_tick();
}

pub(crate) fn defer_boxed(callback: Deferred) {
    FLUSH_QUEUE.with(|queue| {
        queue.borrow_mut().deferred.push(callback);
    });
    request_tick();
}

/// Run `f` on the next tick, after that tick's flushes.
pub fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    defer_boxed(Box::new(f));
}

/// Spawn a future on this thread's local pool. It is polled during ticks.
pub fn spawn_local<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    let spawned = SPAWNER.with(|spawner| spawner.spawn_local(future));
    if let Err(error) = spawned {
        tracing::error!(%error, "failed to spawn local task");
        return;
    }
    request_tick();
}

/// Whether work is waiting for the next tick on this thread.
pub fn is_tick_scheduled() -> bool {
    FLUSH_QUEUE.with(|queue| queue.borrow().scheduled)
}

/// Restores the ticking flag even if a callback panics.
struct TickGuard;

impl Drop for TickGuard {
    fn drop(&mut self) {
        TICKING.with(|ticking| ticking.set(false));
    }
}

/// Run one tick on the current thread. Returns the number of flushes and
/// deferred callbacks processed.
///
/// Calling `tick` from inside a tick is a no-op.
pub fn tick() -> usize {
    if TICKING.with(|ticking| ticking.replace(true)) {
        cov_mark::hit!(nested_tick_ignored);
        return 0;
    }
    let _guard = TickGuard;

    let (entities, deferred) = FLUSH_QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        queue.scheduled = false;
        (
            std::mem::take(&mut queue.entities),
            std::mem::take(&mut queue.deferred),
        )
    });

    let mut processed = 0;
    for id in entities {
        let keys: Vec<Key> = id
            .with_state(|state| state.batch.drain(..).collect())
            .unwrap_or_default();
        if keys.is_empty() {
            continue;
        }
        processed += 1;
        tracing::trace!(entity = ?id, keys = keys.len(), "flush");
        // Batched delivery logs listener failures itself.
        let _ = dispatch::deliver(id, Signal::Flushed(keys.into()), Delivery::Batched);
    }

    for callback in deferred {
        processed += 1;
        callback();
    }

    TASKS.with(|pool| {
        if let Ok(mut pool) = pool.try_borrow_mut() {
            pool.run_until_stalled();
        }
    });

    processed
}

/// Tick until nothing is pending on this thread.
///
/// Fails with [`Error::Runaway`] if work is still queued after the configured
/// `max_ticks`, which means something keeps re-triggering itself.
pub fn run_until_idle() -> Result<usize> {
    let max_ticks = CONFIG.with(|config| config.borrow().max_ticks);
    let mut total = 0;
    for _ in 0..max_ticks {
        if !is_tick_scheduled() {
            return Ok(total);
        }
        total += tick();
    }
    if is_tick_scheduled() {
        return Err(Error::Runaway { ticks: max_ticks });
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn deferred_callbacks_run_on_tick() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        defer(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });

        assert!(is_tick_scheduled());
        assert_eq!(runs.load(Ordering::Relaxed), 0);

        run_until_idle().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert!(!is_tick_scheduled());
    }

    #[test]
    fn work_queued_during_tick_waits_for_next_tick() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        defer(move || {
            let r2 = r.clone();
            r.fetch_add(1, Ordering::Relaxed);
            defer(move || {
                r2.fetch_add(1, Ordering::Relaxed);
            });
        });

        tick();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert!(is_tick_scheduled());

        tick();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn hook_fires_once_per_idle_to_pending_edge() {
        let requests = Arc::new(AtomicUsize::new(0));
        let r = requests.clone();
        Scheduler::new()
            .on_tick_requested(move || {
                r.fetch_add(1, Ordering::Relaxed);
            })
            .install();

        defer(|| {});
        defer(|| {});
        assert_eq!(requests.load(Ordering::Relaxed), 1);

        run_until_idle().unwrap();
        defer(|| {});
        assert_eq!(requests.load(Ordering::Relaxed), 2);

        run_until_idle().unwrap();
        Scheduler::new().install();
    }

    #[test]
    fn nested_tick_is_ignored() {
        cov_mark::check!(nested_tick_ignored);
        defer(|| {
            assert_eq!(tick(), 0);
        });
        run_until_idle().unwrap();
    }

    #[test]
    fn runaway_work_is_reported() {
        fn requeue(stop: Arc<AtomicBool>) {
            if !stop.load(Ordering::Relaxed) {
                defer(move || requeue(stop));
            }
        }

        Scheduler::new().max_ticks(3).install();
        let stop = Arc::new(AtomicBool::new(false));
        requeue(stop.clone());

        assert_eq!(run_until_idle(), Err(Error::Runaway { ticks: 3 }));

        stop.store(true, Ordering::Relaxed);
        Scheduler::new().install();
        run_until_idle().unwrap();
        assert!(!is_tick_scheduled());
    }

    #[test]
    fn local_tasks_are_polled_on_tick() {
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        spawn_local(async move {
            d.store(true, Ordering::Relaxed);
        });

        run_until_idle().unwrap();
        assert!(done.load(Ordering::Relaxed));
    }
}
