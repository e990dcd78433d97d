// Entity arena - storage for entity records
//
// Every entity lives in one global slab. An EntityId is a slab index plus a
// generation: the generation is drawn from a monotonically increasing counter
// at insertion, so a released slot that gets reused never answers to an old id.
//
// The arena lock is only held long enough to reach a record; the record's own
// mutex guards its state. Neither lock is ever held while user code runs:
// callers copy what they need out of the record, release, then call out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use slab::Slab;

use crate::class::Class;
use crate::construct::Arg;
use crate::context::ContextInner;
use crate::hash::{FastHashMap, FastHashSet, FastIndexMap, FastIndexSet};
use crate::instruction::Accessor;
use crate::pending::Pending;
use crate::signal::{Listener, Signal};
use crate::value::{Callable, Key, Value};

/// Global entity arena
static ENTITY_ARENA: RwLock<Slab<EntityRecord>> = RwLock::new(Slab::new());

static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

/// Lifecycle status of an entity. Transitions only move forward.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Constructing = 0,
    Active = 1,
    Destroyed = 2,
}

/// Generational handle into the entity arena.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    /// Convert to usize for slab indexing
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Access the record with a closure (read-only arena access).
    ///
    /// Returns None if the record was released (stale id).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&EntityRecord) -> R,
    {
        let arena = ENTITY_ARENA.read();
        arena
            .get(self.index())
            .filter(|record| record.generation == self.generation)
            .map(f)
    }

    /// Lock the record's state and run a closure against it.
    ///
    /// The closure must not call back into the arena.
    pub fn with_state<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut EntityState) -> R,
    {
        self.with(|record| f(&mut record.state.lock()))
    }

    pub fn class(self) -> Option<Class> {
        self.with(|record| record.class.clone())
    }

    pub fn status(self) -> Option<Status> {
        self.with_state(|state| state.status)
    }
}

/// A listener plus its optional key filter.
pub struct ListenerEntry {
    pub(crate) id: u64,
    pub(crate) filter: Option<FastHashSet<Key>>,
    pub(crate) callback: Listener,
}

/// Arena slot for one entity.
pub struct EntityRecord {
    generation: u32,
    pub(crate) class: Class,
    pub(crate) state: Mutex<EntityState>,
}

/// Mutable part of an entity record.
pub struct EntityState {
    /// Display id, `Class-uid` unless a label argument replaced it.
    pub(crate) label: Arc<str>,
    pub(crate) status: Status,
    /// Set as soon as destruction starts so nested destroy calls are no-ops.
    pub(crate) terminating: bool,
    pub(crate) ready_sent: bool,
    /// First listener arrived before activation.
    pub(crate) awaiting_ready: bool,

    pub(crate) store: FastIndexMap<Key, Value>,
    /// Custom accessors installed by instructions.
    pub(crate) accessors: FastHashMap<Key, Accessor>,

    pub(crate) listeners: Vec<Arc<ListenerEntry>>,
    /// Signals merged in while a delivery pass is running.
    pub(crate) in_flight: Option<VecDeque<Signal>>,
    /// Keys changed since the last flush.
    pub(crate) batch: FastIndexSet<Key>,

    pub(crate) parent: Option<EntityId>,
    pub(crate) children: Vec<EntityId>,

    /// Deferred-value markers for required keys that have no value yet.
    pub(crate) waiting: FastHashMap<Key, Pending>,
    /// Methods bound to this instance, created on first access.
    pub(crate) bound: FastHashMap<Key, Callable>,
    pub(crate) context: Option<Weak<ContextInner>>,
    /// Constructor arguments, consumed on activation.
    pub(crate) args: Vec<Arg>,
}

impl EntityState {
    fn new(label: Arc<str>, args: Vec<Arg>) -> Self {
        Self {
            label,
            status: Status::Constructing,
            terminating: false,
            ready_sent: false,
            awaiting_ready: false,
            store: FastIndexMap::default(),
            accessors: FastHashMap::default(),
            listeners: Vec::new(),
            in_flight: None,
            batch: FastIndexSet::default(),
            parent: None,
            children: Vec::new(),
            waiting: FastHashMap::default(),
            bound: FastHashMap::default(),
            context: None,
            args,
        }
    }

    /// Frozen stores reject writes.
    pub(crate) fn is_frozen(&self) -> bool {
        self.status == Status::Destroyed
    }
}

/// Short base-36 uid used in default labels.
fn uid(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Insert a fresh record in the `Constructing` state and return its id.
pub fn entity_arena_insert(class: Class, args: Vec<Arg>) -> EntityId {
    let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    let label: Arc<str> = format!("{}-{}", class.name(), uid(generation)).into();
    let record = EntityRecord {
        generation,
        class,
        state: Mutex::new(EntityState::new(label, args)),
    };

    let mut arena = ENTITY_ARENA.write();
    let entry = arena.vacant_entry();
    let index = entry.key() as u32;
    entry.insert(record);
    EntityId { index, generation }
}

/// Remove a record from the arena. Stale ids are ignored.
pub fn entity_arena_remove(id: EntityId) -> Option<EntityRecord> {
    let mut arena = ENTITY_ARENA.write();
    let live = arena
        .get(id.index())
        .is_some_and(|record| record.generation == id.generation);
    if live {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}
