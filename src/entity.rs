//! Entity handles and the per-instance lifecycle.
//!
//! An [`Entity`] is a `Copy` handle into the global arena. The record behind
//! it moves through `Constructing -> Active -> Destroyed`, never backwards:
//!
//! - **construct** ([`Class::construct`]): the record is allocated and the
//!   declared fields are stored. Writes are stored without signals.
//! - **activate** ([`Entity::activate`]): instruction fields are installed,
//!   entity-valued fields are adopted as children and activated, constructor
//!   arguments are processed left to right, then `Ready` is emitted.
//! - **destroy** ([`Entity::destroy`]): owned children are destroyed first,
//!   then `Terminal` is delivered, then the store is frozen and any pending
//!   markers are rejected.
//!
//! Destroyed records stay readable until [`Entity::release`] removes them.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, LazyLock};

use papaya::HashMap as PapayaHashMap;

use crate::arena::{EntityId, Status, entity_arena_insert, entity_arena_remove};
use crate::class::{Class, Field, Method};
use crate::construct::{self, Arg};
use crate::context::Context;
use crate::dispatch::{self, Subscription};
use crate::effect::{self, Cleanup, EffectHandle, untracked};
use crate::error::{Error, Result};
use crate::hash::{FastHashMap, FastIndexMap};
use crate::instruction::{self, Getter};
use crate::pending::{Access, Pending};
use crate::signal::{Reply, Signal};
use crate::value::{Callable, Key, Snapshot, Value};

// Global side table: bound callable id -> original method.
// Lets collaborators recover the unbound implementation.
static BOUND_METHODS: LazyLock<PapayaHashMap<u64, Method>> = LazyLock::new(PapayaHashMap::new);

thread_local! {
    // Entities with a silent merge running on this thread. Writes to them,
    // through accessors and setters too, record their key without a signal.
    static SILENCED: RefCell<Vec<EntityId>> = const { RefCell::new(Vec::new()) };
}

struct SilenceGuard(EntityId);

impl SilenceGuard {
    fn new(id: EntityId) -> Self {
        SILENCED.with(|silenced| silenced.borrow_mut().push(id));
        Self(id)
    }
}

impl Drop for SilenceGuard {
    fn drop(&mut self) {
        SILENCED.with(|silenced| {
            let mut silenced = silenced.borrow_mut();
            if let Some(index) = silenced.iter().rposition(|id| *id == self.0) {
                silenced.remove(index);
            }
        });
    }
}

fn is_silenced(id: EntityId) -> bool {
    SILENCED.with(|silenced| silenced.borrow().contains(&id))
}

/// Outcome of a write guard.
pub enum Verdict {
    /// Store the new value as is.
    Accept,
    /// Drop the write: no mutation, no signal.
    Reject,
    /// Store the value returned by this function instead.
    Commit(Box<dyn FnOnce() -> Value + Send>),
}

/// Validation hook for [`Entity::update_with`]: `(next, previous) -> Verdict`.
pub type Guard = Arc<dyn Fn(&Value, &Value) -> Verdict + Send + Sync>;

/// Handle to an entity record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(EntityId);

impl Entity {
    pub(crate) fn allocate(class: Class, args: Vec<Arg>) -> Self {
        Self(entity_arena_insert(class, args))
    }

    pub(crate) fn from_id(id: EntityId) -> Self {
        Self(id)
    }

    pub(crate) fn id(self) -> EntityId {
        self.0
    }

    pub fn class(self) -> Result<Class> {
        self.0.class().ok_or(Error::Stale)
    }

    /// Lifecycle status; `None` once the record has been released.
    pub fn status(self) -> Option<Status> {
        self.0.status()
    }

    pub fn is_active(self) -> bool {
        self.status() == Some(Status::Active)
    }

    /// Destroyed or released.
    pub fn is_destroyed(self) -> bool {
        matches!(self.status(), None | Some(Status::Destroyed))
    }

    /// Display id: `Class-uid`, or the label given at construction.
    pub fn label(self) -> Arc<str> {
        self.0
            .with_state(|state| state.label.clone())
            .unwrap_or_else(|| "<released>".into())
    }

    pub fn parent(self) -> Option<Entity> {
        self.0.with_state(|state| state.parent).flatten().map(Self)
    }

    /// Owned children, in adoption order.
    pub fn children(self) -> Vec<Entity> {
        self.0
            .with_state(|state| state.children.iter().copied().map(Self).collect())
            .unwrap_or_default()
    }

    /// The context scope this entity was first registered in.
    pub fn context(self) -> Option<Context> {
        Context::of(self)
    }

    fn destroyed_error(self, key: &Key) -> Error {
        Error::Destroyed {
            entity: self.label(),
            key: key.as_arc(),
        }
    }

    /// Transition to `Active` and emit `Ready`. Idempotent.
    pub fn activate(self) -> Result<()> {
        let args = self
            .0
            .with_state(|state| {
                if state.status != Status::Constructing {
                    return None;
                }
                state.status = Status::Active;
                Some(std::mem::take(&mut state.args))
            })
            .ok_or(Error::Stale)?;
        let Some(args) = args else {
            cov_mark::hit!(activate_is_idempotent);
            return Ok(());
        };
        tracing::debug!(entity = %self, "activating");

        self.promote()?;
        construct::process_args(self, args)?;

        // An init argument may have torn the entity down already.
        if self.status() != Some(Status::Active) {
            return Ok(());
        }
        dispatch::emit(self, Signal::Ready)
    }

    /// Install instruction fields, then adopt and activate entity-valued fields.
    fn promote(self) -> Result<()> {
        let class = self.class()?;
        for (key, field) in class.fields() {
            if let Field::Instruction(instruction) = field {
                instruction::apply(self, &key, &instruction)?;
            }
        }

        let candidates: Vec<Entity> = self
            .0
            .with_state(|state| state.store.values().filter_map(Value::as_entity).collect())
            .unwrap_or_default();
        for candidate in candidates {
            self.claim(candidate);
        }

        let children = self.children();
        for child in &children {
            child.activate()?;
        }
        if let Some(context) = Context::of(self) {
            for child in children {
                context.include_tree(child);
            }
        }
        Ok(())
    }

    fn ancestors(self) -> Vec<Entity> {
        let mut ancestors = Vec::new();
        let mut current = self.parent();
        while let Some(entity) = current {
            if ancestors.contains(&entity) {
                break;
            }
            ancestors.push(entity);
            current = entity.parent();
        }
        ancestors
    }

    /// Record `self` as the parent of `child` if it has none yet.
    fn claim(self, child: Entity) -> bool {
        if child == self || self.ancestors().contains(&child) {
            return false;
        }
        let claimed = child
            .0
            .with_state(|state| {
                if state.parent.is_some() || state.is_frozen() {
                    return false;
                }
                state.parent = Some(self.0);
                true
            })
            .unwrap_or(false);
        if claimed {
            cov_mark::hit!(child_adopted);
            self.0.with_state(|state| state.children.push(child.0));
        }
        claimed
    }

    /// Destroy children, deliver `Terminal`, then freeze. Idempotent.
    ///
    /// Returns the first error raised by a terminal listener.
    pub fn destroy(self) -> Result<()> {
        let children = self
            .0
            .with_state(|state| {
                if state.terminating {
                    return None;
                }
                state.terminating = true;
                Some(state.children.clone())
            })
            .flatten();
        let Some(children) = children else {
            cov_mark::hit!(destroy_is_idempotent);
            return Ok(());
        };
        tracing::debug!(entity = %self, children = children.len(), "destroying");

        for child in children.into_iter().map(Self) {
            if let Err(error) = child.destroy() {
                tracing::warn!(entity = %self, child = %child, %error, "child teardown failed");
            }
        }

        let result = dispatch::emit(self, Signal::Terminal);

        let (waiting, args) = self
            .0
            .with_state(|state| {
                state.status = Status::Destroyed;
                state.ready_sent = true;
                state.listeners.clear();
                state.batch.clear();
                (
                    std::mem::take(&mut state.waiting),
                    std::mem::take(&mut state.args),
                )
            })
            .unwrap_or_default();
        drop(args);

        let label = self.label();
        for (key, pending) in waiting {
            pending.reject(Error::Destroyed {
                entity: label.clone(),
                key: key.as_arc(),
            });
        }
        result
    }

    /// Destroy if needed, then remove the record from the arena. Further use
    /// of this handle reports [`Error::Stale`].
    pub fn release(self) {
        if let Err(error) = self.destroy() {
            tracing::warn!(entity = %self, %error, "teardown failed during release");
        }
        let parent = self.parent();
        if let Some(record) = entity_arena_remove(self.0) {
            let state = record.state.into_inner();
            let methods = BOUND_METHODS.pin();
            for callable in state.bound.values() {
                methods.remove(&callable.id());
            }
        }
        if let Some(parent) = parent {
            parent
                .0
                .with_state(|state| state.children.retain(|child| *child != self.0));
        }
    }

    /// Read a property, honoring custom accessors. The read is tracked.
    ///
    /// Plain properties read as `Undefined` when unset; use
    /// [`access`](Entity::access) with `required` to wait for a value.
    pub fn get(self, key: impl Into<Key>) -> Access {
        let key = key.into();
        effect::track_read(self.0, &key);
        let getter = self
            .0
            .with_state(|state| state.accessors.get(&key).and_then(|accessor| accessor.get.clone()));
        match getter {
            None => Access::Failed(Error::Stale),
            Some(Some(get)) => get(self),
            Some(None) => self.access(key, false),
        }
    }

    /// Read the stored value. The read is tracked.
    ///
    /// A missing key reads as `Undefined` unless `required`, in which case a
    /// [`Pending`] marker is returned that resolves on the first write and is
    /// rejected if the entity is destroyed first. Repeated reads share one
    /// marker.
    pub fn access(self, key: impl Into<Key>, required: bool) -> Access {
        let key = key.into();
        effect::track_read(self.0, &key);
        self.0
            .with_state(|state| {
                if let Some(value) = state.store.get(&key) {
                    return Access::Ready(value.clone());
                }
                if !required {
                    return Access::Ready(Value::Undefined);
                }
                if state.is_frozen() {
                    return Access::Failed(Error::Destroyed {
                        entity: state.label.clone(),
                        key: key.as_arc(),
                    });
                }
                let pending = state
                    .waiting
                    .entry(key.clone())
                    .or_insert_with(|| Pending::new(key.clone()))
                    .clone();
                Access::Pending(pending)
            })
            .unwrap_or(Access::Failed(Error::Stale))
    }

    /// Stored value without tracking or accessors.
    pub fn peek(self, key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        self.0
            .with_state(|state| state.store.get(&key).cloned())
            .flatten()
    }

    /// Stored keys in first-write order.
    pub fn keys(self) -> Vec<Key> {
        self.0
            .with_state(|state| state.store.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Property assignment, honoring custom accessors.
    pub fn set(self, key: impl Into<Key>, value: Value) -> Result<()> {
        let key = key.into();
        let accessor = self
            .0
            .with_state(|state| {
                state
                    .accessors
                    .get(&key)
                    .map(|accessor| (accessor.get.is_some(), accessor.set.clone()))
            })
            .ok_or(Error::Stale)?;
        match accessor {
            Some((_, Some(set))) => set(self, value),
            Some((true, None)) => Err(Error::ReadOnly {
                entity: self.label(),
                key: key.as_arc(),
            }),
            _ => self.write(key, value, None, false),
        }
    }

    /// Write to the store directly, bypassing accessors.
    pub fn update(self, key: impl Into<Key>, value: Value) -> Result<()> {
        self.write(key.into(), value, None, false)
    }

    /// [`update`](Entity::update) through a validation guard.
    pub fn update_with(self, key: impl Into<Key>, value: Value, guard: &Guard) -> Result<()> {
        self.write(key.into(), value, Some(guard), false)
    }

    /// Define `key` with an initial value, optionally without a key signal.
    pub fn manage(self, key: impl Into<Key>, initial: Value, silent: bool) -> Result<()> {
        self.write(key.into(), initial, None, silent)
    }

    /// Merge many values. Keys with a class setter override go through it;
    /// the rest go through [`set`](Entity::set), accessors included.
    ///
    /// Once the entity has announced `Ready`, listeners first receive
    /// [`Signal::Assigning`] with the merged keys. A silent merge then
    /// emits no `Key` signals; its keys still join the next flush.
    pub fn assign<I, K>(self, values: I, silent: bool) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Key>,
    {
        let class = self.class()?;
        let values: Vec<(Key, Value)> = values
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();
        let announce = self
            .0
            .with_state(|state| state.status == Status::Active && state.ready_sent)
            .unwrap_or(false);
        if announce && !values.is_empty() {
            let keys: Arc<[Key]> = values.iter().map(|(key, _)| key.clone()).collect();
            dispatch::emit(self, Signal::Assigning(keys))?;
        }

        let _silence = silent.then(|| SilenceGuard::new(self.0));
        for (key, value) in values {
            match class.find_setter(&key) {
                Some(setter) => setter(self, value)?,
                None => self.set(key, value)?,
            }
        }
        Ok(())
    }

    pub(crate) fn write(
        self,
        key: Key,
        value: Value,
        guard: Option<&Guard>,
        silent: bool,
    ) -> Result<()> {
        let silent = silent || is_silenced(self.0);
        let (status, previous) = self
            .0
            .with_state(|state| (state.status, state.store.get(&key).cloned()))
            .ok_or(Error::Stale)?;
        if status == Status::Destroyed {
            return Err(self.destroyed_error(&key));
        }

        let exists = previous.is_some();
        let previous = previous.unwrap_or_default();
        let value = match guard.map(|guard| guard(&value, &previous)) {
            None | Some(Verdict::Accept) => value,
            Some(Verdict::Reject) => {
                cov_mark::hit!(guard_rejected_write);
                return Ok(());
            }
            Some(Verdict::Commit(commit)) => commit(),
        };
        if exists && value.same(&previous) {
            cov_mark::hit!(equal_write_skipped);
            return Ok(());
        }

        let adopted = match &value {
            Value::Entity(child) if self.claim(*child) => Some(*child),
            _ => None,
        };

        let waiting = self
            .0
            .with_state(|state| {
                if state.is_frozen() {
                    return None;
                }
                state.store.insert(key.clone(), value.clone());
                Some(state.waiting.remove(&key))
            })
            .ok_or(Error::Stale)?
            .ok_or_else(|| self.destroyed_error(&key))?;
        if let Some(pending) = waiting {
            pending.resolve(value);
        }

        if status == Status::Constructing {
            cov_mark::hit!(quiet_write_while_constructing);
            return Ok(());
        }
        if let Some(child) = adopted {
            child.activate()?;
            if let Some(context) = Context::of(self) {
                context.include_tree(child);
            }
        }
        dispatch::schedule_key_change(self, key, silent)
    }

    /// Store a value with no signal and no adoption. Resolves a waiting marker.
    pub(crate) fn store_raw(self, key: Key, value: Value) {
        let waiting = self
            .0
            .with_state(|state| {
                state.store.insert(key.clone(), value.clone());
                state.waiting.remove(&key)
            })
            .flatten();
        if let Some(pending) = waiting {
            pending.resolve(value);
        }
    }

    pub(crate) fn install_accessor(self, key: Key, accessor: instruction::Accessor) -> Result<()> {
        self.0
            .with_state(|state| {
                state.accessors.insert(key, accessor);
            })
            .ok_or(Error::Stale)
    }

    /// Frozen snapshot of every enumerable property.
    ///
    /// Nested entities become nested snapshots and references are replaced by
    /// their current content. A back-reference to an entity whose export is
    /// still in progress stays a `Value::Entity`.
    pub fn export(self) -> Result<Snapshot> {
        let mut seen = FastHashMap::default();
        self.export_into(&mut seen)
    }

    fn export_into(self, seen: &mut FastHashMap<Entity, Option<Snapshot>>) -> Result<Snapshot> {
        seen.insert(self, None);
        let (entries, computed) = self
            .0
            .with_state(|state| {
                let entries: Vec<(Key, Value)> = state
                    .store
                    .iter()
                    .filter(|(key, _)| {
                        state
                            .accessors
                            .get(*key)
                            .is_none_or(|accessor| accessor.enumerable)
                    })
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                let mut computed: Vec<(Key, Getter)> = state
                    .accessors
                    .iter()
                    .filter(|(key, accessor)| accessor.enumerable && !state.store.contains_key(*key))
                    .filter_map(|(key, accessor)| accessor.get.clone().map(|get| (key.clone(), get)))
                    .collect();
                computed.sort_by(|a, b| a.0.cmp(&b.0));
                (entries, computed)
            })
            .ok_or(Error::Stale)?;

        let mut out = FastIndexMap::default();
        for (key, value) in entries {
            out.insert(key, flatten(value, seen)?);
        }
        for (key, get) in computed {
            if let Access::Ready(value) = untracked(|| get(self)) {
                out.insert(key, flatten(value, seen)?);
            }
        }

        let snapshot: Snapshot = Arc::new(out);
        seen.insert(self, Some(snapshot.clone()));
        Ok(snapshot)
    }

    /// Listen to every signal. See [`dispatch::add_listener`].
    pub fn listen<F>(self, callback: F) -> Subscription
    where
        F: Fn(&Signal, Entity) -> Result<Reply> + Send + Sync + 'static,
    {
        dispatch::add_listener(self, callback)
    }

    /// Listen to the given keys only.
    pub fn listen_keys<I, K, F>(self, keys: I, callback: F) -> Subscription
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
        F: Fn(&Signal, Entity) -> Result<Reply> + Send + Sync + 'static,
    {
        dispatch::add_key_listener(self, keys, callback)
    }

    /// Emit a custom event key to listeners right now.
    pub fn emit(self, event: impl Into<Key>) -> Result<()> {
        dispatch::emit(self, Signal::Key(event.into()))
    }

    /// Dependency-tracked effect. See [`effect::tracked_effect`].
    pub fn effect<F>(self, f: F) -> EffectHandle
    where
        F: FnMut(Entity) -> Access<Option<Cleanup>> + Send + 'static,
    {
        effect::tracked_effect(self, f)
    }

    /// Method bound to this instance. Bound once, then cached.
    pub fn method(self, name: impl Into<Key>) -> Result<Callable> {
        let name = name.into();
        let cached = self
            .0
            .with_state(|state| state.bound.get(&name).cloned())
            .ok_or(Error::Stale)?;
        if let Some(callable) = cached {
            cov_mark::hit!(bound_method_cached);
            return Ok(callable);
        }

        let method = self
            .class()?
            .find_method(&name)
            .ok_or_else(|| Error::NoMethod {
                entity: self.label(),
                name: name.as_arc(),
            })?;
        let target = method.clone();
        let callable = Callable::new(move |args| target(self, args));

        let bound = self
            .0
            .with_state(|state| state.bound.entry(name).or_insert(callable).clone())
            .ok_or(Error::Stale)?;
        BOUND_METHODS.pin().insert(bound.id(), method);
        Ok(bound)
    }

    /// Call a method by name.
    pub fn call(self, name: impl Into<Key>, args: &[Value]) -> Result<Value> {
        self.method(name)?.call(args)
    }
}

/// The original method behind a bound callable, if it is one.
pub fn unbind(callable: &Callable) -> Option<Method> {
    BOUND_METHODS.pin().get(&callable.id()).cloned()
}

fn flatten(value: Value, seen: &mut FastHashMap<Entity, Option<Snapshot>>) -> Result<Value> {
    match value {
        Value::Entity(entity) => match seen.get(&entity) {
            Some(Some(snapshot)) => Ok(Value::Map(snapshot.clone())),
            Some(None) => {
                cov_mark::hit!(export_cycle_left_as_entity);
                Ok(Value::Entity(entity))
            }
            None => match entity.export_into(seen) {
                Ok(snapshot) => Ok(Value::Map(snapshot)),
                Err(Error::Stale) => Ok(Value::Entity(entity)),
                Err(error) => Err(error),
            },
        },
        Value::Ref(reference) => flatten(reference.get(), seen),
        Value::List(items) => {
            let items = items
                .iter()
                .cloned()
                .map(|item| flatten(item, seen))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::List(items.into()))
        }
        other => Ok(other),
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.label())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
