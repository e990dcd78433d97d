//! Hierarchical, type-keyed context registry.
//!
//! A [`Context`] is a scope in a parent-linked tree. Registering an entity
//! binds it under every class in its lineage (excluding the base class), so
//! lookups by a parent class find subclass instances too. Lookups that miss
//! locally walk up the parent chain.
//!
//! Two distinct entities bound to the same class in one scope make that
//! binding ambiguous. Nothing fails at registration; only a later lookup of
//! that class does.
//!
//! Scopes also carry:
//! - **expectations** ([`Context::expect`]): callbacks fired once per matching
//!   entity registered in the scope or any descendant, when it becomes ready.
//! - **collections** ([`Context::collect`]): live sets of matching entities
//!   registered in or below the scope.
//!
//! [`Context::pop`] tears a scope down: child scopes first, then every
//! recorded cleanup in reverse order. Destroying the entities the scope
//! constructed itself is one of those cleanups.

use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::class::{Class, ClassId};
use crate::dispatch;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::hash::{FastHashMap, FastHashSet, FastIndexMap, FastIndexSet};
use crate::signal::{Reply, Signal};
use crate::value::{Key, Value};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Cleanup returned by an expectation callback; runs when the scope that
/// registered the matching entity pops.
pub type Dispose = Box<dyn FnOnce() + Send>;

type ExpectFn = Arc<dyn Fn(Entity) -> Option<Dispose> + Send + Sync>;

#[derive(Clone, Copy)]
enum Binding {
    One(Entity),
    Ambiguous,
}

struct Registration {
    entity: Entity,
    classes: Vec<ClassId>,
    /// Constructed by this scope; destroyed when it goes away.
    owned: bool,
    /// Named in the inputs rather than found by walking children.
    explicit: bool,
    /// Unregisters the entity when it is destroyed from elsewhere.
    watch: Option<dispatch::Subscription>,
}

struct Expect {
    class: Class,
    callback: ExpectFn,
    seen: Mutex<FastHashSet<Entity>>,
    active: AtomicBool,
}

struct CollectionInner {
    class: Class,
    items: Mutex<FastIndexSet<Entity>>,
}

enum ScopeCleanup {
    Run(Dispose),
    Destroy(Entity),
}

#[derive(Default)]
struct Scope {
    bindings: FastHashMap<ClassId, Binding>,
    expects: Vec<Arc<Expect>>,
    registered: Vec<Registration>,
    /// Inputs applied by the last `set_all`, for diffing.
    inputs: FastIndexMap<Key, Value>,
    applied: FastHashMap<Key, Entity>,
    cleanups: Vec<ScopeCleanup>,
    children: Vec<Weak<ContextInner>>,
    collections: Vec<Weak<CollectionInner>>,
    popped: bool,
}

pub(crate) struct ContextInner {
    id: u64,
    parent: Option<Context>,
    scope: Mutex<Scope>,
}

/// Handle to a context scope. Clones share the scope.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A standalone root scope.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Context>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                parent,
                scope: Mutex::new(Scope::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    pub fn is_popped(&self) -> bool {
        self.inner.scope.lock().popped
    }

    /// Child scope whose lookups fall through to this one.
    pub fn push(&self) -> Context {
        let child = Self::with_parent(Some(self.clone()));
        let mut scope = self.inner.scope.lock();
        scope.children.retain(|child| child.strong_count() > 0);
        scope.children.push(Arc::downgrade(&child.inner));
        drop(scope);
        tracing::debug!(scope = child.inner.id, parent = self.inner.id, "pushed");
        child
    }

    /// [`push`](Context::push) and apply `inputs` with [`set_all`](Context::set_all).
    pub fn push_with<I, K>(&self, inputs: I) -> Result<Context>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Key>,
    {
        let child = self.push();
        child.set_all(inputs)?;
        Ok(child)
    }

    /// The live scope `entity` was first registered in.
    pub fn of(entity: Entity) -> Option<Context> {
        let inner = entity
            .id()
            .with_state(|state| state.context.clone())
            .flatten()?
            .upgrade()?;
        if inner.scope.lock().popped {
            return None;
        }
        Some(Context { inner })
    }

    /// Register one entity, or construct and register an instance of a class.
    ///
    /// Instances constructed here are owned by the scope and destroyed when it
    /// pops. The entity's children are registered implicitly.
    pub fn add(&self, value: impl Into<Value>) -> Result<Entity> {
        let value = value.into();
        let key = Key::from(self.inner.scope.lock().registered.len());
        check(&key, &value)?;
        let (entity, constructed) = resolve(&key, &value)?;
        self.register(entity, constructed, true)?;
        if constructed {
            entity.activate()?;
        }
        self.include_tree(entity);
        Ok(entity)
    }

    fn register(&self, entity: Entity, owned: bool, explicit: bool) -> Result<()> {
        let lineage = entity.class()?.lineage();
        {
            let mut scope = self.inner.scope.lock();
            if scope.popped {
                tracing::debug!(entity = %entity, scope = self.inner.id, "register on popped scope ignored");
                return Ok(());
            }
            if scope.registered.iter().any(|existing| existing.entity == entity) {
                cov_mark::hit!(duplicate_registration_ignored);
                return Ok(());
            }
            let classes: Vec<ClassId> = lineage.iter().map(Class::id).collect();
            bind(&mut scope.bindings, entity, &classes);
            scope.registered.push(Registration {
                entity,
                classes,
                owned,
                explicit,
                watch: None,
            });
            if owned {
                scope.cleanups.push(ScopeCleanup::Destroy(entity));
            }
        }

        let scope = Arc::downgrade(&self.inner);
        entity.id().with_state(|state| {
            if state.context.is_none() {
                state.context = Some(scope.clone());
            }
        });
        tracing::debug!(entity = %entity, scope = self.inner.id, owned, explicit, "registered");

        let watch = dispatch::add_key_listener(
            entity,
            Vec::<Key>::new(),
            move |signal: &Signal, this: Entity| {
                if matches!(signal, Signal::Terminal) {
                    if let Some(inner) = scope.upgrade() {
                        cov_mark::hit!(destroyed_entity_unregistered);
                        Context { inner }.unregister(this);
                    }
                }
                Ok(Reply::Keep)
            },
        );
        {
            let mut registered = self.inner.scope.lock();
            match registered
                .registered
                .iter_mut()
                .find(|registration| registration.entity == entity)
            {
                Some(registration) => registration.watch = Some(watch),
                None => watch.cancel(),
            }
        }

        self.announce(entity, &lineage);
        Ok(())
    }

    /// Register `entity` and all of its descendants, without ownership.
    pub(crate) fn include_tree(&self, entity: Entity) {
        let mut stack = vec![entity];
        while let Some(next) = stack.pop() {
            if let Err(error) = self.register(next, false, false) {
                tracing::warn!(entity = %next, %error, "implicit registration failed");
                continue;
            }
            stack.extend(next.children());
        }
    }

    /// Feed a new registration to matching expectations and collections,
    /// here and in every ancestor scope.
    fn announce(&self, entity: Entity, lineage: &[Class]) {
        let mut expects = Vec::new();
        let mut current = Some(self);
        while let Some(context) = current {
            let scope = context.inner.scope.lock();
            expects.extend(
                scope
                    .expects
                    .iter()
                    .filter(|expect| lineage.contains(&expect.class))
                    .cloned(),
            );
            for collection in scope.collections.iter().filter_map(Weak::upgrade) {
                if lineage.contains(&collection.class) {
                    collection.items.lock().insert(entity);
                }
            }
            drop(scope);
            current = context.parent();
        }
        for expect in expects {
            self.arm(expect, entity);
        }
    }

    /// Fire `expect` for `entity` once it is ready, at most once per pair.
    fn arm(&self, expect: Arc<Expect>, entity: Entity) {
        if !expect.seen.lock().insert(entity) {
            cov_mark::hit!(expectation_fires_once);
            return;
        }
        let registering = Arc::downgrade(&self.inner);
        dispatch::add_listener(entity, move |signal, ready| match signal {
            Signal::Ready => {
                if !expect.active.load(Ordering::Acquire) {
                    return Ok(Reply::Remove);
                }
                if let Some(dispose) = (expect.callback)(ready) {
                    let leftover = match registering.upgrade() {
                        Some(inner) => {
                            let mut scope = inner.scope.lock();
                            if scope.popped {
                                Some(dispose)
                            } else {
                                scope.cleanups.push(ScopeCleanup::Run(dispose));
                                None
                            }
                        }
                        None => Some(dispose),
                    };
                    if let Some(dispose) = leftover {
                        dispose();
                    }
                }
                Ok(Reply::Remove)
            }
            Signal::Terminal => Ok(Reply::Remove),
            _ => Ok(Reply::Keep),
        });
    }

    /// Drop a registration, rebuilding bindings. Owned entities are destroyed.
    fn unregister(&self, entity: Entity) {
        let (owned, explicit) = {
            let mut scope = self.inner.scope.lock();
            let Some(index) = scope
                .registered
                .iter()
                .position(|registration| registration.entity == entity)
            else {
                return;
            };
            let removed = scope.registered.remove(index);
            let Scope {
                bindings,
                registered,
                cleanups,
                ..
            } = &mut *scope;
            bindings.clear();
            for registration in registered.iter() {
                bind(bindings, registration.entity, &registration.classes);
            }
            cleanups.retain(|cleanup| !matches!(cleanup, ScopeCleanup::Destroy(owned) if *owned == entity));
            if let Some(watch) = &removed.watch {
                watch.cancel();
            }
            (removed.owned, removed.explicit)
        };
        self.retract(entity);
        tracing::debug!(entity = %entity, scope = self.inner.id, owned, explicit, "unregistered");

        if owned {
            if let Err(error) = entity.destroy() {
                tracing::warn!(entity = %entity, %error, "owned entity teardown failed");
            }
        }
    }

    /// Remove `entity` from collections here and above.
    fn retract(&self, entity: Entity) {
        let mut current = Some(self);
        while let Some(context) = current {
            let collections: Vec<_> = context
                .inner
                .scope
                .lock()
                .collections
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for collection in collections {
                collection.items.lock().shift_remove(&entity);
            }
            current = context.parent();
        }
    }

    fn lookup(&self, class: &Class) -> Result<Option<Entity>> {
        let id = class.id();
        let mut current = Some(self);
        while let Some(context) = current {
            let binding = context.inner.scope.lock().bindings.get(&id).copied();
            match binding {
                Some(Binding::One(entity)) => return Ok(Some(entity)),
                Some(Binding::Ambiguous) => {
                    return Err(Error::Ambiguous {
                        class: class.name_arc(),
                    });
                }
                None => current = context.parent(),
            }
        }
        Ok(None)
    }

    /// Required lookup: the nearest instance of `class`.
    pub fn get(&self, class: &Class) -> Result<Entity> {
        self.lookup(class)?.ok_or_else(|| Error::NotFound {
            class: class.name_arc(),
        })
    }

    /// Optional lookup. Still fails if the nearest binding is ambiguous.
    pub fn find(&self, class: &Class) -> Result<Option<Entity>> {
        self.lookup(class)
    }

    /// Reactive lookup: call `callback` for each `class` instance registered
    /// from now on in this scope or below, once it is ready.
    ///
    /// A returned [`Dispose`] runs when the scope that registered the instance
    /// pops.
    pub fn expect<F>(&self, class: &Class, callback: F) -> Expectation
    where
        F: Fn(Entity) -> Option<Dispose> + Send + Sync + 'static,
    {
        let expect = Arc::new(Expect {
            class: class.clone(),
            callback: Arc::new(callback),
            seen: Mutex::new(FastHashSet::default()),
            active: AtomicBool::new(true),
        });
        self.inner.scope.lock().expects.push(expect.clone());
        Expectation {
            scope: Arc::downgrade(&self.inner),
            expect,
        }
    }

    /// [`set_all_with`](Context::set_all_with) without a per-entity hook.
    pub fn set_all<I, K>(&self, inputs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Key>,
    {
        self.set_all_with(inputs, |_, _| Ok(()))
    }

    /// Reconcile this scope against a new set of named inputs.
    ///
    /// Each input is an entity or a class. Compared with the previous call:
    /// - unchanged keys are left alone;
    /// - keys that disappeared are unregistered, destroying what the scope
    ///   constructed;
    /// - new keys are registered, constructing classes first.
    ///
    /// After every new input is registered, `for_each` runs once per new
    /// input (before a constructed instance activates, so it can pre-wire
    /// values quietly), and each new entity's descendants are registered
    /// implicitly.
    pub fn set_all_with<I, K, F>(&self, inputs: I, mut for_each: F) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Key>,
        F: FnMut(&Key, Entity) -> Result<()>,
    {
        let inputs: FastIndexMap<Key, Value> = inputs
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();
        for (key, value) in &inputs {
            check(key, value)?;
        }

        let (removed, added) = {
            let mut scope = self.inner.scope.lock();
            if scope.popped {
                return Ok(());
            }
            let gone: Vec<Key> = scope
                .inputs
                .iter()
                .filter(|(key, value)| inputs.get(*key).is_none_or(|next| !next.same(value)))
                .map(|(key, _)| key.clone())
                .collect();
            let added: Vec<(Key, Value)> = inputs
                .iter()
                .filter(|(key, value)| {
                    let unchanged = scope.inputs.get(*key).is_some_and(|prev| prev.same(value));
                    if unchanged {
                        cov_mark::hit!(unchanged_input_skipped);
                    }
                    !unchanged
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            let mut removed = Vec::new();
            for key in &gone {
                if let Some(entity) = scope.applied.remove(key) {
                    removed.push(entity);
                }
            }
            // Still named under another key.
            removed.retain(|entity| !scope.applied.values().any(|other| other == entity));
            scope.inputs = inputs;
            (removed, added)
        };

        for entity in removed {
            self.unregister(entity);
        }

        let mut fresh = Vec::with_capacity(added.len());
        for (key, value) in added {
            let (entity, constructed) = resolve(&key, &value)?;
            self.register(entity, constructed, true)?;
            self.inner.scope.lock().applied.insert(key.clone(), entity);
            fresh.push((key, entity, constructed));
        }

        for (key, entity, constructed) in &fresh {
            for_each(key, *entity)?;
            if *constructed {
                entity.activate()?;
            }
        }
        for (_, entity, _) in &fresh {
            self.include_tree(*entity);
        }
        Ok(())
    }

    /// Live collection of every `class` instance registered in or below this
    /// scope.
    pub fn collect(&self, class: &Class) -> Collection {
        let id = class.id();
        let mut seed = Vec::new();
        let mut stack = vec![self.inner.clone()];
        while let Some(context) = stack.pop() {
            let scope = context.scope.lock();
            seed.extend(
                scope
                    .registered
                    .iter()
                    .filter(|registration| registration.classes.contains(&id))
                    .map(|registration| registration.entity),
            );
            stack.extend(scope.children.iter().filter_map(Weak::upgrade));
        }

        let inner = Arc::new(CollectionInner {
            class: class.clone(),
            items: Mutex::new(seed.into_iter().collect()),
        });
        let mut scope = self.inner.scope.lock();
        scope.collections.retain(|collection| collection.strong_count() > 0);
        scope.collections.push(Arc::downgrade(&inner));
        Collection { inner }
    }

    /// Tear the scope down. Idempotent.
    ///
    /// Child scopes pop first, then this scope's cleanups run in reverse
    /// registration order: expectation disposers and destruction of owned
    /// entities.
    pub fn pop(&self) {
        let (children, registered, cleanups) = {
            let mut scope = self.inner.scope.lock();
            if scope.popped {
                cov_mark::hit!(pop_is_idempotent);
                return;
            }
            scope.popped = true;
            scope.bindings.clear();
            for expect in scope.expects.drain(..) {
                expect.active.store(false, Ordering::Release);
            }
            scope.inputs.clear();
            scope.applied.clear();
            scope.collections.clear();
            (
                std::mem::take(&mut scope.children),
                std::mem::take(&mut scope.registered),
                std::mem::take(&mut scope.cleanups),
            )
        };
        tracing::debug!(scope = self.inner.id, cleanups = cleanups.len(), "popping");

        for child in children.iter().rev().filter_map(Weak::upgrade) {
            Context { inner: child }.pop();
        }
        for registration in &registered {
            if let Some(watch) = &registration.watch {
                watch.cancel();
            }
            self.retract(registration.entity);
        }
        for cleanup in cleanups.into_iter().rev() {
            match cleanup {
                ScopeCleanup::Run(dispose) => dispose(),
                ScopeCleanup::Destroy(entity) => {
                    if let Err(error) = entity.destroy() {
                        tracing::warn!(entity = %entity, %error, "owned entity teardown failed");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context#{}", self.inner.id)
    }
}

fn bind(bindings: &mut FastHashMap<ClassId, Binding>, entity: Entity, classes: &[ClassId]) {
    for class in classes {
        match bindings.entry(*class) {
            Entry::Vacant(slot) => {
                slot.insert(Binding::One(entity));
            }
            Entry::Occupied(mut slot) => {
                if !matches!(slot.get(), Binding::One(existing) if *existing == entity) {
                    cov_mark::hit!(ambiguous_binding_recorded);
                    slot.insert(Binding::Ambiguous);
                }
            }
        }
    }
}

/// Reject inputs that are neither entities nor concrete classes.
fn check(key: &Key, value: &Value) -> Result<()> {
    match value {
        Value::Entity(_) => Ok(()),
        Value::Class(class) if !class.is_abstract() => Ok(()),
        other => Err(Error::InvalidRegistration {
            key: key.as_arc(),
            value: format!("{other:?}"),
        }),
    }
}

/// Entity for an input, and whether it was constructed here.
fn resolve(key: &Key, value: &Value) -> Result<(Entity, bool)> {
    match value {
        Value::Entity(entity) => Ok((*entity, false)),
        Value::Class(class) => class.construct(Vec::new()).map(|entity| (entity, true)),
        other => Err(Error::InvalidRegistration {
            key: key.as_arc(),
            value: format!("{other:?}"),
        }),
    }
}

/// Handle for a reactive lookup registered with [`Context::expect`].
pub struct Expectation {
    scope: Weak<ContextInner>,
    expect: Arc<Expect>,
}

impl Expectation {
    /// Stop matching new registrations. Idempotent.
    pub fn cancel(&self) {
        self.expect.active.store(false, Ordering::Release);
        if let Some(inner) = self.scope.upgrade() {
            inner
                .scope
                .lock()
                .expects
                .retain(|expect| !Arc::ptr_eq(expect, &self.expect));
        }
    }
}

/// Live set of instances registered in or below a scope.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    pub fn class(&self) -> &Class {
        &self.inner.class
    }

    /// Current members in registration order.
    pub fn entities(&self) -> Vec<Entity> {
        self.inner.items.lock().iter().copied().collect()
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.inner.items.lock().contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn example() -> Class {
        Class::builder("Example").field("value", 0).build()
    }

    #[test]
    fn registering_raw_values_fails_with_key_and_value() {
        let context = Context::new();
        let error = context.set_all([("answer", Value::from(42))]).unwrap_err();

        assert_eq!(
            error,
            Error::InvalidRegistration {
                key: "answer".into(),
                value: "42".into(),
            }
        );
    }

    #[test]
    fn base_class_cannot_be_registered() {
        let context = Context::new();
        let error = context.add(Class::base()).unwrap_err();
        assert!(matches!(&error, Error::InvalidRegistration { key, .. } if &**key == "0"));
    }

    #[test]
    fn lookup_falls_through_to_parent() {
        let class = example();
        let root = Context::new();
        let entity = root.add(&class).unwrap();
        let child = root.push();

        assert_eq!(child.get(&class).unwrap(), entity);
        assert_eq!(Context::of(entity).unwrap().id(), root.id());
    }

    #[test]
    fn subclass_registers_under_every_ancestor() {
        let parent = example();
        let child = Class::builder("Special").extends(&parent).build();
        let context = Context::new();

        let entity = context.add(&child).unwrap();

        assert_eq!(context.get(&child).unwrap(), entity);
        assert_eq!(context.get(&parent).unwrap(), entity);
    }

    #[test]
    fn find_returns_none_when_missing() {
        let context = Context::new();
        let class = example();

        assert_eq!(context.find(&class), Ok(None));
        assert_eq!(
            context.get(&class).unwrap_err().to_string(),
            "Could not find Example in context."
        );
    }

    #[test]
    fn child_binding_shadows_ambiguous_parent() {
        cov_mark::check!(ambiguous_binding_recorded);
        let class = example();
        let root = Context::new();
        root.set_all([("a", Value::from(&class)), ("b", Value::from(&class))])
            .unwrap();
        let child = root.push();
        let local = child.add(&class).unwrap();

        assert!(matches!(root.get(&class), Err(Error::Ambiguous { .. })));
        assert_eq!(child.get(&class).unwrap(), local);
    }

    #[test]
    fn unchanged_inputs_are_kept_and_removed_inputs_destroyed() {
        cov_mark::check!(unchanged_input_skipped);
        let class = example();
        let other = Class::builder("Other").build();
        let context = Context::new();

        context
            .set_all([("keep", Value::from(&class)), ("drop", Value::from(&other))])
            .unwrap();
        let kept = context.get(&class).unwrap();
        let dropped = context.get(&other).unwrap();

        context.set_all([("keep", Value::from(&class))]).unwrap();

        assert_eq!(context.get(&class).unwrap(), kept);
        assert!(dropped.is_destroyed());
        assert!(matches!(context.get(&other), Err(Error::NotFound { .. })));
    }

    #[test]
    fn for_each_runs_before_activation() {
        let class = example();
        let context = Context::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));

        context
            .set_all_with([("example", Value::from(&class))], |key, entity| {
                statuses.lock().push((key.clone(), entity.status()));
                entity.set("value", Value::from(9))
            })
            .unwrap();

        let entity = context.get(&class).unwrap();
        assert_eq!(
            *statuses.lock(),
            [(Key::from("example"), Some(crate::Status::Constructing))]
        );
        assert!(entity.is_active());
        assert_eq!(entity.peek("value"), Some(Value::from(9)));
    }

    #[test]
    fn children_are_registered_implicitly() {
        let leaf = Class::builder("Leaf").build();
        let branch = Class::builder("Branch").child("leaf", &leaf).build();
        let context = Context::new();

        let root = context.add(&branch).unwrap();
        let found = context.get(&leaf).unwrap();

        assert_eq!(found.parent(), Some(root));

        // Adopted after registration.
        let extra = Class::builder("Extra").build();
        let late = extra.construct(Vec::new()).unwrap();
        root.set("late", late.into()).unwrap();
        assert_eq!(context.get(&extra).unwrap(), late);
    }

    #[test]
    fn removed_input_takes_its_children_out_of_scope() {
        cov_mark::check!(destroyed_entity_unregistered);
        let leaf = Class::builder("Leaf").build();
        let branch = Class::builder("Branch").child("leaf", &leaf).build();
        let context = Context::new();
        let leaves = context.collect(&leaf);

        context.set_all([("branch", Value::from(&branch))]).unwrap();
        let child = context.get(&leaf).unwrap();
        assert!(leaves.contains(child));

        context.set_all(Vec::<(&str, Value)>::new()).unwrap();

        assert!(child.is_destroyed());
        assert_eq!(context.find(&leaf), Ok(None));
        assert!(leaves.is_empty());
    }

    #[test]
    fn collection_tracks_registrations_below() {
        let class = example();
        let root = Context::new();
        let collection = root.collect(&class);
        let child = root.push();

        let first = child.add(&class).unwrap();
        let second = root.push().add(&class).unwrap();
        assert_eq!(collection.entities(), [first, second]);

        child.pop();
        assert_eq!(collection.entities(), [second]);
    }

    #[test]
    fn pop_is_idempotent_and_destroys_owned_only() {
        cov_mark::check!(pop_is_idempotent);
        let class = example();
        let context = Context::new();
        let owned = context.add(&class).unwrap();
        let borrowed = class.create(Vec::new()).unwrap();
        context.add(borrowed).unwrap();

        context.pop();
        context.pop();

        assert!(owned.is_destroyed());
        assert!(borrowed.is_active());
        assert!(Context::of(owned).is_none());
    }

    #[test]
    fn expectation_cleanup_runs_before_owned_destruction() {
        let class = example();
        let root = Context::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        root.expect(&class, move |entity| {
            let o = o.clone();
            let o2 = o.clone();
            entity.listen(move |signal, _| {
                if *signal == Signal::Terminal {
                    o2.lock().push("destroyed");
                }
                Ok(Reply::Keep)
            });
            Some(Box::new(move || o.lock().push("disposed")))
        });

        let scope = root.push();
        scope.add(&class).unwrap();
        scope.pop();

        assert_eq!(*order.lock(), ["disposed", "destroyed"]);
    }

    #[test]
    fn cancelled_expectation_stops_matching() {
        let class = example();
        let context = Context::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let expectation = context.expect(&class, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
            None
        });
        context.add(&class).unwrap();
        expectation.cancel();
        context.add(&class).unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
