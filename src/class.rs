//! Runtime class descriptors.
//!
//! A [`Class`] is built once per type and shared by every instance. It holds
//! the declared fields, methods and setter overrides, plus a parent link that
//! gives the inheritance chain used for context type keys and method lookup.
//!
//! ```ignore
//! let counter = Class::builder("Counter")
//!     .field("count", 0)
//!     .method("increment", |this, _| {
//!         let next = this.peek("count").and_then(|v| v.as_f64()).unwrap_or(0.0) + 1.0;
//!         this.set("count", next.into())?;
//!         Ok(Value::Undefined)
//!     })
//!     .build();
//!
//! let entity = counter.create(Vec::new())?;
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use crate::construct::Arg;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::hash::{FastHashMap, FastIndexMap};
use crate::instruction::Instruction;
use crate::value::{Key, Value};

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

/// Root of every class hierarchy. Abstract.
static BASE: LazyLock<Class> = LazyLock::new(|| {
    Class(Arc::new(ClassInner {
        id: ClassId(0),
        name: "State".into(),
        parent: None,
        is_abstract: true,
        fields: FastIndexMap::default(),
        methods: FastHashMap::default(),
        setters: FastHashMap::default(),
    }))
});

/// Method implementation; receives the instance it is bound to.
pub type Method = Arc<dyn Fn(Entity, &[Value]) -> Result<Value> + Send + Sync>;

/// Explicit setter override used by [`Entity::assign`].
pub type Setter = Arc<dyn Fn(Entity, Value) -> Result<()> + Send + Sync>;

/// Produces a fresh per-instance initial value.
pub type Factory = Arc<dyn Fn() -> Result<Value> + Send + Sync>;

/// Declared field of a class.
#[derive(Clone)]
pub enum Field {
    /// Same initial value for every instance.
    Value(Value),
    /// Initial value built per instance at construction.
    Factory(Factory),
    /// Placeholder replaced on activation; see [`Instruction`].
    Instruction(Instruction),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ClassId(u64);

struct ClassInner {
    id: ClassId,
    name: Arc<str>,
    parent: Option<Class>,
    is_abstract: bool,
    fields: FastIndexMap<Key, Field>,
    methods: FastHashMap<Key, Method>,
    setters: FastHashMap<Key, Setter>,
}

/// Shared, immutable class descriptor. Cheap to clone.
#[derive(Clone)]
pub struct Class(Arc<ClassInner>);

impl Class {
    /// Start a class that extends the base class.
    pub fn builder(name: impl Into<Arc<str>>) -> ClassBuilder {
        ClassBuilder {
            name: name.into(),
            parent: Class::base(),
            is_abstract: false,
            fields: FastIndexMap::default(),
            methods: FastHashMap::default(),
            setters: FastHashMap::default(),
        }
    }

    /// The abstract root class `State`.
    pub fn base() -> Class {
        BASE.clone()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.0.name.clone()
    }

    pub(crate) fn id(&self) -> ClassId {
        self.0.id
    }

    pub fn parent(&self) -> Option<&Class> {
        self.0.parent.as_ref()
    }

    pub fn is_abstract(&self) -> bool {
        self.0.is_abstract
    }

    pub fn is_base(&self) -> bool {
        self.0.id == ClassId(0)
    }

    /// This class and its ancestors, nearest first, excluding the base class.
    pub fn lineage(&self) -> Vec<Class> {
        let mut lineage = Vec::new();
        let mut current = Some(self);
        while let Some(class) = current {
            if class.is_base() {
                break;
            }
            lineage.push(class.clone());
            current = class.parent();
        }
        lineage
    }

    /// Whether `self` is `other` or inherits from it.
    pub fn extends(&self, other: &Class) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class == other {
                return true;
            }
            current = class.parent();
        }
        false
    }

    /// Declared fields across the chain, ancestors first. A subclass
    /// redeclaring a field replaces the inherited declaration in place.
    pub fn fields(&self) -> Vec<(Key, Field)> {
        let mut merged: FastIndexMap<Key, Field> = FastIndexMap::default();
        for class in self.lineage().iter().rev() {
            for (key, field) in &class.0.fields {
                merged.insert(key.clone(), field.clone());
            }
        }
        merged.into_iter().collect()
    }

    /// Nearest method named `name` along the chain.
    pub fn find_method(&self, name: &Key) -> Option<Method> {
        self.lineage()
            .iter()
            .find_map(|class| class.0.methods.get(name).cloned())
    }

    /// Nearest explicit setter for `key` along the chain.
    pub fn find_setter(&self, key: &Key) -> Option<Setter> {
        self.lineage()
            .iter()
            .find_map(|class| class.0.setters.get(key).cloned())
    }

    /// Build an instance without activating it.
    ///
    /// Declared plain and factory fields are stored right away; instruction
    /// fields, child adoption and constructor arguments wait for
    /// [`Entity::activate`].
    pub fn construct(&self, args: Vec<Arg>) -> Result<Entity> {
        if self.is_abstract() {
            return Err(Error::Abstract {
                class: self.name_arc(),
            });
        }
        let entity = Entity::allocate(self.clone(), args);
        for (key, field) in self.fields() {
            let initial = match field {
                Field::Value(value) => value,
                Field::Factory(factory) => match factory() {
                    Ok(value) => value,
                    Err(error) => {
                        entity.release();
                        return Err(error);
                    }
                },
                Field::Instruction(_) => continue,
            };
            entity.store_raw(key, initial);
        }
        tracing::debug!(entity = %entity, "constructed");
        Ok(entity)
    }

    /// Construct and activate: the creation entry point.
    pub fn create(&self, args: Vec<Arg>) -> Result<Entity> {
        let entity = self.construct(args)?;
        entity.activate()?;
        Ok(entity)
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.0.name)
    }
}

/// Builder for [`Class`].
pub struct ClassBuilder {
    name: Arc<str>,
    parent: Class,
    is_abstract: bool,
    fields: FastIndexMap<Key, Field>,
    methods: FastHashMap<Key, Method>,
    setters: FastHashMap<Key, Setter>,
}

impl ClassBuilder {
    pub fn extends(mut self, parent: &Class) -> Self {
        self.parent = parent.clone();
        self
    }

    /// Plain field with a shared initial value.
    pub fn field(mut self, key: impl Into<Key>, initial: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), Field::Value(initial.into()));
        self
    }

    /// Field whose initial value is built per instance.
    pub fn factory<F>(mut self, key: impl Into<Key>, factory: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        self.fields
            .insert(key.into(), Field::Factory(Arc::new(factory)));
        self
    }

    /// Field holding a fresh instance of `class`, owned by the new entity.
    pub fn child(self, key: impl Into<Key>, class: &Class) -> Self {
        let class = class.clone();
        self.factory(key, move || class.construct(Vec::new()).map(Value::Entity))
    }

    /// Field defined by an instruction on activation.
    pub fn instruction(mut self, key: impl Into<Key>, instruction: Instruction) -> Self {
        self.fields
            .insert(key.into(), Field::Instruction(instruction));
        self
    }

    pub fn method<F>(mut self, name: impl Into<Key>, method: F) -> Self
    where
        F: Fn(Entity, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    /// Setter override consulted by [`Entity::assign`] for `key`.
    pub fn setter<F>(mut self, key: impl Into<Key>, setter: F) -> Self
    where
        F: Fn(Entity, Value) -> Result<()> + Send + Sync + 'static,
    {
        self.setters.insert(key.into(), Arc::new(setter));
        self
    }

    /// Mark the class abstract: it can be extended and used as a context key
    /// but not instantiated.
    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn build(self) -> Class {
        Class(Arc::new(ClassInner {
            id: ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed)),
            name: self.name,
            parent: Some(self.parent),
            is_abstract: self.is_abstract,
            fields: self.fields,
            methods: self.methods,
            setters: self.setters,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_stops_before_base() {
        let parent = Class::builder("Parent").build();
        let child = Class::builder("Child").extends(&parent).build();

        let names: Vec<_> = child
            .lineage()
            .iter()
            .map(|class| class.name().to_owned())
            .collect();
        assert_eq!(names, ["Child", "Parent"]);
        assert!(child.extends(&parent));
        assert!(child.extends(&Class::base()));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn subclass_fields_override_in_place() {
        let parent = Class::builder("Parent")
            .field("a", 1)
            .field("b", 2)
            .build();
        let child = Class::builder("Child")
            .extends(&parent)
            .field("a", 10)
            .field("c", 3)
            .build();

        let fields = child.fields();
        let keys: Vec<_> = fields.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert!(matches!(&fields[0].1, Field::Value(v) if v.as_f64() == Some(10.0)));
    }

    #[test]
    fn base_and_abstract_classes_cannot_be_built() {
        assert!(matches!(
            Class::base().construct(Vec::new()),
            Err(Error::Abstract { .. })
        ));
        let shape = Class::builder("Shape").abstract_class().build();
        assert!(matches!(
            shape.construct(Vec::new()),
            Err(Error::Abstract { .. })
        ));
    }

    #[test]
    fn methods_resolve_along_the_chain() {
        let parent = Class::builder("Parent")
            .method("hello", |_, _| Ok(Value::from("parent")))
            .build();
        let child = Class::builder("Child").extends(&parent).build();

        let method = child.find_method(&"hello".into()).unwrap();
        let entity = child.create(Vec::new()).unwrap();
        assert_eq!(method(entity, &[]).unwrap(), Value::from("parent"));
        assert!(child.find_method(&"missing".into()).is_none());
    }
}
