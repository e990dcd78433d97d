//! Dynamic values held in entity stores.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::class::Class;
use crate::entity::Entity;
use crate::error::Result;
use crate::hash::FastIndexMap;

/// Name of a property or custom event.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<str>);

impl Key {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn as_arc(&self) -> Arc<str> {
        self.0.clone()
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key(value.into())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key(value.into())
    }
}

impl From<&String> for Key {
    fn from(value: &String) -> Self {
        Key(value.as_str().into())
    }
}

impl From<&Key> for Key {
    fn from(value: &Key) -> Self {
        value.clone()
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Key(value.to_string().into())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Frozen, insertion-ordered mapping produced by [`Entity::export`].
pub type Snapshot = Arc<FastIndexMap<Key, Value>>;

/// A value stored in an entity property.
///
/// Equality follows strict-equality rules: scalars compare by value, text by
/// content, and everything else (lists, maps, callables, references) by
/// identity.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Text(Arc<str>),
    List(Arc<[Value]>),
    Map(Snapshot),
    Entity(Entity),
    Class(Class),
    Func(Callable),
    Ref(Reference),
}

impl Value {
    /// Strict (`===`) equality.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Entity(a), Value::Entity(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_entity(&self) -> Option<Entity> {
        match self {
            Value::Entity(entity) => Some(*entity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Snapshot> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short type description used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Entity(_) => "entity",
            Value::Class(_) => "class",
            Value::Func(_) => "function",
            Value::Ref(_) => "reference",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(text) => write!(f, "{:?}", &**text),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Map(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Entity(entity) => write!(f, "{entity:?}"),
            Value::Class(class) => write!(f, "class {}", class.name()),
            Value::Func(callable) => write!(f, "fn#{}", callable.id),
            Value::Ref(reference) => write!(f, "ref({:?})", reference.get()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => f.write_str(text),
            Value::Entity(entity) => write!(f, "{entity}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value.into())
    }
}

impl From<Entity> for Value {
    fn from(value: Entity) -> Self {
        Value::Entity(value)
    }
}

impl From<Class> for Value {
    fn from(value: Class) -> Self {
        Value::Class(value)
    }
}

impl From<&Class> for Value {
    fn from(value: &Class) -> Self {
        Value::Class(value.clone())
    }
}

impl From<Callable> for Value {
    fn from(value: Callable) -> Self {
        Value::Func(value)
    }
}

impl From<Reference> for Value {
    fn from(value: Reference) -> Self {
        Value::Ref(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value.into())
    }
}

static NEXT_CALLABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Function value. Identity is the allocation id, not the code.
#[derive(Clone)]
pub struct Callable {
    id: u64,
    f: Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>,
}

impl Callable {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            id: NEXT_CALLABLE_ID.fetch_add(1, Ordering::Relaxed),
            f: Arc::new(f),
        }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.f)(args)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable#{}", self.id)
    }
}

/// Shared mutable cell exposing `get()`/`set()`.
///
/// Flattened to its current content by [`Entity::export`].
#[derive(Clone, Default)]
pub struct Reference(Arc<Mutex<Value>>);

impl Reference {
    pub fn new(initial: Value) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> Value {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.lock() = value;
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({:?})", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_compare_by_identity() {
        let list: Value = vec![Value::from(1), Value::from(2)].into();
        let other: Value = vec![Value::from(1), Value::from(2)].into();

        assert!(list.same(&list.clone()));
        assert!(!list.same(&other));
    }

    #[test]
    fn scalars_compare_by_value() {
        assert!(Value::from("a").same(&Value::from(String::from("a"))));
        assert!(Value::from(1).same(&Value::Number(1.0)));
        assert!(!Value::Number(f64::NAN).same(&Value::Number(f64::NAN)));
        assert!(!Value::Null.same(&Value::Undefined));
    }

    #[test]
    fn key_borrows_as_str() {
        let mut map = FastIndexMap::default();
        map.insert(Key::from("a"), 1);
        assert_eq!(map.get("a"), Some(&1));
    }
}
