//! Instruction protocol: fields defined on activation.
//!
//! A field declared with [`ClassBuilder::instruction`](crate::ClassBuilder::instruction)
//! is not stored at construction. When the entity activates, the instruction
//! is invoked with `(key, entity, store)` and its answer decides what the
//! field becomes:
//!
//! - `None`: the field stays inert.
//! - [`Descriptor::Getter`]: a read-only computed field.
//! - [`Descriptor::Accessor`]: a custom accessor pair, optionally with an
//!   initial stored value.
//!
//! Accessors are built on [`Entity::access`] and [`Entity::update`], so
//! tracking, deferred values and write guards all keep working.

use std::fmt;
use std::sync::Arc;

use crate::class::Class;
use crate::context::Context;
use crate::entity::{Entity, Guard};
use crate::error::{Error, Result};
use crate::pending::Access;
use crate::value::{Key, Reference, Value};

/// Read half of a custom accessor.
pub type Getter = Arc<dyn Fn(Entity) -> Access + Send + Sync>;

/// Write half of a custom accessor.
pub type AccessorSetter = Arc<dyn Fn(Entity, Value) -> Result<()> + Send + Sync>;

/// Accessor description returned by an instruction.
pub struct AccessorSpec {
    pub get: Option<Getter>,
    pub set: Option<AccessorSetter>,
    /// Initial stored value.
    pub value: Option<Value>,
    /// Whether [`Entity::export`] includes the field.
    pub enumerable: bool,
}

impl Default for AccessorSpec {
    fn default() -> Self {
        Self {
            get: None,
            set: None,
            value: None,
            enumerable: true,
        }
    }
}

pub enum Descriptor {
    Getter(Getter),
    Accessor(AccessorSpec),
}

/// Installed accessor.
#[derive(Clone)]
pub(crate) struct Accessor {
    pub(crate) get: Option<Getter>,
    pub(crate) set: Option<AccessorSetter>,
    pub(crate) enumerable: bool,
}

/// Raw view of an entity's store handed to instructions.
pub struct Store {
    entity: Entity,
}

impl Store {
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.entity.peek(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// Store without signals.
    pub fn insert(&self, key: Key, value: Value) {
        self.entity.store_raw(key, value);
    }
}

type InstructionFn = dyn Fn(&Key, Entity, &Store) -> Result<Option<Descriptor>> + Send + Sync;

/// Deferred field initializer.
#[derive(Clone)]
pub struct Instruction(Arc<InstructionFn>);

impl Instruction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Key, Entity, &Store) -> Result<Option<Descriptor>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Instruction(..)")
    }
}

pub(crate) fn apply(entity: Entity, key: &Key, instruction: &Instruction) -> Result<()> {
    let store = Store { entity };
    let Some(descriptor) = (instruction.0)(key, entity, &store)? else {
        cov_mark::hit!(inert_instruction);
        return Ok(());
    };
    let accessor = match descriptor {
        Descriptor::Getter(get) => Accessor {
            get: Some(get),
            set: None,
            enumerable: true,
        },
        Descriptor::Accessor(spec) => {
            if let Some(value) = spec.value {
                store.insert(key.clone(), value);
            }
            Accessor {
                get: spec.get,
                set: spec.set,
                enumerable: spec.enumerable,
            }
        }
    };
    entity.install_accessor(key.clone(), accessor)
}

/// Field that reads as a [`Pending`](crate::Pending) marker until first written.
pub fn required() -> Instruction {
    Instruction::new(|key, _, _| {
        let read = key.clone();
        let write = key.clone();
        Ok(Some(Descriptor::Accessor(AccessorSpec {
            get: Some(Arc::new(move |entity: Entity| entity.access(&read, true))),
            set: Some(Arc::new(move |entity: Entity, value: Value| {
                entity.update(&write, value)
            })),
            ..AccessorSpec::default()
        })))
    })
}

/// Plain field with an initial value.
pub fn value(initial: impl Into<Value>) -> Instruction {
    let initial = initial.into();
    Instruction::new(move |_, _, _| {
        Ok(Some(Descriptor::Accessor(AccessorSpec {
            value: Some(initial.clone()),
            ..AccessorSpec::default()
        })))
    })
}

/// Field whose writes pass through `guard`.
pub fn validated(initial: impl Into<Value>, guard: Guard) -> Instruction {
    let initial = initial.into();
    Instruction::new(move |key, _, _| {
        let key = key.clone();
        let guard = guard.clone();
        Ok(Some(Descriptor::Accessor(AccessorSpec {
            set: Some(Arc::new(move |entity: Entity, value: Value| {
                entity.update_with(&key, value, &guard)
            })),
            value: Some(initial.clone()),
            ..AccessorSpec::default()
        })))
    })
}

/// Read-only field re-evaluated on every read.
///
/// Reads made inside `f` are tracked, so effects that read the field depend
/// on whatever `f` reads.
pub fn computed<F>(f: F) -> Instruction
where
    F: Fn(Entity) -> Access + Send + Sync + 'static,
{
    let f: Getter = Arc::new(f);
    Instruction::new(move |_, _, _| Ok(Some(Descriptor::Getter(f.clone()))))
}

/// Field that resolves to the nearest `class` instance in the entity's context.
///
/// Required lookups fail with [`Error::NotFound`] when the entity has no
/// context or nothing matches; optional ones read as `Undefined`.
pub fn lookup(class: &Class, required: bool) -> Instruction {
    let class = class.clone();
    Instruction::new(move |_, _, _| {
        let class = class.clone();
        Ok(Some(Descriptor::Getter(Arc::new(move |entity: Entity| {
            let found = match Context::of(entity) {
                Some(context) => context.find(&class),
                None => Ok(None),
            };
            match found {
                Ok(Some(entity)) => Access::Ready(Value::Entity(entity)),
                Ok(None) if required => Access::Failed(Error::NotFound {
                    class: class.name_arc(),
                }),
                Ok(None) => Access::Ready(Value::Undefined),
                Err(error) => Access::Failed(error),
            }
        }))))
    })
}

/// Field holding a fresh [`Reference`]. Assigning to the field sets the
/// reference's content instead of replacing it, without a signal.
pub fn reference() -> Instruction {
    Instruction::new(|key, _, _| {
        let key = key.clone();
        Ok(Some(Descriptor::Accessor(AccessorSpec {
            set: Some(Arc::new(move |entity: Entity, value: Value| match entity.peek(&key) {
                Some(Value::Ref(cell)) => {
                    cell.set(value);
                    Ok(())
                }
                _ => entity.update(&key, value),
            })),
            value: Some(Value::Ref(Reference::default())),
            ..AccessorSpec::default()
        })))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Verdict;
    use crate::scheduler::run_until_idle;

    #[test]
    fn inert_instruction_leaves_field_unset() {
        cov_mark::check!(inert_instruction);
        let class = Class::builder("Inert")
            .instruction("nothing", Instruction::new(|_, _, _| Ok(None)))
            .build();
        let entity = class.create(Vec::new()).unwrap();

        assert_eq!(entity.peek("nothing"), None);
        entity.set("nothing", Value::from(1)).unwrap();
        assert_eq!(entity.peek("nothing"), Some(Value::from(1)));
    }

    #[test]
    fn getter_only_field_is_read_only() {
        let class = Class::builder("Doubler")
            .field("n", 2)
            .instruction(
                "double",
                computed(|this| {
                    let n = crate::ready!(this.get("n"));
                    Access::Ready(Value::Number(n.as_f64().unwrap_or(0.0) * 2.0))
                }),
            )
            .build();
        let entity = class.create(Vec::new()).unwrap();

        assert_eq!(entity.get("double").ready(), Some(Value::from(4)));
        entity.set("n", Value::from(5)).unwrap();
        assert_eq!(entity.get("double").ready(), Some(Value::from(10)));

        assert!(matches!(
            entity.set("double", Value::from(1)),
            Err(Error::ReadOnly { .. })
        ));
        assert_eq!(entity.export().unwrap()["double"], Value::from(10));
        run_until_idle().unwrap();
    }

    #[test]
    fn validated_field_routes_writes_through_the_guard() {
        let guard: Guard = Arc::new(|next: &Value, _: &Value| match next.as_str() {
            Some("") => Verdict::Reject,
            _ => Verdict::Accept,
        });
        let class = Class::builder("Named")
            .instruction("name", validated("anon", guard))
            .build();
        let entity = class.create(Vec::new()).unwrap();

        assert_eq!(entity.get("name").ready(), Some(Value::from("anon")));
        entity.set("name", Value::from("")).unwrap();
        assert_eq!(entity.peek("name"), Some(Value::from("anon")));
        entity.set("name", Value::from("bob")).unwrap();
        assert_eq!(entity.peek("name"), Some(Value::from("bob")));
    }

    #[test]
    fn reference_field_keeps_its_cell() {
        let class = Class::builder("Holder")
            .instruction("slot", reference())
            .build();
        let entity = class.create(Vec::new()).unwrap();

        let Some(Value::Ref(cell)) = entity.peek("slot") else {
            panic!("slot should hold a reference");
        };
        entity.set("slot", Value::from(3)).unwrap();

        assert_eq!(cell.get(), Value::from(3));
        assert!(!crate::scheduler::is_tick_scheduled());
        assert_eq!(entity.export().unwrap()["slot"], Value::from(3));
    }

    #[test]
    fn lookup_without_context_respects_required() {
        let target = Class::builder("Target").build();
        let class = Class::builder("Seeker")
            .instruction("strict", lookup(&target, true))
            .instruction("loose", lookup(&target, false))
            .build();
        let entity = class.create(Vec::new()).unwrap();

        assert!(matches!(
            entity.get("strict"),
            Access::Failed(Error::NotFound { .. })
        ));
        assert_eq!(entity.get("loose").ready(), Some(Value::Undefined));
    }
}
