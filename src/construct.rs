//! Constructor arguments, processed on activation.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::dispatch;
use crate::entity::Entity;
use crate::error::Result;
use crate::scheduler;
use crate::signal::{Reply, Signal};
use crate::value::{Key, Value};

/// Closure run with the entity during activation; may yield another argument.
pub type InitFn = Box<dyn FnOnce(Entity) -> Result<Option<Arg>> + Send>;

/// One constructor argument. Arguments are handled left to right when the
/// entity activates.
pub enum Arg {
    /// Replace the display id.
    Label(String),
    /// Merge values without per-key signals; the keys still join the next
    /// flush.
    Values(Vec<(Key, Value)>),
    /// Run with the entity; a returned argument is processed next.
    Init(InitFn),
    /// Spliced in place.
    List(Vec<Arg>),
    /// Run once when the entity is destroyed.
    Cleanup(Box<dyn FnOnce() + Send>),
    /// Spawned on the thread's local pool. Failures are logged, never returned.
    Task(BoxFuture<'static, Result<()>>),
}

impl Arg {
    pub fn label(label: impl Into<String>) -> Self {
        Arg::Label(label.into())
    }

    pub fn values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Key>,
    {
        Arg::Values(
            values
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    pub fn init<F>(f: F) -> Self
    where
        F: FnOnce(Entity) -> Result<Option<Arg>> + Send + 'static,
    {
        Arg::Init(Box::new(f))
    }

    pub fn cleanup<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Arg::Cleanup(Box::new(f))
    }

    pub fn task<F>(future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Arg::Task(future.boxed())
    }
}

impl From<&str> for Arg {
    fn from(label: &str) -> Self {
        Arg::Label(label.to_owned())
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Label(label) => f.debug_tuple("Label").field(label).finish(),
            Arg::Values(values) => f.debug_tuple("Values").field(values).finish(),
            Arg::Init(_) => f.write_str("Init(..)"),
            Arg::List(items) => f.debug_tuple("List").field(items).finish(),
            Arg::Cleanup(_) => f.write_str("Cleanup(..)"),
            Arg::Task(_) => f.write_str("Task(..)"),
        }
    }
}

pub(crate) fn process_args(entity: Entity, args: Vec<Arg>) -> Result<()> {
    let mut queue: VecDeque<Arg> = args.into();
    while let Some(arg) = queue.pop_front() {
        tracing::trace!(entity = %entity, ?arg, "constructor argument");
        match arg {
            Arg::Label(label) => {
                entity
                    .id()
                    .with_state(|state| state.label = label.into());
            }
            Arg::Values(values) => entity.assign(values, true)?,
            Arg::Init(init) => {
                if let Some(next) = init(entity)? {
                    queue.push_front(next);
                }
            }
            Arg::List(items) => {
                for item in items.into_iter().rev() {
                    queue.push_front(item);
                }
            }
            Arg::Cleanup(cleanup) => {
                let cleanup = Mutex::new(Some(cleanup));
                dispatch::add_key_listener(entity, Vec::<Key>::new(), move |signal, _| {
                    if *signal == Signal::Terminal {
                        if let Some(cleanup) = cleanup.lock().take() {
                            cleanup();
                        }
                    }
                    Ok(Reply::Keep)
                });
            }
            Arg::Task(task) => scheduler::spawn_local(async move {
                if let Err(error) = task.await {
                    tracing::error!(entity = %entity, %error, "construction task failed");
                }
            }),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use crate::entity::{Guard, Verdict};
    use crate::error::Error;
    use crate::instruction::{computed, reference, validated};
    use crate::scheduler::run_until_idle;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn record() -> Class {
        Class::builder("Record").field("a", 0).field("b", 0).build()
    }

    #[test]
    fn arguments_apply_left_to_right() {
        let entity = record()
            .create(vec![
                Arg::label("first"),
                Arg::values([("a", Value::from(1))]),
                Arg::List(vec![Arg::values([("a", Value::from(2))]), "second".into()]),
            ])
            .unwrap();

        assert_eq!(&*entity.label(), "second");
        assert_eq!(entity.peek("a"), Some(Value::from(2)));
    }

    #[test]
    fn init_result_is_processed_next() {
        let entity = record()
            .create(vec![
                Arg::init(|this| {
                    assert!(this.is_active());
                    Ok(Some(Arg::values([("b", Value::from(7))])))
                }),
                Arg::values([("b", Value::from(8))]),
            ])
            .unwrap();

        assert_eq!(entity.peek("b"), Some(Value::from(8)));
    }

    #[test]
    fn merged_values_reach_the_next_flush_without_key_signals() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let entity = record()
            .create(vec![
                Arg::init(move |this| {
                    this.listen(move |signal, _| {
                        s.lock().push(signal.clone());
                        Ok(Reply::Keep)
                    });
                    Ok(None)
                }),
                Arg::values([("a", Value::from(1)), ("b", Value::from(2))]),
            ])
            .unwrap();
        run_until_idle().unwrap();

        let batch: std::sync::Arc<[Key]> = vec![Key::from("a"), Key::from("b")].into();
        assert_eq!(*seen.lock(), [Signal::Ready, Signal::Flushed(batch)]);
        entity.destroy().unwrap();
    }

    #[test]
    fn merged_values_go_through_field_accessors() {
        let guard: Guard = Arc::new(|next: &Value, _: &Value| match next.as_str() {
            Some("") => Verdict::Reject,
            _ => Verdict::Accept,
        });
        let class = Class::builder("Named")
            .instruction("name", validated("anon", guard))
            .instruction("slot", reference())
            .instruction("shout", computed(|_| crate::Access::Ready(Value::from("HI"))))
            .build();

        let entity = class
            .create(vec![Arg::values([
                ("name", Value::from("")),
                ("slot", Value::from(3)),
            ])])
            .unwrap();

        assert_eq!(entity.peek("name"), Some(Value::from("anon")));
        let Some(Value::Ref(cell)) = entity.peek("slot") else {
            panic!("slot should still hold its reference");
        };
        assert_eq!(cell.get(), Value::from(3));

        let read_only = class.create(vec![Arg::values([("shout", Value::from("hi"))])]);
        assert!(matches!(read_only, Err(Error::ReadOnly { .. })));
    }

    #[test]
    fn cleanup_runs_on_destroy_only() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c = cleaned.clone();
        let entity = record()
            .create(vec![Arg::cleanup(move || {
                c.fetch_add(1, Ordering::Relaxed);
            })])
            .unwrap();

        entity.set("a", Value::from(1)).unwrap();
        run_until_idle().unwrap();
        assert_eq!(cleaned.load(Ordering::Relaxed), 0);

        entity.destroy().unwrap();
        assert_eq!(cleaned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failing_task_does_not_fail_construction() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let entity = record()
            .create(vec![Arg::task(async move {
                r.store(true, Ordering::Relaxed);
                Err(Error::failed("network down"))
            })])
            .unwrap();

        assert!(entity.is_active());
        run_until_idle().unwrap();
        assert!(ran.load(Ordering::Relaxed));
    }
}
