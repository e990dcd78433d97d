use std::fmt;
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::Result;
use crate::hash::FastHashSet;
use crate::value::Key;

/// Event delivered to entity listeners.
#[derive(Clone, PartialEq)]
pub enum Signal {
    /// The entity became active. Delivered exactly once.
    Ready,
    /// A merge is about to write these keys. Delivered before any of them
    /// is written.
    Assigning(Arc<[Key]>),
    /// A single property (or custom event key) changed.
    Key(Key),
    /// A batch of changes completed; carries every key written since the
    /// previous flush, in first-write order.
    Flushed(Arc<[Key]>),
    /// The entity was destroyed. Delivered exactly once, last.
    Terminal,
}

impl Signal {
    /// Whether a listener with the given key filter should see this signal.
    ///
    /// Unfiltered listeners see everything. Filtered listeners see matching
    /// keys, merges and batches that touch a matching key, and always the
    /// terminal signal.
    pub(crate) fn passes(&self, filter: Option<&FastHashSet<Key>>) -> bool {
        let Some(filter) = filter else {
            return true;
        };
        match self {
            Signal::Ready => false,
            Signal::Terminal => true,
            Signal::Key(key) => filter.contains(key),
            Signal::Assigning(keys) | Signal::Flushed(keys) => {
                keys.iter().any(|key| filter.contains(key))
            }
        }
    }

    pub fn key(&self) -> Option<&Key> {
        match self {
            Signal::Key(key) => Some(key),
            _ => None,
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Ready => f.write_str("Ready"),
            Signal::Assigning(keys) => f.debug_tuple("Assigning").field(keys).finish(),
            Signal::Key(key) => write!(f, "Key({key})"),
            Signal::Flushed(keys) => f.debug_tuple("Flushed").field(keys).finish(),
            Signal::Terminal => f.write_str("Terminal"),
        }
    }
}

/// Callback queued to run after the next flush.
pub type Deferred = Box<dyn FnOnce() + Send>;

/// What a listener wants done after it handled a signal.
pub enum Reply {
    Keep,
    /// Unsubscribe this listener.
    Remove,
    /// Stay subscribed and run the callback after the next flush.
    Defer(Deferred),
}

/// Listener registered against an entity.
pub type Listener = Arc<dyn Fn(&Signal, Entity) -> Result<Reply> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(keys: &[&str]) -> FastHashSet<Key> {
        keys.iter().map(|key| Key::from(*key)).collect()
    }

    #[test]
    fn unfiltered_passes_everything() {
        assert!(Signal::Ready.passes(None));
        assert!(Signal::Terminal.passes(None));
        assert!(Signal::Key("a".into()).passes(None));
    }

    #[test]
    fn filtered_sees_matching_keys_and_terminal() {
        let keys = filter(&["foo"]);

        assert!(Signal::Key("foo".into()).passes(Some(&keys)));
        assert!(!Signal::Key("bar".into()).passes(Some(&keys)));
        assert!(!Signal::Ready.passes(Some(&keys)));
        assert!(Signal::Terminal.passes(Some(&keys)));

        let batch: Arc<[Key]> = vec![Key::from("bar"), Key::from("foo")].into();
        assert!(Signal::Flushed(batch).passes(Some(&keys)));
    }
}
