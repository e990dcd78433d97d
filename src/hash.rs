//! Zero-sized hash builder and the map/set aliases built on it.
//!
//! Every internal table (entity stores, listener filters, context bindings)
//! is keyed by values we create ourselves, so HashDoS resistance is not a
//! concern and a fixed-seed foldhash keeps the tables small and fast.

use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};
use indexmap::{IndexMap, IndexSet};

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
///
/// # Properties
/// - Zero-sized (`size_of::<FastHashBuilder>()` == 0)
/// - Deterministic (same input = same hash across all instances)
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x2d35_8dcc_aa6c_78a5).build_hasher()
    }
}

/// `HashMap` with the fixed-seed hasher.
pub type FastHashMap<K, V> = HashMap<K, V, FastHashBuilder>;

/// `HashSet` with the fixed-seed hasher.
pub type FastHashSet<T> = HashSet<T, FastHashBuilder>;

/// Insertion-ordered map with the fixed-seed hasher.
pub type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

/// Insertion-ordered set with the fixed-seed hasher.
pub type FastIndexSet<T> = IndexSet<T, FastHashBuilder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_hash_builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
    }

    #[test]
    fn index_map_keeps_insertion_order() {
        let mut map = FastIndexMap::default();
        map.insert("c", 3);
        map.insert("a", 1);
        map.insert("b", 2);

        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, ["c", "a", "b"]);
    }
}
