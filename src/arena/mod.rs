// Arena-based storage for entity records
//
// A single global slab holds one EntityRecord per entity: its class, status,
// property store, listeners, pending batch and parent/child links. Entity
// handles are Copy generational ids that index into the slab.

pub mod entity_arena;

pub use entity_arena::{
    EntityId, ListenerEntry, Status, entity_arena_insert, entity_arena_remove,
};
