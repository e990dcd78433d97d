//! Reactive, class-based state containers.
//!
//! An [`Entity`] is an instance of a runtime [`Class`]: a property store with
//! listeners, a lifecycle and an owner. Writes are observable two ways: right
//! away as a per-key [`Signal::Key`], and once per tick as a coalesced
//! [`Signal::Flushed`] batch. Entities nest into trees and register into
//! hierarchical [`Context`] scopes, where other entities can find them by
//! class.
//!
//! # Quick Start
//!
//! ```ignore
//! use statebox::{Arg, Class, Context, Value, run_until_idle};
//!
//! let counter = Class::builder("Counter")
//!     .field("count", 0)
//!     .build();
//!
//! let entity = counter.create(vec![Arg::label("main")])?;
//!
//! // Re-runs when `count` changes; reads are tracked automatically.
//! entity.effect(|this| {
//!     let count = statebox::ready!(this.get("count"));
//!     println!("count is {count}");
//!     statebox::Access::Ready(None)
//! });
//!
//! entity.set("count", Value::from(1))?;
//! entity.set("count", Value::from(2))?;
//! run_until_idle()?; // one flush, one effect re-run
//! ```
//!
//! # Core Types
//!
//! - [`Class`] - Shared descriptor: fields, methods, setters, inheritance.
//! - [`Entity`] - Copy handle to one live instance.
//! - [`Signal`] - What listeners receive: ready, per-key, flushed batch, terminal.
//! - [`Access`] - Result of a read: ready, [`Pending`], or failed.
//! - [`Context`] - Scope that registers entities by class.
//!
//! # Lifecycle
//!
//! ```ignore
//! let entity = class.construct(args)?; // Constructing: writes are quiet
//! entity.activate()?;                  // Active: emits Ready once
//! entity.destroy()?;                   // Destroyed: children first, then Terminal
//! ```
//!
//! # Context
//!
//! ```ignore
//! let root = Context::new();
//! root.set_all([("settings", Value::from(&settings_class))])?;
//!
//! let scope = root.push();
//! let settings = scope.get(&settings_class)?; // falls through to root
//!
//! root.expect(&session_class, |session| {
//!     println!("session {session} is ready");
//!     None
//! });
//!
//! scope.pop(); // destroys what the scope created
//! ```
//!
//! # Processing Ticks
//!
//! Each thread runs its own event loop. Flushes, deferred callbacks and local
//! tasks wait until the loop is driven:
//!
//! ```ignore
//! tick();                  // one flush round
//! run_until_idle()?;       // until nothing is left
//! is_tick_scheduled();     // whether work is queued
//! untracked(|| { ... });   // read without subscribing the current effect
//! ```

// Internal modules
mod arena;
mod hash;

pub mod class;
pub mod construct;
pub mod context;
pub mod dispatch;
pub mod effect;
pub mod entity;
pub mod error;
pub mod instruction;
pub mod pending;
pub mod scheduler;
pub mod signal;
pub mod value;

// Core types
pub use arena::Status;
pub use class::{Class, ClassBuilder, Factory, Field, Method, Setter};
pub use construct::Arg;
pub use context::{Collection, Context, Dispose, Expectation};
pub use entity::{Entity, Guard, Verdict, unbind};
pub use error::{Error, Result};
pub use instruction::{AccessorSpec, Descriptor, Instruction, Store};
pub use pending::{Access, Pending};
pub use signal::{Reply, Signal};
pub use value::{Callable, Key, Reference, Snapshot, Value};

// Key functions
pub use dispatch::{Subscription, add_key_listener, add_listener, emit, schedule_key_change};
pub use effect::{Cleanup, EffectHandle, Teardown, tracked_effect, untracked};

// Event loop integration
pub use scheduler::{
    DEFAULT_MAX_TICKS, Scheduler, defer, is_tick_scheduled, run_until_idle, spawn_local, tick,
};
