//! Upsert Bridge - Rust closures as native key-value upsert hooks
//!
//! Native key-value engines let a caller customise how a write merges with
//! the value already stored, but only through a plain C function pointer and
//! one opaque `void *`. This crate turns a Rust closure into that pair.
//!
//! # Features
//!
//! - **Handle registry**: closures live in a process-wide table; the engine
//!   only ever carries a small non-reused handle
//! - **Argument boxing**: text and integer arguments are copied to stable heap
//!   cells once, at registration time
//! - **Bounded marshaling**: raw `char **` / `uint32_t *` arrays are bound to
//!   the batch count before the closure sees them
//! - **Panic containment**: nothing unwinds across the C boundary
//!
//! # Example
//!
//! ```rust
//! use upsert_bridge::engine::{EngineBatch, MemoryEngine};
//! use upsert_bridge::ffi::{BridgeResult, UpsertBatch};
//! use upsert_bridge::upsert::{bind, UpsertRegistration};
//!
//! // Last write wins
//! let registration = UpsertRegistration::new(|batch: &mut UpsertBatch<'_>| -> BridgeResult<()> {
//!     for i in 0..batch.count() {
//!         let incoming = batch.upsert.get(i).and_then(|r| r.bytes()).unwrap_or(&[]).to_vec();
//!         batch.result.write(i, &incoming)?;
//!     }
//!     Ok(())
//! });
//!
//! let mut engine = MemoryEngine::new("db");
//! let keys = engine.slot_keys("users");
//! bind(&mut engine, &keys, &registration).unwrap();
//!
//! let batch = EngineBatch::merge(vec![b"old".to_vec()], vec![b"new".to_vec()]);
//! let outcome = engine.upsert("users", &batch).unwrap();
//! assert_eq!(outcome.status, 0);
//! assert_eq!(outcome.results[0].as_deref(), Some(&b"new"[..]));
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   register    ┌──────────────────┐
//! │    Glue code     │ ────────────► │ CallbackRegistry │
//! └────────┬─────────┘               │  ArgumentBoxes   │
//!          │ bind                    └────────▲─────────┘
//!          ▼                                  │ lookup
//! ┌──────────────────┐   callback    ┌────────┴─────────┐
//! │  Native engine   │ ────────────► │ upsert_trampoline│
//! └──────────────────┘               └──────────────────┘
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod ffi;
pub mod upsert;

// Re-export commonly used types
pub use config::{BridgeConfig, ConfigError, ConfigResult};
pub use engine::{EngineBatch, EngineError, EngineOutcome, MemoryEngine};
pub use ffi::{
    upsert_trampoline, BridgeError, BridgeResult, Handle, SizeLayout, UpsertBatch, UpsertOptions,
    STATUS_FAILED, STATUS_OK,
};
pub use upsert::{bind, register, register_argument, unregister, EngineConfig, SlotKeys, UpsertRegistration};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
