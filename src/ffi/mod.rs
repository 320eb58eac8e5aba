//! FFI Bridge for Native Upsert Hooks
//!
//! Lets a C-ABI key-value engine call a Rust closure while it merges writes.
//! The engine only understands one fixed function pointer plus one opaque
//! `void *`, so the closure stays in a Rust-owned registry and the engine is
//! given a small handle instead.
//!
//! # Architecture
//!
//! ```text
//! register(closure)            ──► CallbackRegistry  (handle -> closure)
//! box_value(handle, arg)       ──► ArgumentBoxes     (handle -> stable arg)
//!
//! engine write path
//!       │
//!       ▼
//! upsert_trampoline(count, src, src_size, upsert, upsert_size,
//!                   result, result_size, arg = handle)
//!       │   lookup closure + boxed arg
//!       │   bind raw arrays to `count` (BufferArray / ResultArray)
//!       ▼
//! closure(&mut UpsertBatch) ──► status code (0 = ok, non-zero = failure)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let handle = callbacks().register(|batch: &mut UpsertBatch<'_>| {
//!     for i in 0..batch.count() {
//!         let incoming = batch.upsert.get(i).and_then(|r| r.bytes()).unwrap_or(&[]);
//!         batch.result.write(i, incoming)?;
//!     }
//!     Ok::<(), BridgeError>(())
//! });
//! engine.set_pointer("db.test.upsert", upsert_trampoline as *mut c_void);
//! engine.set_pointer("db.test.upsert_arg", handle.as_context());
//! ```

mod args;
mod error;
mod marshal;
mod registry;
mod trampoline;
mod types;

pub use args::{arguments, ArgAddress, ArgKind, ArgValue, ArgumentBoxes, BoxOutcome, BoxedArg};
pub use error::{BridgeError, BridgeResult};
pub use marshal::{BufferArray, RawBuffer, ResultArray, UpsertBatch};
pub use registry::{callbacks, CallbackRegistry, Handle, RegisteredUpsert, UpsertFn};
pub use trampoline::{dispatch, trampoline, upsert_trampoline, RawInvocation};
pub use types::{
    IntoStatus, SizeLayout, UpsertCallback, UpsertOptions, STATUS_FAILED, STATUS_OK,
};
