//! Handle Registry
//!
//! Process-wide table from opaque handles to registered upsert closures.
//! The engine only ever sees the handle, smuggled through its `void *arg`
//! slot; the closure itself never leaves Rust.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroU64;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::marshal::UpsertBatch;
use super::types::{IntoStatus, UpsertOptions};

// =============================================================================
// Handles
// =============================================================================

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one registration.
///
/// Handles are issued from a process-wide counter and never reused, so two
/// handles compare equal only if they came from the same `register` call.
/// Zero is never issued; it is what a null context pointer decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    fn next() -> Self {
        let raw = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and a u64 does not wrap in practice.
        Handle(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Rebuild a handle from its numeric value
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Handle)
    }

    /// Decode the context pointer the engine passes back verbatim
    pub fn from_context(ctx: *mut c_void) -> Option<Self> {
        Self::from_raw(ctx as usize as u64)
    }

    /// Numeric value of the handle
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    /// Encode the handle as the engine's opaque context pointer
    pub fn as_context(&self) -> *mut c_void {
        self.0.get() as usize as *mut c_void
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// Registered callbacks
// =============================================================================

/// Type-erased upsert closure as stored in the registry
pub type UpsertFn = dyn Fn(&mut UpsertBatch<'_>) -> c_int + Send + Sync;

/// A closure together with how its batches are laid out
pub struct RegisteredUpsert {
    callback: Box<UpsertFn>,
    options: UpsertOptions,
}

impl RegisteredUpsert {
    fn new<F, R>(f: F, options: UpsertOptions) -> Self
    where
        F: Fn(&mut UpsertBatch<'_>) -> R + Send + Sync + 'static,
        R: IntoStatus,
    {
        Self {
            callback: Box::new(move |batch: &mut UpsertBatch<'_>| f(batch).into_status()),
            options,
        }
    }

    /// Size layouts the batch arrays are read with
    pub fn options(&self) -> UpsertOptions {
        self.options
    }

    /// Run the closure over one batch
    pub fn invoke(&self, batch: &mut UpsertBatch<'_>) -> c_int {
        (self.callback)(batch)
    }
}

impl fmt::Debug for RegisteredUpsert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredUpsert")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Concurrent map from handles to registered closures.
///
/// Lookups share a read lock; register and unregister take the write lock
/// only for the map update. Entries are reference counted so a dispatch that
/// already resolved its closure keeps it alive across a concurrent
/// `unregister`.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    entries: RwLock<HashMap<Handle, Arc<RegisteredUpsert>>>,
}

impl CallbackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a closure under a freshly issued handle
    pub fn register<F, R>(&self, f: F) -> Handle
    where
        F: Fn(&mut UpsertBatch<'_>) -> R + Send + Sync + 'static,
        R: IntoStatus,
    {
        self.register_with(f, UpsertOptions::default())
    }

    /// Store a closure with explicit size layouts
    pub fn register_with<F, R>(&self, f: F, options: UpsertOptions) -> Handle
    where
        F: Fn(&mut UpsertBatch<'_>) -> R + Send + Sync + 'static,
        R: IntoStatus,
    {
        let handle = Handle::next();
        let entry = Arc::new(RegisteredUpsert::new(f, options));
        self.entries.write().insert(handle, entry);
        tracing::debug!(%handle, ?options, "registered upsert callback");
        handle
    }

    /// Resolve a handle to its closure
    pub fn lookup(&self, handle: Handle) -> Option<Arc<RegisteredUpsert>> {
        self.entries.read().get(&handle).cloned()
    }

    /// Remove a registration. Unknown handles are ignored.
    pub fn unregister(&self, handle: Handle) {
        if self.entries.write().remove(&handle).is_some() {
            tracing::debug!(%handle, "unregistered upsert callback");
        }
    }

    /// Check if a handle is registered
    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.read().contains_key(&handle)
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

lazy_static::lazy_static! {
    /// Registry consulted by the trampoline
    static ref CALLBACKS: CallbackRegistry = CallbackRegistry::new();
}

/// The process-wide callback registry
pub fn callbacks() -> &'static CallbackRegistry {
    &CALLBACKS
}
