//! Upsert Lifecycle
//!
//! Glue-facing entry points: register a closure, optionally box an argument
//! for it, publish both under the engine's configuration keys, and tear the
//! registration down again.

use std::any::Any;
use std::ffi::c_void;
use std::fmt;

use crate::config::BridgeConfig;
use crate::ffi::{
    arguments, callbacks, trampoline, BoxOutcome, BridgeResult, Handle, IntoStatus, UpsertBatch,
    UpsertCallback, UpsertOptions,
};

/// Register a closure with the process-wide registry
pub fn register<F, R>(f: F) -> Handle
where
    F: Fn(&mut UpsertBatch<'_>) -> R + Send + Sync + 'static,
    R: IntoStatus,
{
    callbacks().register(f)
}

/// Box an argument for a registered handle using the legacy lenient policy
pub fn register_argument<T: Any>(handle: Handle, value: Option<&T>) -> BridgeResult<BoxOutcome> {
    arguments().box_value(handle, value, false)
}

/// Drop a registration and its boxed argument. Unknown handles are ignored.
pub fn unregister(handle: Handle) {
    // Closure first; dispatch reads the box before the closure.
    callbacks().unregister(handle);
    arguments().remove(handle);
}

/// Configuration key names for one store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotKeys {
    upsert: String,
    upsert_arg: String,
}

impl SlotKeys {
    pub fn new(scope: &str, name: &str) -> Self {
        Self {
            upsert: format!("{}.{}.upsert", scope, name),
            upsert_arg: format!("{}.{}.upsert_arg", scope, name),
        }
    }

    /// `<scope>.<name>.upsert`
    pub fn upsert(&self) -> &str {
        &self.upsert
    }

    /// `<scope>.<name>.upsert_arg`
    pub fn upsert_arg(&self) -> &str {
        &self.upsert_arg
    }
}

/// The engine's configuration mechanism, as far as the bridge needs it
pub trait EngineConfig {
    type Error;

    /// Store a pointer-valued setting
    fn set_pointer(&mut self, key: &str, value: *mut c_void) -> Result<(), Self::Error>;
}

/// A live registration. Dropping it unregisters the closure and releases the
/// boxed argument.
pub struct UpsertRegistration {
    handle: Handle,
    active: bool,
}

impl UpsertRegistration {
    /// Register with default layouts and no argument
    pub fn new<F, R>(f: F) -> Self
    where
        F: Fn(&mut UpsertBatch<'_>) -> R + Send + Sync + 'static,
        R: IntoStatus,
    {
        Self::with_options(f, UpsertOptions::default())
    }

    /// Register with explicit layouts and no argument
    pub fn with_options<F, R>(f: F, options: UpsertOptions) -> Self
    where
        F: Fn(&mut UpsertBatch<'_>) -> R + Send + Sync + 'static,
        R: IntoStatus,
    {
        Self {
            handle: callbacks().register_with(f, options),
            active: true,
        }
    }

    /// Register following `config`, boxing `arg` under its argument policy
    pub fn from_config<F, R, T>(config: &BridgeConfig, f: F, arg: Option<&T>) -> BridgeResult<Self>
    where
        F: Fn(&mut UpsertBatch<'_>) -> R + Send + Sync + 'static,
        R: IntoStatus,
        T: Any,
    {
        let registration = Self::with_options(f, config.upsert_options());
        // On a strict rejection `registration` drops here and unregisters.
        let _ = arguments().box_value(registration.handle, arg, config.arguments.strict)?;
        Ok(registration)
    }

    /// Box an argument for this registration under the lenient policy
    pub fn argument<T: Any>(&self, value: &T) -> BridgeResult<BoxOutcome> {
        arguments().box_value(self.handle, Some(value), false)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Function pointer to publish under the `upsert` key
    pub fn callback(&self) -> UpsertCallback {
        trampoline()
    }

    /// Context pointer to publish under the `upsert_arg` key
    pub fn context(&self) -> *mut c_void {
        self.handle.as_context()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Unregister now. Later calls, and the eventual drop, do nothing.
    pub fn unregister(&mut self) {
        if self.active {
            unregister(self.handle);
            self.active = false;
        }
    }
}

impl Drop for UpsertRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl fmt::Debug for UpsertRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpsertRegistration")
            .field("handle", &self.handle)
            .field("active", &self.active)
            .finish()
    }
}

/// Publish a registration under the engine's upsert keys
pub fn bind<E: EngineConfig>(
    engine: &mut E,
    keys: &SlotKeys,
    registration: &UpsertRegistration,
) -> Result<(), E::Error> {
    engine.set_pointer(keys.upsert(), registration.callback() as *mut c_void)?;
    engine.set_pointer(keys.upsert_arg(), registration.context())?;
    tracing::debug!(
        handle = %registration.handle(),
        key = keys.upsert(),
        "bound upsert callback"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::ffi::{ArgKind, BridgeError, STATUS_OK};

    #[derive(Default)]
    struct RecordingConfig {
        values: HashMap<String, usize>,
    }

    impl EngineConfig for RecordingConfig {
        type Error = std::convert::Infallible;

        fn set_pointer(&mut self, key: &str, value: *mut c_void) -> Result<(), Self::Error> {
            self.values.insert(key.to_string(), value as usize);
            Ok(())
        }
    }

    #[test]
    fn test_slot_key_text() {
        let keys = SlotKeys::new("db", "users");
        assert_eq!(keys.upsert(), "db.users.upsert");
        assert_eq!(keys.upsert_arg(), "db.users.upsert_arg");
    }

    #[test]
    fn test_register_and_unregister() {
        let handle = register(|_: &mut UpsertBatch<'_>| STATUS_OK);
        let outcome = register_argument(handle, Some(&17u8)).unwrap();
        assert_eq!(outcome, BoxOutcome::Boxed(ArgKind::Unsigned));
        assert!(callbacks().contains(handle));
        assert!(arguments().contains(handle));

        unregister(handle);
        assert!(!callbacks().contains(handle));
        assert!(!arguments().contains(handle));

        unregister(handle);
    }

    #[test]
    fn test_drop_unregisters() {
        let handle = {
            let registration = UpsertRegistration::new(|_: &mut UpsertBatch<'_>| true);
            let _ = registration.argument(&"payload").unwrap();
            registration.handle()
        };
        assert!(!callbacks().contains(handle));
        assert!(!arguments().contains(handle));
    }

    #[test]
    fn test_explicit_unregister_is_idempotent() {
        let mut registration = UpsertRegistration::new(|_: &mut UpsertBatch<'_>| true);
        let handle = registration.handle();
        registration.unregister();
        registration.unregister();
        assert!(!registration.is_active());
        assert!(!callbacks().contains(handle));
    }

    #[test]
    fn test_bind_publishes_both_keys() {
        let registration = UpsertRegistration::new(|_: &mut UpsertBatch<'_>| true);
        let keys = SlotKeys::new("db", "orders");
        let mut config = RecordingConfig::default();

        bind(&mut config, &keys, &registration).unwrap();

        assert_eq!(
            config.values.get("db.orders.upsert").copied(),
            Some(registration.callback() as usize)
        );
        assert_eq!(
            config.values.get("db.orders.upsert_arg").copied(),
            Some(registration.handle().get() as usize)
        );
    }

    #[test]
    fn test_strict_config_rejects_unsupported() {
        let mut config = BridgeConfig::default();
        config.arguments.strict = true;

        let err = UpsertRegistration::from_config(&config, |_: &mut UpsertBatch<'_>| true, Some(&0.5f64))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedArgument { .. }));

        config.arguments.strict = false;
        let registration =
            UpsertRegistration::from_config(&config, |_: &mut UpsertBatch<'_>| true, Some(&0.5f64))
                .unwrap();
        assert!(callbacks().contains(registration.handle()));
        assert!(!arguments().contains(registration.handle()));
    }
}
