//! Argument Box Registry
//!
//! Some engines want a `void *` handed back on every upsert call. The value
//! behind it is boxed here once, at registration time, on the heap so its
//! address never changes while the registration lives.

use std::any::{type_name, Any};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::{BridgeError, BridgeResult};
use super::registry::Handle;

/// An address the caller already owns and keeps alive itself.
///
/// Boxing one stores the address as-is without copying anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgAddress(usize);

impl ArgAddress {
    pub fn new<T>(ptr: *mut T) -> Self {
        ArgAddress(ptr as usize)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

/// The closed set of argument kinds that can be boxed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Address(ArgAddress),
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

/// Kind tag of a boxed argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Address,
    Text,
    Signed,
    Unsigned,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::Address => write!(f, "address"),
            ArgKind::Text => write!(f, "text"),
            ArgKind::Signed => write!(f, "signed"),
            ArgKind::Unsigned => write!(f, "unsigned"),
        }
    }
}

impl ArgValue {
    /// Classify a dynamically typed value into one of the supported kinds
    pub fn classify(value: &dyn Any) -> Option<Self> {
        macro_rules! widen {
            ($variant:ident, $target:ty, $($ty:ty),+) => {
                $(
                    if let Some(v) = value.downcast_ref::<$ty>() {
                        return Some(ArgValue::$variant(*v as $target));
                    }
                )+
            };
        }

        if let Some(v) = value.downcast_ref::<ArgValue>() {
            return Some(v.clone());
        }
        if let Some(v) = value.downcast_ref::<ArgAddress>() {
            return Some(ArgValue::Address(*v));
        }
        if let Some(v) = value.downcast_ref::<String>() {
            return Some(ArgValue::Text(v.clone()));
        }
        if let Some(v) = value.downcast_ref::<&'static str>() {
            return Some(ArgValue::Text((*v).to_string()));
        }
        widen!(Signed, i64, i8, i16, i32, i64, isize);
        widen!(Unsigned, u64, u8, u16, u32, u64, usize);
        None
    }

    pub fn kind(&self) -> ArgKind {
        match self {
            ArgValue::Address(_) => ArgKind::Address,
            ArgValue::Text(_) => ArgKind::Text,
            ArgValue::Signed(_) => ArgKind::Signed,
            ArgValue::Unsigned(_) => ArgKind::Unsigned,
        }
    }
}

impl From<ArgAddress> for ArgValue {
    fn from(addr: ArgAddress) -> Self {
        ArgValue::Address(addr)
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Text(s)
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Text(s.to_string())
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Signed(v)
    }
}

impl From<u64> for ArgValue {
    fn from(v: u64) -> Self {
        ArgValue::Unsigned(v)
    }
}

// =============================================================================
// Boxed storage
// =============================================================================

enum Storage {
    Address(ArgAddress),
    /// Text bytes followed by a NUL so C code can read it as a string
    Text(Box<[u8]>),
    Signed(Box<i64>),
    Unsigned(Box<u64>),
}

/// A heap-pinned argument value. Read-only once created.
pub struct BoxedArg {
    storage: Storage,
}

impl BoxedArg {
    pub fn new(value: ArgValue) -> Self {
        let storage = match value {
            ArgValue::Address(addr) => Storage::Address(addr),
            ArgValue::Text(s) => {
                let mut bytes = s.into_bytes();
                bytes.push(0);
                Storage::Text(bytes.into_boxed_slice())
            }
            ArgValue::Signed(v) => Storage::Signed(Box::new(v)),
            ArgValue::Unsigned(v) => Storage::Unsigned(Box::new(v)),
        };
        Self { storage }
    }

    pub fn kind(&self) -> ArgKind {
        match &self.storage {
            Storage::Address(_) => ArgKind::Address,
            Storage::Text(_) => ArgKind::Text,
            Storage::Signed(_) => ArgKind::Signed,
            Storage::Unsigned(_) => ArgKind::Unsigned,
        }
    }

    /// Stable address of the boxed value, as handed to native code
    pub fn as_ptr(&self) -> *mut c_void {
        match &self.storage {
            Storage::Address(addr) => addr.as_ptr(),
            Storage::Text(bytes) => bytes.as_ptr() as *mut c_void,
            Storage::Signed(cell) => &**cell as *const i64 as *mut c_void,
            Storage::Unsigned(cell) => &**cell as *const u64 as *mut c_void,
        }
    }

    /// Text bytes without the trailing NUL
    pub fn text_bytes(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Text(bytes) => Some(&bytes[..bytes.len() - 1]),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        self.text_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_signed(&self) -> Option<i64> {
        match &self.storage {
            Storage::Signed(cell) => Some(**cell),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match &self.storage {
            Storage::Unsigned(cell) => Some(**cell),
            _ => None,
        }
    }
}

impl fmt::Debug for BoxedArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxedArg")
            .field("kind", &self.kind())
            .field("ptr", &self.as_ptr())
            .finish()
    }
}

/// What `box_value` did with its input
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxOutcome {
    Boxed(ArgKind),
    /// No value was supplied; the trampoline will pass a null argument
    Absent,
    /// The value's type is outside the supported set and was not boxed
    Unsupported(&'static str),
}

// =============================================================================
// Registry
// =============================================================================

/// Concurrent map from handles to boxed arguments.
///
/// Kept separate from the callback registry: boxing happens once per
/// registration while callback lookups happen on every write.
#[derive(Debug, Default)]
pub struct ArgumentBoxes {
    entries: RwLock<HashMap<Handle, Arc<BoxedArg>>>,
}

impl ArgumentBoxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Box an already classified value.
    ///
    /// A handle is boxed at most once while it is live, since the engine may
    /// already hold the previous address. Remove the box first to re-box.
    pub fn insert(&self, handle: Handle, value: ArgValue) -> BridgeResult<Arc<BoxedArg>> {
        match self.entries.write().entry(handle) {
            Entry::Occupied(_) => Err(BridgeError::AlreadyBoxed(handle)),
            Entry::Vacant(slot) => {
                let boxed = Arc::new(BoxedArg::new(value));
                tracing::debug!(%handle, kind = %boxed.kind(), "boxed upsert argument");
                slot.insert(Arc::clone(&boxed));
                Ok(boxed)
            }
        }
    }

    /// Classify and box an arbitrary value.
    ///
    /// `None` boxes nothing. Unsupported kinds are skipped with a warning,
    /// or rejected when `strict` is set.
    pub fn box_value<T: Any>(
        &self,
        handle: Handle,
        value: Option<&T>,
        strict: bool,
    ) -> BridgeResult<BoxOutcome> {
        let Some(value) = value else {
            return Ok(BoxOutcome::Absent);
        };

        match ArgValue::classify(value) {
            Some(classified) => {
                let kind = classified.kind();
                self.insert(handle, classified)?;
                Ok(BoxOutcome::Boxed(kind))
            }
            None if strict => Err(BridgeError::UnsupportedArgument {
                type_name: type_name::<T>(),
            }),
            None => {
                tracing::warn!(
                    %handle,
                    type_name = type_name::<T>(),
                    "unsupported upsert argument kind; no argument will be passed"
                );
                Ok(BoxOutcome::Unsupported(type_name::<T>()))
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Option<Arc<BoxedArg>> {
        self.entries.read().get(&handle).cloned()
    }

    /// Boxed address for a handle, or null when nothing was boxed.
    /// Stays valid until the box is removed.
    pub fn address(&self, handle: Handle) -> *mut c_void {
        self.entries
            .read()
            .get(&handle)
            .map_or(std::ptr::null_mut(), |boxed| boxed.as_ptr())
    }

    /// Drop the box for a handle. Unknown handles are ignored.
    pub fn remove(&self, handle: Handle) {
        if self.entries.write().remove(&handle).is_some() {
            tracing::debug!(%handle, "released upsert argument");
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.read().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

lazy_static::lazy_static! {
    /// Argument boxes consulted by the trampoline
    static ref ARGUMENTS: ArgumentBoxes = ArgumentBoxes::new();
}

/// The process-wide argument box registry
pub fn arguments() -> &'static ArgumentBoxes {
    &ARGUMENTS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u64) -> Handle {
        Handle::from_raw(raw).unwrap()
    }

    #[test]
    fn test_classify_kinds() {
        assert_eq!(ArgValue::classify(&7i8), Some(ArgValue::Signed(7)));
        assert_eq!(ArgValue::classify(&-3i32), Some(ArgValue::Signed(-3)));
        assert_eq!(ArgValue::classify(&9usize), Some(ArgValue::Unsigned(9)));
        assert_eq!(
            ArgValue::classify(&String::from("hi")),
            Some(ArgValue::Text("hi".to_string()))
        );
        assert_eq!(
            ArgValue::classify(&"static"),
            Some(ArgValue::Text("static".to_string()))
        );
        assert_eq!(ArgValue::classify(&1.5f64), None);
        assert_eq!(ArgValue::classify(&vec![1u8, 2, 3]), None);
    }

    #[test]
    fn test_text_roundtrip_through_address() {
        let boxes = ArgumentBoxes::new();
        let h = handle(1);
        let text = "compaction-friendly \u{2603} payload";

        let outcome = boxes.box_value(h, Some(&text.to_string()), false).unwrap();
        assert_eq!(outcome, BoxOutcome::Boxed(ArgKind::Text));

        let ptr = boxes.address(h) as *const u8;
        assert!(!ptr.is_null());
        let read = unsafe { std::slice::from_raw_parts(ptr, text.len()) };
        assert_eq!(read, text.as_bytes());
        // NUL terminated for C readers
        assert_eq!(unsafe { *ptr.add(text.len()) }, 0);
    }

    #[test]
    fn test_integer_cells() {
        let boxes = ArgumentBoxes::new();
        let signed = handle(1);
        let unsigned = handle(2);

        let _ = boxes.box_value(signed, Some(&-42i16), false).unwrap();
        let _ = boxes.box_value(unsigned, Some(&42u32), false).unwrap();

        let s = unsafe { *(boxes.address(signed) as *const i64) };
        let u = unsafe { *(boxes.address(unsigned) as *const u64) };
        assert_eq!(s, -42);
        assert_eq!(u, 42);
        assert_eq!(boxes.get(signed).unwrap().as_signed(), Some(-42));
        assert_eq!(boxes.get(unsigned).unwrap().as_unsigned(), Some(42));
    }

    #[test]
    fn test_address_is_not_copied() {
        let boxes = ArgumentBoxes::new();
        let h = handle(1);
        let mut target = 0xdead_beefu64;
        let addr = ArgAddress::new(&mut target as *mut u64);

        let _ = boxes.box_value(h, Some(&addr), false).unwrap();
        assert_eq!(boxes.address(h), addr.as_ptr());
    }

    #[test]
    fn test_address_stable_across_growth() {
        let boxes = ArgumentBoxes::new();
        let first = handle(1);
        boxes.insert(first, ArgValue::Unsigned(5)).unwrap();
        let before = boxes.address(first);

        for raw in 2..512 {
            boxes.insert(handle(raw), ArgValue::Text(format!("value-{}", raw))).unwrap();
        }

        assert_eq!(boxes.address(first), before);
    }

    #[test]
    fn test_absent_and_unsupported() {
        let boxes = ArgumentBoxes::new();
        let h = handle(1);

        let outcome = boxes.box_value::<u8>(h, None, false).unwrap();
        assert_eq!(outcome, BoxOutcome::Absent);
        assert!(boxes.address(h).is_null());

        let outcome = boxes.box_value(h, Some(&2.5f32), false).unwrap();
        assert_eq!(outcome, BoxOutcome::Unsupported("f32"));
        assert!(boxes.address(h).is_null());
        assert!(boxes.is_empty());

        let err = boxes.box_value(h, Some(&2.5f32), true).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::UnsupportedArgument { type_name: "f32" }
        ));
    }

    #[test]
    fn test_live_box_is_not_replaced() {
        let boxes = ArgumentBoxes::new();
        let h = handle(1);
        let _ = boxes.box_value(h, Some(&String::from("first")), false).unwrap();
        let before = boxes.address(h);

        let err = boxes.box_value(h, Some(&String::from("second")), false).unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyBoxed(rejected) if rejected == h));
        assert!(matches!(
            boxes.insert(h, ArgValue::Signed(2)),
            Err(BridgeError::AlreadyBoxed(_))
        ));
        assert_eq!(boxes.address(h), before);
        assert_eq!(boxes.get(h).unwrap().as_text(), Some("first"));

        boxes.remove(h);
        let outcome = boxes.box_value(h, Some(&String::from("second")), false).unwrap();
        assert_eq!(outcome, BoxOutcome::Boxed(ArgKind::Text));
        assert_eq!(boxes.get(h).unwrap().as_text(), Some("second"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let boxes = ArgumentBoxes::new();
        let h = handle(1);
        boxes.insert(h, ArgValue::Signed(1)).unwrap();

        boxes.remove(h);
        boxes.remove(h);
        assert!(!boxes.contains(h));
        assert!(boxes.address(h).is_null());
    }
}
