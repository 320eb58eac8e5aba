//! Native ABI Types
//!
//! Defines the C-side shapes the engine hands to the upsert hook.

use std::ffi::c_void;
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::BridgeError;

/// Status returned to the engine when the hook succeeded (or did nothing)
pub const STATUS_OK: c_int = 0;

/// Status returned to the engine when the hook failed
pub const STATUS_FAILED: c_int = -1;

/// The fixed signature the engine calls for every upsert batch
///
/// ```c
/// int upsert(int count,
///            char **src,    uint32_t *src_size,
///            char **upsert, uint32_t *upsert_size,
///            char **result, uint32_t *result_size,
///            void *arg);
/// ```
pub type UpsertCallback = unsafe extern "C" fn(
    count: c_int,
    src: *mut *mut c_char,
    src_size: *mut u32,
    upsert: *mut *mut c_char,
    upsert_size: *mut u32,
    result: *mut *mut c_char,
    result_size: *mut u32,
    arg: *mut c_void,
) -> c_int;

/// How a size array accompanying a pointer array is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum SizeLayout {
    /// A single `u32` applies to every record in the batch
    #[default]
    Shared,
    /// One `u32` per record
    PerRecord,
}

impl SizeLayout {
    /// Number of `u32` slots the native array holds for a batch of `count`
    pub fn slots(&self, count: usize) -> usize {
        match self {
            SizeLayout::Shared => count.min(1),
            SizeLayout::PerRecord => count,
        }
    }
}

impl FromStr for SizeLayout {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" | "aggregate" | "single" => Ok(SizeLayout::Shared),
            "per_record" | "per-record" | "record" => Ok(SizeLayout::PerRecord),
            _ => Err(BridgeError::UnknownLayout(s.to_string())),
        }
    }
}

impl TryFrom<String> for SizeLayout {
    type Error = BridgeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for SizeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeLayout::Shared => write!(f, "shared"),
            SizeLayout::PerRecord => write!(f, "per_record"),
        }
    }
}

/// Size layouts for the three arrays of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsertOptions {
    pub source: SizeLayout,
    pub upsert: SizeLayout,
    pub result: SizeLayout,
}

impl UpsertOptions {
    /// Every array carries one size per record
    pub fn per_record() -> Self {
        Self {
            source: SizeLayout::PerRecord,
            upsert: SizeLayout::PerRecord,
            result: SizeLayout::PerRecord,
        }
    }
}

/// Conversion from a closure's return value into a native status code
pub trait IntoStatus {
    fn into_status(self) -> c_int;
}

impl IntoStatus for c_int {
    fn into_status(self) -> c_int {
        self
    }
}

impl IntoStatus for bool {
    fn into_status(self) -> c_int {
        if self {
            STATUS_OK
        } else {
            STATUS_FAILED
        }
    }
}

impl<E: fmt::Display> IntoStatus for Result<(), E> {
    fn into_status(self) -> c_int {
        match self {
            Ok(()) => STATUS_OK,
            Err(e) => {
                tracing::debug!(error = %e, "upsert callback reported failure");
                STATUS_FAILED
            }
        }
    }
}
