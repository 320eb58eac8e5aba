//! In-Memory Reference Engine
//!
//! Stands in for the native key-value engine. It keeps pointer-valued
//! settings by key and drives upserts through whatever callback and context
//! were configured, building the same raw arrays a C engine passes and
//! taking ownership of the result buffers the callback produces.

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::ptr;

use thiserror::Error;

use crate::ffi::{SizeLayout, UpsertCallback};
use crate::upsert::{EngineConfig, SlotKeys};

/// Engine-side errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No upsert callback configured under '{0}'")]
    MissingCallback(String),

    #[error("Batch of {0} records exceeds the native count range")]
    BatchTooLarge(usize),

    #[error("Upsert batch has {source_len} source records but {upsert_len} upsert records")]
    MismatchedBatch { source_len: usize, upsert_len: usize },

    #[error("Record of {0} bytes exceeds the native size range")]
    RecordTooLarge(usize),

    #[error("Record {index} is {got} bytes but a shared size array needs {expected}")]
    MixedSizes { index: usize, expected: u32, got: u32 },
}

/// Records handed to one upsert call
#[derive(Debug, Clone, Default)]
pub struct EngineBatch {
    /// Existing values. `None` passes a null source array; a `None` record
    /// passes a null pointer for that record only.
    pub source: Option<Vec<Option<Vec<u8>>>>,
    /// Incoming values
    pub upsert: Vec<Vec<u8>>,
}

impl EngineBatch {
    /// A batch where every record already has a stored value
    pub fn merge(source: Vec<Vec<u8>>, upsert: Vec<Vec<u8>>) -> Self {
        Self {
            source: Some(source.into_iter().map(Some).collect()),
            upsert,
        }
    }

    /// A batch with no source array at all
    pub fn without_source(upsert: Vec<Vec<u8>>) -> Self {
        Self {
            source: None,
            upsert,
        }
    }

    pub fn len(&self) -> usize {
        self.upsert.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upsert.is_empty()
    }
}

/// What the callback returned and produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutcome {
    pub status: c_int,
    /// Copied result buffers; `None` where the callback left a record empty
    pub results: Vec<Option<Vec<u8>>>,
}

/// Configuration store plus an upsert driver
#[derive(Debug)]
pub struct MemoryEngine {
    scope: String,
    pointers: HashMap<String, usize>,
    layout: SizeLayout,
}

impl MemoryEngine {
    /// Engine whose settings live under `scope`, passing one size for the
    /// whole batch like the default registration expects
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            pointers: HashMap::new(),
            layout: SizeLayout::default(),
        }
    }

    /// How this engine fills size arrays and reads result sizes back
    pub fn with_layout(mut self, layout: SizeLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Keys this engine consults for store `name`
    pub fn slot_keys(&self, name: &str) -> SlotKeys {
        SlotKeys::new(&self.scope, name)
    }

    /// A pointer-valued setting
    pub fn pointer(&self, key: &str) -> Option<*mut c_void> {
        self.pointers.get(key).map(|&p| p as *mut c_void)
    }

    /// Run one upsert batch for store `name`
    pub fn upsert(&self, name: &str, batch: &EngineBatch) -> Result<EngineOutcome, EngineError> {
        let keys = self.slot_keys(name);
        let callback = self
            .pointer(keys.upsert())
            .filter(|p| !p.is_null())
            .ok_or_else(|| EngineError::MissingCallback(keys.upsert().to_string()))?;
        // SAFETY: only function pointers of the engine's callback type are
        // ever stored under an `upsert` key.
        let callback: UpsertCallback = unsafe { std::mem::transmute(callback) };
        let context = self.pointer(keys.upsert_arg()).unwrap_or(ptr::null_mut());

        let count = batch.len();
        let native_count = c_int::try_from(count).map_err(|_| EngineError::BatchTooLarge(count))?;
        if let Some(source) = &batch.source {
            if source.len() != count {
                return Err(EngineError::MismatchedBatch {
                    source_len: source.len(),
                    upsert_len: count,
                });
            }
        }

        let mut src: Option<Vec<*mut c_char>> = batch.source.as_ref().map(|records| {
            records
                .iter()
                .map(|r| r.as_ref().map_or(ptr::null_mut(), |b| b.as_ptr() as *mut c_char))
                .collect()
        });
        let mut src_size: Vec<u32> = match &batch.source {
            Some(records) => self.sizes(records.iter().map(|r| r.as_ref().map(Vec::len)))?,
            None => vec![0; count.max(1)],
        };
        let mut upsert: Vec<*mut c_char> = batch
            .upsert
            .iter()
            .map(|b| b.as_ptr() as *mut c_char)
            .collect();
        let mut upsert_size = self.sizes(batch.upsert.iter().map(|b| Some(b.len())))?;
        let mut result: Vec<*mut c_char> = vec![ptr::null_mut(); count];
        let mut result_size: Vec<u32> = vec![0; count.max(1)];

        let src_ptr = src.as_mut().map_or(ptr::null_mut(), |v| v.as_mut_ptr());

        // SAFETY: every array outlives the call and holds `count` entries
        // (size arrays at least one), matching either layout.
        let status = unsafe {
            callback(
                native_count,
                src_ptr,
                src_size.as_mut_ptr(),
                upsert.as_mut_ptr(),
                upsert_size.as_mut_ptr(),
                result.as_mut_ptr(),
                result_size.as_mut_ptr(),
                context,
            )
        };

        let results = result
            .iter()
            .enumerate()
            .map(|(i, &p)| self.take_result(p, &result_size, i))
            .collect();

        Ok(EngineOutcome { status, results })
    }

    /// Native size array for a column; absent records count as 0 and do
    /// not take part in a shared size.
    fn sizes(&self, lens: impl Iterator<Item = Option<usize>>) -> Result<Vec<u32>, EngineError> {
        let lens: Vec<Option<u32>> = lens
            .map(|len| {
                len.map(|l| u32::try_from(l).map_err(|_| EngineError::RecordTooLarge(l)))
                    .transpose()
            })
            .collect::<Result<_, _>>()?;

        let mut sizes: Vec<u32> = match self.layout {
            SizeLayout::PerRecord => lens.iter().map(|l| l.unwrap_or(0)).collect(),
            SizeLayout::Shared => {
                let shared = lens.iter().flatten().copied().next().unwrap_or(0);
                let mismatch = lens.iter().enumerate().find_map(|(index, len)| match *len {
                    Some(got) if got != shared => Some((index, got)),
                    _ => None,
                });
                if let Some((index, got)) = mismatch {
                    return Err(EngineError::MixedSizes {
                        index,
                        expected: shared,
                        got,
                    });
                }
                vec![shared; lens.len()]
            }
        };
        if sizes.is_empty() {
            sizes.push(0);
        }
        Ok(sizes)
    }

    fn take_result(&self, p: *mut c_char, sizes: &[u32], index: usize) -> Option<Vec<u8>> {
        if p.is_null() {
            return None;
        }
        let size = match self.layout {
            SizeLayout::Shared => sizes[0],
            SizeLayout::PerRecord => sizes[index],
        } as usize;
        // SAFETY: the callback published `p` as a malloc'd buffer of `size`
        // bytes; the engine owns and frees it.
        unsafe {
            let bytes = std::slice::from_raw_parts(p as *const u8, size).to_vec();
            libc::free(p as *mut c_void);
            Some(bytes)
        }
    }
}

impl EngineConfig for MemoryEngine {
    type Error = EngineError;

    fn set_pointer(&mut self, key: &str, value: *mut c_void) -> Result<(), Self::Error> {
        tracing::trace!(key, "engine setting updated");
        self.pointers.insert(key.to_string(), value as usize);
        Ok(())
    }
}
