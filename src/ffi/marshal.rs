//! Array Marshaling
//!
//! The engine hands over bare `char **` / `uint32_t *` pairs with no length
//! information. These views bind them to the batch `count` once, inside the
//! trampoline, and only ever index within it afterwards.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::os::raw::c_char;
use std::ptr;
use std::slice;

use super::args::BoxedArg;
use super::error::{BridgeError, BridgeResult};
use super::types::SizeLayout;

/// Non-owning view of one record's buffer
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer<'a> {
    ptr: *const u8,
    size: u32,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> RawBuffer<'a> {
    fn new(ptr: *const c_char, size: u32) -> Self {
        Self {
            ptr: ptr as *const u8,
            size,
            _marker: PhantomData,
        }
    }

    /// Raw address as the engine supplied it
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Size reported for this record
    pub fn size(&self) -> u32 {
        self.size
    }

    /// True when the engine supplied no buffer for this record
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Buffer contents, or `None` when the record is absent
    pub fn bytes(&self) -> Option<&'a [u8]> {
        if self.ptr.is_null() {
            return None;
        }
        if self.size == 0 {
            return Some(&[]);
        }
        // SAFETY: a non-null view only exists inside a batch whose arrays were
        // vouched for by `BufferArray::from_raw`; the engine keeps each buffer
        // valid for `size` bytes for the duration of the call.
        Some(unsafe { slice::from_raw_parts(self.ptr, self.size as usize) })
    }
}

fn size_at(sizes: &[u32], layout: SizeLayout, index: usize) -> u32 {
    let slot = match layout {
        SizeLayout::Shared => 0,
        SizeLayout::PerRecord => index,
    };
    sizes.get(slot).copied().unwrap_or(0)
}

/// Read-only view over an input array (`src` or `upsert`)
#[derive(Debug, Clone, Copy)]
pub struct BufferArray<'a> {
    ptrs: &'a [*mut c_char],
    sizes: &'a [u32],
    layout: SizeLayout,
    count: usize,
}

impl<'a> BufferArray<'a> {
    /// Bind a native pointer/size pair to `count` records.
    ///
    /// A null `base` yields a view where every record is absent; a null
    /// `sizes` yields size 0 for every record.
    ///
    /// # Safety
    ///
    /// When non-null, `base` must point to `count` readable pointers and
    /// `sizes` to `layout.slots(count)` readable `u32`s, and every non-null
    /// record pointer must be readable for its size, all for `'a`.
    pub unsafe fn from_raw(
        base: *const *mut c_char,
        sizes: *const u32,
        count: usize,
        layout: SizeLayout,
    ) -> Self {
        let ptrs = if base.is_null() {
            &[][..]
        } else {
            slice::from_raw_parts(base, count)
        };
        let sizes = if sizes.is_null() {
            &[][..]
        } else {
            slice::from_raw_parts(sizes, layout.slots(count))
        };
        Self {
            ptrs,
            sizes,
            layout,
            count,
        }
    }

    /// A view with no records
    pub fn empty() -> Self {
        Self {
            ptrs: &[],
            sizes: &[],
            layout: SizeLayout::Shared,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True when the engine passed a null base pointer
    pub fn is_null(&self) -> bool {
        self.ptrs.is_empty() && self.count > 0
    }

    pub fn layout(&self) -> SizeLayout {
        self.layout
    }

    /// Record `index`, or `None` past the end of the batch
    pub fn get(&self, index: usize) -> Option<RawBuffer<'a>> {
        if index >= self.count {
            return None;
        }
        let ptr = self.ptrs.get(index).copied().unwrap_or(ptr::null_mut());
        Some(RawBuffer::new(ptr, size_at(self.sizes, self.layout, index)))
    }

    /// Size of record `index` under this array's layout
    pub fn size(&self, index: usize) -> u32 {
        if index >= self.count {
            return 0;
        }
        size_at(self.sizes, self.layout, index)
    }

    /// The first size slot, i.e. the batch-wide size of a shared layout
    pub fn shared_size(&self) -> u32 {
        self.sizes.first().copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = RawBuffer<'a>> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }
}

/// Writable view over the `result` array
#[derive(Debug)]
pub struct ResultArray<'a> {
    ptrs: &'a mut [*mut c_char],
    sizes: &'a mut [u32],
    layout: SizeLayout,
    count: usize,
    // First size published into a shared slot; later records must match it
    shared: Option<u32>,
}

impl<'a> ResultArray<'a> {
    /// Bind the native result arrays to `count` records.
    ///
    /// # Safety
    ///
    /// When non-null, `base` must point to `count` writable pointers and
    /// `sizes` to `layout.slots(count)` writable `u32`s, exclusively for `'a`.
    pub unsafe fn from_raw(
        base: *mut *mut c_char,
        sizes: *mut u32,
        count: usize,
        layout: SizeLayout,
    ) -> Self {
        let ptrs = if base.is_null() {
            &mut [][..]
        } else {
            slice::from_raw_parts_mut(base, count)
        };
        let sizes = if sizes.is_null() {
            &mut [][..]
        } else {
            slice::from_raw_parts_mut(sizes, layout.slots(count))
        };
        Self {
            ptrs,
            sizes,
            layout,
            count,
            shared: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            ptrs: &mut [],
            sizes: &mut [],
            layout: SizeLayout::Shared,
            count: 0,
            shared: None,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn layout(&self) -> SizeLayout {
        self.layout
    }

    fn slot(&self, index: usize, size: u32) -> BridgeResult<()> {
        if index >= self.count {
            return Err(BridgeError::IndexOutOfRange {
                index,
                count: self.count,
            });
        }
        if self.ptrs.is_empty() {
            return Err(BridgeError::NullArray("result"));
        }
        match self.shared {
            Some(expected) if self.layout == SizeLayout::Shared && expected != size => {
                Err(BridgeError::SharedSizeMismatch {
                    index,
                    expected,
                    got: size,
                })
            }
            _ => Ok(()),
        }
    }

    fn record_size(&mut self, index: usize, size: u32) {
        let slot = match self.layout {
            SizeLayout::Shared => {
                self.shared = Some(size);
                0
            }
            SizeLayout::PerRecord => index,
        };
        if let Some(s) = self.sizes.get_mut(slot) {
            *s = size;
        }
    }

    /// Copy `bytes` into a buffer from the C allocator and publish it as
    /// record `index`. The engine owns the buffer afterwards and releases it
    /// with `free`.
    ///
    /// Under a shared layout every record written in one batch must have the
    /// same length as the first one.
    pub fn write(&mut self, index: usize, bytes: &[u8]) -> BridgeResult<()> {
        let size = u32::try_from(bytes.len()).map_err(|_| BridgeError::SizeOverflow(bytes.len()))?;
        self.slot(index, size)?;

        // SAFETY: malloc with a non-zero size; the copy stays within the
        // fresh allocation.
        let buf = unsafe { libc::malloc(bytes.len().max(1)) } as *mut c_char;
        if buf.is_null() {
            return Err(BridgeError::Allocation(bytes.len()));
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, bytes.len()) };

        self.ptrs[index] = buf;
        self.record_size(index, size);
        Ok(())
    }

    /// Publish a buffer the caller allocated itself.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size` bytes and allocated the way the engine
    /// expects to release it. On error the buffer is not published and stays
    /// with the caller.
    pub unsafe fn assign(&mut self, index: usize, ptr: *mut c_void, size: u32) -> BridgeResult<()> {
        self.slot(index, size)?;
        self.ptrs[index] = ptr as *mut c_char;
        self.record_size(index, size);
        Ok(())
    }

    /// Current contents of record `index`
    pub fn get(&self, index: usize) -> Option<RawBuffer<'_>> {
        if index >= self.count {
            return None;
        }
        let ptr = self.ptrs.get(index).copied().unwrap_or(ptr::null_mut());
        Some(RawBuffer::new(ptr, size_at(self.sizes, self.layout, index)))
    }
}

/// One upsert call as the registered closure sees it
#[derive(Debug)]
pub struct UpsertBatch<'a> {
    /// Values already stored for each record (individual records may be absent)
    pub source: BufferArray<'a>,
    /// Incoming values
    pub upsert: BufferArray<'a>,
    /// Values to produce
    pub result: ResultArray<'a>,
    arg: Option<&'a BoxedArg>,
    count: usize,
}

impl<'a> UpsertBatch<'a> {
    pub fn new(
        source: BufferArray<'a>,
        upsert: BufferArray<'a>,
        result: ResultArray<'a>,
        arg: Option<&'a BoxedArg>,
    ) -> Self {
        let count = source.len();
        Self {
            source,
            upsert,
            result,
            arg,
            count,
        }
    }

    /// Number of records in the batch
    pub fn count(&self) -> usize {
        self.count
    }

    /// The argument boxed at registration time, if any
    pub fn arg(&self) -> Option<&'a BoxedArg> {
        self.arg
    }

    /// Address of the boxed argument, or null
    pub fn arg_ptr(&self) -> *mut c_void {
        self.arg.map_or(ptr::null_mut(), |a| a.as_ptr())
    }
}
