//! Upsert Trampoline
//!
//! The one function the engine is configured to call. It turns the context
//! pointer back into a handle, finds the closure, wraps the raw arrays in
//! bounded views and maps the outcome to a native status code. No error and
//! no panic escapes across the C boundary.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};

use super::args::{arguments, ArgumentBoxes};
use super::marshal::{BufferArray, ResultArray, UpsertBatch};
use super::registry::{callbacks, CallbackRegistry, Handle};
use super::types::{UpsertCallback, STATUS_FAILED, STATUS_OK};

/// Raw arguments of one engine call
#[derive(Debug, Clone, Copy)]
pub struct RawInvocation {
    pub count: c_int,
    pub src: *mut *mut c_char,
    pub src_size: *mut u32,
    pub upsert: *mut *mut c_char,
    pub upsert_size: *mut u32,
    pub result: *mut *mut c_char,
    pub result_size: *mut u32,
    pub arg: *mut c_void,
}

/// Entry point handed to the engine under the `upsert` configuration key.
///
/// # Safety
///
/// Must only be called by the engine with arrays that are valid for `count`
/// records under the size layouts the handle was registered with, and with
/// `arg` set to the handle published under the `upsert_arg` key.
pub unsafe extern "C" fn upsert_trampoline(
    count: c_int,
    src: *mut *mut c_char,
    src_size: *mut u32,
    upsert: *mut *mut c_char,
    upsert_size: *mut u32,
    result: *mut *mut c_char,
    result_size: *mut u32,
    arg: *mut c_void,
) -> c_int {
    let call = RawInvocation {
        count,
        src,
        src_size,
        upsert,
        upsert_size,
        result,
        result_size,
        arg,
    };
    dispatch(callbacks(), arguments(), call)
}

/// The trampoline as a function pointer of the engine's callback type
pub fn trampoline() -> UpsertCallback {
    upsert_trampoline
}

/// Resolve and run one engine call against the given registries.
///
/// # Safety
///
/// Same contract as [`upsert_trampoline`].
pub unsafe fn dispatch(
    registry: &CallbackRegistry,
    boxes: &ArgumentBoxes,
    call: RawInvocation,
) -> c_int {
    let Some(handle) = Handle::from_context(call.arg) else {
        tracing::warn!("upsert dispatched with a null context");
        return STATUS_OK;
    };

    // Box before closure: teardown removes the closure before the box, so a
    // closure still found here always comes with the box it was given.
    let boxed = boxes.get(handle);

    // Unknown handles happen when teardown races an in-flight write.
    let Some(entry) = registry.lookup(handle) else {
        tracing::warn!(%handle, "upsert dispatched to unregistered handle");
        return STATUS_OK;
    };

    if call.src.is_null() {
        tracing::trace!(%handle, "null source array, nothing to merge");
        return STATUS_OK;
    }

    let Ok(count) = usize::try_from(call.count) else {
        tracing::warn!(%handle, count = call.count, "negative upsert batch count");
        return STATUS_OK;
    };

    let options = entry.options();
    tracing::trace!(%handle, count, "dispatching upsert batch");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the engine guarantees the arrays are valid for `count`
        // records under the registered layouts for the duration of the call.
        let mut batch = unsafe {
            UpsertBatch::new(
                BufferArray::from_raw(call.src, call.src_size, count, options.source),
                BufferArray::from_raw(call.upsert, call.upsert_size, count, options.upsert),
                ResultArray::from_raw(call.result, call.result_size, count, options.result),
                boxed.as_deref(),
            )
        };
        entry.invoke(&mut batch)
    }));

    match outcome {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(%handle, "upsert callback panicked");
            STATUS_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::ffi::{ArgValue, UpsertOptions};

    fn invocation(
        count: c_int,
        src: *mut *mut c_char,
        upsert: *mut *mut c_char,
        arg: *mut c_void,
    ) -> RawInvocation {
        RawInvocation {
            count,
            src,
            src_size: ptr::null_mut(),
            upsert,
            upsert_size: ptr::null_mut(),
            result: ptr::null_mut(),
            result_size: ptr::null_mut(),
            arg,
        }
    }

    #[test]
    fn test_null_source_skips_closure() {
        let registry = CallbackRegistry::new();
        let boxes = ArgumentBoxes::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handle = registry.register(move |_: &mut UpsertBatch<'_>| {
            seen.fetch_add(1, Ordering::SeqCst);
            STATUS_FAILED
        });

        let mut upsert = [ptr::null_mut::<c_char>()];
        let status = unsafe {
            dispatch(
                &registry,
                &boxes,
                invocation(1, ptr::null_mut(), upsert.as_mut_ptr(), handle.as_context()),
            )
        };

        assert_eq!(status, STATUS_OK);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_handle_is_success() {
        let registry = CallbackRegistry::new();
        let boxes = ArgumentBoxes::new();
        let handle = registry.register(|_: &mut UpsertBatch<'_>| STATUS_FAILED);
        registry.unregister(handle);

        let mut src = [ptr::null_mut::<c_char>()];
        let status = unsafe {
            dispatch(
                &registry,
                &boxes,
                invocation(1, src.as_mut_ptr(), ptr::null_mut(), handle.as_context()),
            )
        };
        assert_eq!(status, STATUS_OK);

        let status = unsafe {
            dispatch(
                &registry,
                &boxes,
                invocation(1, src.as_mut_ptr(), ptr::null_mut(), ptr::null_mut()),
            )
        };
        assert_eq!(status, STATUS_OK);
    }

    #[test]
    fn test_status_passes_through() {
        let registry = CallbackRegistry::new();
        let boxes = ArgumentBoxes::new();
        let handle = registry.register(|_: &mut UpsertBatch<'_>| 7 as c_int);

        let mut src = [ptr::null_mut::<c_char>()];
        let status = unsafe {
            dispatch(
                &registry,
                &boxes,
                invocation(1, src.as_mut_ptr(), ptr::null_mut(), handle.as_context()),
            )
        };
        assert_eq!(status, 7);
    }

    #[test]
    fn test_panic_maps_to_failure() {
        let registry = CallbackRegistry::new();
        let boxes = ArgumentBoxes::new();
        let handle = registry.register(|_: &mut UpsertBatch<'_>| -> c_int {
            panic!("merge exploded");
        });

        let mut src = [ptr::null_mut::<c_char>()];
        let status = unsafe {
            dispatch(
                &registry,
                &boxes,
                invocation(1, src.as_mut_ptr(), ptr::null_mut(), handle.as_context()),
            )
        };
        assert_eq!(status, STATUS_FAILED);
    }

    #[test]
    fn test_negative_count_is_noop() {
        let registry = CallbackRegistry::new();
        let boxes = ArgumentBoxes::new();
        let handle = registry.register(|_: &mut UpsertBatch<'_>| false);

        let mut src = [ptr::null_mut::<c_char>()];
        let status = unsafe {
            dispatch(
                &registry,
                &boxes,
                invocation(-1, src.as_mut_ptr(), ptr::null_mut(), handle.as_context()),
            )
        };
        assert_eq!(status, STATUS_OK);
    }

    #[test]
    fn test_boxed_argument_reaches_closure() {
        let registry = CallbackRegistry::new();
        let boxes = ArgumentBoxes::new();
        let handle = registry.register_with(
            |batch: &mut UpsertBatch<'_>| {
                batch.count() == 2 && batch.arg().and_then(|a| a.as_text()) == Some("ttl=30")
            },
            UpsertOptions::per_record(),
        );
        boxes.insert(handle, ArgValue::Text("ttl=30".to_string())).unwrap();

        let mut src = [ptr::null_mut::<c_char>(); 2];
        let status = unsafe {
            dispatch(
                &registry,
                &boxes,
                invocation(2, src.as_mut_ptr(), ptr::null_mut(), handle.as_context()),
            )
        };
        assert_eq!(status, STATUS_OK);
    }

    #[test]
    fn test_missing_box_passes_null_arg() {
        let registry = CallbackRegistry::new();
        let boxes = ArgumentBoxes::new();
        let handle = registry.register(|batch: &mut UpsertBatch<'_>| batch.arg_ptr().is_null());
        let _ = boxes.box_value(handle, Some(&vec![0u8; 4]), false).unwrap();

        let mut src = [ptr::null_mut::<c_char>()];
        let status = unsafe {
            dispatch(
                &registry,
                &boxes,
                invocation(1, src.as_mut_ptr(), ptr::null_mut(), handle.as_context()),
            )
        };
        assert_eq!(status, STATUS_OK);
    }
}
