//! Loading the real CUDA driver.
//!
//! The agent interposes `dlsym` itself, so the real `dlsym` is fetched
//! with `dlvsym` under the glibc version it was exported with, and the
//! driver's entry points are resolved through that. Resolution failures
//! for symbols the agent cannot work without are fatal for the process,
//! matching the fact that the application could not have used the GPU
//! either way.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::ptr;

use once_cell::sync::{Lazy, OnceCell};

use crate::agent::die;
use crate::cuda::*;
use crate::error::AgentError;

type DlsymFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;

/// glibc 2.34 moved `dlsym` out of libdl and changed its symbol
/// version; probe the old version first, then the new one.
static REAL_DLSYM: Lazy<DlsymFn> = Lazy::new(|| {
    for version in [c"GLIBC_2.2.5", c"GLIBC_2.34"] {
        unsafe {
            libc::dlerror();
            let ptr = libc::dlvsym(libc::RTLD_NEXT, c"dlsym".as_ptr(), version.as_ptr());
            if !ptr.is_null() && libc::dlerror().is_null() {
                return std::mem::transmute::<*mut c_void, DlsymFn>(ptr);
            }
        }
    }
    die("could not locate the real dlsym with dlvsym");
});

/// The real `dlsym`, usable even while our interposed `dlsym` is the
/// one visible to the rest of the process.
pub unsafe fn real_dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    (REAL_DLSYM)(handle, symbol)
}

/// Resolved entry points of the real driver.
pub struct Driver {
    pub cu_init: CuInitFn,
    pub cu_get_proc_address: Option<CuGetProcAddressFn>,
    pub cu_get_proc_address_v2: Option<CuGetProcAddressV2Fn>,
    pub cu_mem_alloc_managed: CuMemAllocManagedFn,
    pub cu_mem_free: CuMemFreeFn,
    pub cu_mem_get_info: CuMemGetInfoFn,
    pub cu_get_error_string: CuGetErrorFn,
    pub cu_get_error_name: CuGetErrorFn,
    pub cu_ctx_set_current: CuCtxSetCurrentFn,
    pub cu_ctx_get_current: CuCtxGetCurrentFn,
    pub cu_ctx_synchronize: CuCtxSynchronizeFn,
    pub cu_launch_kernel: CuLaunchKernelFn,
    pub cu_memcpy: CuMemcpyFn,
    pub cu_memcpy_async: CuMemcpyAsyncFn,
    pub cu_memcpy_dtoh: CuMemcpyDtoHFn,
    pub cu_memcpy_dtoh_async: CuMemcpyDtoHAsyncFn,
    pub cu_memcpy_htod: CuMemcpyHtoDFn,
    pub cu_memcpy_htod_async: CuMemcpyHtoDAsyncFn,
    pub cu_memcpy_dtod: CuMemcpyFn,
    pub cu_memcpy_dtod_async: CuMemcpyAsyncFn,
}

// Function pointers into a loaded shared object are valid process-wide.
unsafe impl Send for Driver {}
unsafe impl Sync for Driver {}

static DRIVER: OnceCell<Driver> = OnceCell::new();

/// The loaded driver, or None before [`load`] has succeeded. Hooked
/// entry points that run before bootstrap report
/// `CUDA_ERROR_NOT_INITIALIZED` through this.
pub fn get() -> Option<&'static Driver> {
    DRIVER.get()
}

/// Load the real driver once.
pub fn load() -> Result<&'static Driver, AgentError> {
    DRIVER.get_or_try_init(Driver::open)
}

fn dlerror_string() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dlopen error".into()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

/// Resolve `name` from `handle`, distinguishing a genuine NULL symbol
/// from a lookup failure via the dlerror protocol.
unsafe fn resolve(handle: *mut c_void, name: &CStr) -> Result<*mut c_void, AgentError> {
    libc::dlerror();
    let ptr = real_dlsym(handle, name.as_ptr());
    let err = libc::dlerror();
    if !err.is_null() || ptr.is_null() {
        return Err(AgentError::MissingSymbol(
            name.to_string_lossy().into_owned(),
        ));
    }
    Ok(ptr)
}

macro_rules! required {
    ($handle:expr, $name:literal, $ty:ty) => {
        unsafe { std::mem::transmute::<*mut c_void, $ty>(resolve($handle, $name)?) }
    };
}

macro_rules! optional {
    ($handle:expr, $name:literal, $ty:ty) => {
        match unsafe { resolve($handle, $name) } {
            Ok(ptr) => Some(unsafe { std::mem::transmute::<*mut c_void, $ty>(ptr) }),
            Err(e) => {
                // Absent in CUDA runtimes older than 11.3.
                tracing::debug!("{e}");
                None
            }
        }
    };
}

impl Driver {
    fn open() -> Result<Self, AgentError> {
        let handle = unsafe {
            let h = libc::dlopen(c"libcuda.so".as_ptr(), libc::RTLD_LAZY);
            if !h.is_null() {
                h
            } else {
                libc::dlopen(c"libcuda.so.1".as_ptr(), libc::RTLD_LAZY)
            }
        };
        if handle.is_null() {
            return Err(AgentError::DriverUnavailable(dlerror_string()));
        }

        Ok(Driver {
            cu_init: required!(handle, c"cuInit", CuInitFn),
            cu_get_proc_address: optional!(handle, c"cuGetProcAddress", CuGetProcAddressFn),
            cu_get_proc_address_v2: optional!(
                handle,
                c"cuGetProcAddress_v2",
                CuGetProcAddressV2Fn
            ),
            cu_mem_alloc_managed: required!(handle, c"cuMemAllocManaged", CuMemAllocManagedFn),
            cu_mem_free: required!(handle, c"cuMemFree_v2", CuMemFreeFn),
            cu_mem_get_info: required!(handle, c"cuMemGetInfo_v2", CuMemGetInfoFn),
            cu_get_error_string: required!(handle, c"cuGetErrorString", CuGetErrorFn),
            cu_get_error_name: required!(handle, c"cuGetErrorName", CuGetErrorFn),
            cu_ctx_set_current: required!(handle, c"cuCtxSetCurrent", CuCtxSetCurrentFn),
            cu_ctx_get_current: required!(handle, c"cuCtxGetCurrent", CuCtxGetCurrentFn),
            cu_ctx_synchronize: required!(handle, c"cuCtxSynchronize", CuCtxSynchronizeFn),
            cu_launch_kernel: required!(handle, c"cuLaunchKernel", CuLaunchKernelFn),
            cu_memcpy: required!(handle, c"cuMemcpy", CuMemcpyFn),
            cu_memcpy_async: required!(handle, c"cuMemcpyAsync", CuMemcpyAsyncFn),
            cu_memcpy_dtoh: required!(handle, c"cuMemcpyDtoH_v2", CuMemcpyDtoHFn),
            cu_memcpy_dtoh_async: required!(handle, c"cuMemcpyDtoHAsync_v2", CuMemcpyDtoHAsyncFn),
            cu_memcpy_htod: required!(handle, c"cuMemcpyHtoD_v2", CuMemcpyHtoDFn),
            cu_memcpy_htod_async: required!(handle, c"cuMemcpyHtoDAsync_v2", CuMemcpyHtoDAsyncFn),
            cu_memcpy_dtod: required!(handle, c"cuMemcpyDtoD_v2", CuMemcpyFn),
            cu_memcpy_dtod_async: required!(handle, c"cuMemcpyDtoDAsync_v2", CuMemcpyAsyncFn),
        })
    }
}

/// Log a non-success driver return code with its name and description.
pub fn cuda_check(drv: &Driver, result: CUresult, func: &str) {
    if result == CUDA_SUCCESS {
        return;
    }
    let mut name: *const c_char = ptr::null();
    let mut desc: *const c_char = ptr::null();
    unsafe {
        (drv.cu_get_error_name)(result, &mut name);
        (drv.cu_get_error_string)(result, &mut desc);
    }
    let name = cstr_or(name, "CUDA_ERROR_UNKNOWN");
    let desc = cstr_or(desc, "unrecognized error code");
    tracing::warn!("{func} returned {name}: {desc}");
}

fn cstr_or(ptr: *const c_char, default: &str) -> String {
    if ptr.is_null() {
        default.into()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}
