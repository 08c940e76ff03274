//! Minimal CUDA driver ABI surface.
//!
//! Only the handful of types and entry points the agent interposes or
//! calls through to. Opaque driver handles are raw pointers; the
//! function-pointer aliases keep the hook and driver tables readable.

use std::os::raw::{c_char, c_int, c_uint, c_void};

pub type CUdeviceptr = u64;
pub type CUcontext = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUresult = c_int;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
pub const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;

/// Flag for `cuMemAllocManaged`: the allocation is accessible from any
/// stream on any device.
pub const CU_MEM_ATTACH_GLOBAL: c_uint = 0x1;

/// `CUdriverProcAddressQueryResult`: symbol found.
pub const CU_GET_PROC_ADDRESS_SUCCESS: c_int = 0;

pub type CuInitFn = unsafe extern "C" fn(c_uint) -> CUresult;
pub type CuGetProcAddressFn =
    unsafe extern "C" fn(*const c_char, *mut *mut c_void, c_int, u64) -> CUresult;
pub type CuGetProcAddressV2Fn =
    unsafe extern "C" fn(*const c_char, *mut *mut c_void, c_int, u64, *mut c_int) -> CUresult;
pub type CuMemAllocFn = unsafe extern "C" fn(*mut CUdeviceptr, usize) -> CUresult;
pub type CuMemAllocManagedFn =
    unsafe extern "C" fn(*mut CUdeviceptr, usize, c_uint) -> CUresult;
pub type CuMemFreeFn = unsafe extern "C" fn(CUdeviceptr) -> CUresult;
pub type CuMemGetInfoFn = unsafe extern "C" fn(*mut usize, *mut usize) -> CUresult;
pub type CuGetErrorFn = unsafe extern "C" fn(CUresult, *mut *const c_char) -> CUresult;
pub type CuCtxSetCurrentFn = unsafe extern "C" fn(CUcontext) -> CUresult;
pub type CuCtxGetCurrentFn = unsafe extern "C" fn(*mut CUcontext) -> CUresult;
pub type CuCtxSynchronizeFn = unsafe extern "C" fn() -> CUresult;
#[allow(clippy::type_complexity)]
pub type CuLaunchKernelFn = unsafe extern "C" fn(
    CUfunction,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    CUstream,
    *mut *mut c_void,
    *mut *mut c_void,
) -> CUresult;
pub type CuMemcpyFn = unsafe extern "C" fn(CUdeviceptr, CUdeviceptr, usize) -> CUresult;
pub type CuMemcpyAsyncFn =
    unsafe extern "C" fn(CUdeviceptr, CUdeviceptr, usize, CUstream) -> CUresult;
pub type CuMemcpyDtoHFn = unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize) -> CUresult;
pub type CuMemcpyDtoHAsyncFn =
    unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize, CUstream) -> CUresult;
pub type CuMemcpyHtoDFn = unsafe extern "C" fn(CUdeviceptr, *const c_void, usize) -> CUresult;
pub type CuMemcpyHtoDAsyncFn =
    unsafe extern "C" fn(CUdeviceptr, *const c_void, usize, CUstream) -> CUresult;
