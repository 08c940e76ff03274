//! Interposed entry points.
//!
//! The CUDA runtime obtains driver entry points dynamically: older
//! runtimes call `dlsym` for each symbol, newer ones (11.3+) look up
//! `cuGetProcAddress` and bootstrap everything else through it. Both
//! query paths consult [`hooked_entry`], the provider that maps a
//! foreign name to an agent replacement and otherwise falls through to
//! the real implementation.
//!
//! Replacement behavior: allocation entry points enforce the ledger and
//! divert to unified memory, work-submission entry points gate on lock
//! ownership first, and everything forwards the underlying driver's
//! return code to the application unchanged.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::time::Instant;

use crate::agent::{self, Agent};
use crate::cuda::*;
use crate::driver::{self, cuda_check};

/// Map a queried driver symbol name to an agent entry point. Both the
/// plain and `_v2`-suffixed forms are recognized: `dlsym`-era runtimes
/// query versioned names while `cuGetProcAddress` queries base names.
pub(crate) fn hooked_entry(name: &str) -> Option<*mut c_void> {
    macro_rules! entry {
        ($f:ident as $ty:ty) => {
            $f as $ty as usize as *mut c_void
        };
    }

    let ptr = match name {
        "cuMemAlloc" | "cuMemAlloc_v2" => entry!(cu_mem_alloc as CuMemAllocFn),
        "cuMemFree" | "cuMemFree_v2" => entry!(cu_mem_free as CuMemFreeFn),
        "cuMemGetInfo" | "cuMemGetInfo_v2" => entry!(cu_mem_get_info as CuMemGetInfoFn),
        "cuGetProcAddress" => entry!(cu_get_proc_address as CuGetProcAddressFn),
        "cuGetProcAddress_v2" => entry!(cu_get_proc_address_v2 as CuGetProcAddressV2Fn),
        "cuInit" => entry!(cu_init as CuInitFn),
        "cuLaunchKernel" => entry!(cu_launch_kernel as CuLaunchKernelFn),
        "cuMemcpy" => entry!(cu_memcpy as CuMemcpyFn),
        "cuMemcpyAsync" => entry!(cu_memcpy_async as CuMemcpyAsyncFn),
        "cuMemcpyDtoH" | "cuMemcpyDtoH_v2" => entry!(cu_memcpy_dtoh as CuMemcpyDtoHFn),
        "cuMemcpyDtoHAsync" | "cuMemcpyDtoHAsync_v2" => {
            entry!(cu_memcpy_dtoh_async as CuMemcpyDtoHAsyncFn)
        }
        "cuMemcpyHtoD" | "cuMemcpyHtoD_v2" => entry!(cu_memcpy_htod as CuMemcpyHtoDFn),
        "cuMemcpyHtoDAsync" | "cuMemcpyHtoDAsync_v2" => {
            entry!(cu_memcpy_htod_async as CuMemcpyHtoDAsyncFn)
        }
        "cuMemcpyDtoD" | "cuMemcpyDtoD_v2" => entry!(cu_memcpy_dtod as CuMemcpyFn),
        "cuMemcpyDtoDAsync" | "cuMemcpyDtoDAsync_v2" => {
            entry!(cu_memcpy_dtod_async as CuMemcpyAsyncFn)
        }
        _ => return None,
    };
    Some(ptr)
}

/// Block until this process may submit work to the GPU.
fn gate(agent: &Agent) {
    if let Err(e) = agent.client.continue_with_lock() {
        agent::die(e);
    }
}

fn both() -> Option<(&'static Agent, &'static driver::Driver)> {
    Some((agent::get()?, driver::get()?))
}

/// Interposed dynamic symbol lookup. Driver API queries are redirected
/// to the agent's replacements; everything else goes to the real
/// `dlsym`.
#[no_mangle]
pub unsafe extern "C" fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    if !symbol.is_null() {
        if let Ok(name) = CStr::from_ptr(symbol).to_str() {
            if name.starts_with("cu") {
                if let Some(hooked) = hooked_entry(name) {
                    return hooked;
                }
            }
        }
    }
    driver::real_dlsym(handle, symbol)
}

/// Runtimes 11.3+ call this before `cuInit`, so it doubles as an agent
/// bootstrap point.
#[export_name = "cuGetProcAddress"]
pub unsafe extern "C" fn cu_get_proc_address(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    flags: u64,
) -> CUresult {
    agent::init_runtime();
    agent::init_client();

    let Some(drv) = driver::get() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    let Some(real) = drv.cu_get_proc_address else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };

    if !symbol.is_null() && !pfn.is_null() {
        if let Ok(name) = CStr::from_ptr(symbol).to_str() {
            if let Some(hooked) = hooked_entry(name) {
                *pfn = hooked;
                return CUDA_SUCCESS;
            }
        }
    }
    real(symbol, pfn, cuda_version, flags)
}

/// The versioned variant of the procedure-address query.
#[export_name = "cuGetProcAddress_v2"]
pub unsafe extern "C" fn cu_get_proc_address_v2(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    flags: u64,
    symbol_status: *mut c_int,
) -> CUresult {
    agent::init_runtime();
    agent::init_client();

    let Some(drv) = driver::get() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    let Some(real) = drv.cu_get_proc_address_v2 else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };

    if !symbol.is_null() && !pfn.is_null() {
        if let Ok(name) = CStr::from_ptr(symbol).to_str() {
            if let Some(hooked) = hooked_entry(name) {
                *pfn = hooked;
                if !symbol_status.is_null() {
                    *symbol_status = CU_GET_PROC_ADDRESS_SUCCESS;
                }
                return CUDA_SUCCESS;
            }
        }
    }
    real(symbol, pfn, cuda_version, flags, symbol_status)
}

/// A call to `cuInit` is the proof that this process is a GPU client;
/// it triggers the full agent bootstrap, idempotently.
#[export_name = "cuInit"]
pub unsafe extern "C" fn cu_init(flags: c_uint) -> CUresult {
    agent::init_runtime();
    agent::init_client();

    let Some(drv) = driver::get() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    let result = (drv.cu_init)(flags);
    cuda_check(drv, result, "cuInit");
    result
}

/// Allocation, diverted to unified memory and guarded by the ledger.
#[export_name = "cuMemAlloc_v2"]
pub unsafe extern "C" fn cu_mem_alloc(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };

    let capacity = match agent.capacity.get() {
        Some(&capacity) => capacity,
        None => {
            let mut free = 0usize;
            let mut total = 0usize;
            // Through our own memory-info, so the reserve is already
            // hidden.
            let result = cu_mem_get_info(&mut free, &mut total);
            if result != CUDA_SUCCESS {
                tracing::warn!(
                    "Could not learn GPU memory capacity; allocations will be refused"
                );
            }
            *agent.capacity.get_or_init(|| free as u64)
        }
    };

    if !agent
        .ledger
        .lock()
        .expect("ledger mutex poisoned")
        .admits(bytesize as u64, capacity)
    {
        if !agent.config.oversubscribe {
            return CUDA_ERROR_OUT_OF_MEMORY;
        }
        tracing::warn!(
            "Memory allocations exceeded physical GPU memory capacity. \
             This can cause extreme performance degradation!"
        );
    }

    tracing::debug!("cuMemAlloc requested {bytesize} bytes");
    let result = (drv.cu_mem_alloc_managed)(dptr, bytesize, CU_MEM_ATTACH_GLOBAL);
    cuda_check(drv, result, "cuMemAllocManaged");
    if result == CUDA_SUCCESS && !dptr.is_null() {
        tracing::debug!("cuMemAllocManaged allocated {bytesize} bytes at {:#x}", *dptr);
        agent
            .ledger
            .lock()
            .expect("ledger mutex poisoned")
            .record(*dptr, bytesize as u64);
    }
    result
}

#[export_name = "cuMemFree_v2"]
pub unsafe extern "C" fn cu_mem_free(dptr: CUdeviceptr) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    let result = (drv.cu_mem_free)(dptr);
    if result == CUDA_SUCCESS {
        agent
            .ledger
            .lock()
            .expect("ledger mutex poisoned")
            .release(dptr);
    }
    result
}

/// Memory info, with a fixed reserve hidden from the application. CUDA
/// keeps context data in physical, non-pageable memory; reporting it as
/// free would let applications size themselves into thrashing against
/// their own context.
#[export_name = "cuMemGetInfo_v2"]
pub unsafe extern "C" fn cu_mem_get_info(free: *mut usize, total: *mut usize) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    let result = (drv.cu_mem_get_info)(free, total);
    cuda_check(drv, result, "cuMemGetInfo");
    if result == CUDA_SUCCESS && !free.is_null() && !total.is_null() {
        tracing::debug!(
            "Driver reports free = {:.2} MiB, total = {:.2} MiB",
            mib(*free),
            mib(*total)
        );
        *free = (*total).saturating_sub(agent.config.meminfo_reserve_bytes as usize);
        tracing::debug!(
            "Reporting free = {:.2} MiB, total = {:.2} MiB",
            mib(*free),
            mib(*total)
        );
    }
    result
}

#[export_name = "cuLaunchKernel"]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn cu_launch_kernel(
    f: CUfunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };

    gate(agent);
    let result = (drv.cu_launch_kernel)(
        f,
        grid_dim_x,
        grid_dim_y,
        grid_dim_z,
        block_dim_x,
        block_dim_y,
        block_dim_z,
        shared_mem_bytes,
        h_stream,
        kernel_params,
        extra,
    );
    cuda_check(drv, result, "cuLaunchKernel");

    // Periodic drain so the in-flight backlog stays releasable within a
    // bounded time when the scheduler asks for the lock back.
    let mut window = agent.window.lock().expect("window mutex poisoned");
    if window.note_launch() {
        let started = Instant::now();
        let sync = (drv.cu_ctx_synchronize)();
        cuda_check(drv, sync, "cuCtxSynchronize");
        window.note_sync(started.elapsed());
        tracing::debug!("Pending kernel window is {}", window.window());
    }

    result
}

// Memory copies move pages onto and off the GPU, so they are gated the
// same way kernel launches are.

#[export_name = "cuMemcpy"]
pub unsafe extern "C" fn cu_memcpy(dst: CUdeviceptr, src: CUdeviceptr, byte_count: usize) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    gate(agent);
    let result = (drv.cu_memcpy)(dst, src, byte_count);
    cuda_check(drv, result, "cuMemcpy");
    result
}

#[export_name = "cuMemcpyAsync"]
pub unsafe extern "C" fn cu_memcpy_async(
    dst: CUdeviceptr,
    src: CUdeviceptr,
    byte_count: usize,
    h_stream: CUstream,
) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    gate(agent);
    let result = (drv.cu_memcpy_async)(dst, src, byte_count, h_stream);
    cuda_check(drv, result, "cuMemcpyAsync");
    result
}

#[export_name = "cuMemcpyDtoH_v2"]
pub unsafe extern "C" fn cu_memcpy_dtoh(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    gate(agent);
    let result = (drv.cu_memcpy_dtoh)(dst_host, src_device, byte_count);
    cuda_check(drv, result, "cuMemcpyDtoH");
    result
}

#[export_name = "cuMemcpyDtoHAsync_v2"]
pub unsafe extern "C" fn cu_memcpy_dtoh_async(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
    h_stream: CUstream,
) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    gate(agent);
    let result = (drv.cu_memcpy_dtoh_async)(dst_host, src_device, byte_count, h_stream);
    cuda_check(drv, result, "cuMemcpyDtoHAsync");
    result
}

#[export_name = "cuMemcpyHtoD_v2"]
pub unsafe extern "C" fn cu_memcpy_htod(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    gate(agent);
    let result = (drv.cu_memcpy_htod)(dst_device, src_host, byte_count);
    cuda_check(drv, result, "cuMemcpyHtoD");
    result
}

#[export_name = "cuMemcpyHtoDAsync_v2"]
pub unsafe extern "C" fn cu_memcpy_htod_async(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
    h_stream: CUstream,
) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    gate(agent);
    let result = (drv.cu_memcpy_htod_async)(dst_device, src_host, byte_count, h_stream);
    cuda_check(drv, result, "cuMemcpyHtoDAsync");
    result
}

#[export_name = "cuMemcpyDtoD_v2"]
pub unsafe extern "C" fn cu_memcpy_dtod(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    gate(agent);
    let result = (drv.cu_memcpy_dtod)(dst_device, src_device, byte_count);
    cuda_check(drv, result, "cuMemcpyDtoD");
    result
}

#[export_name = "cuMemcpyDtoDAsync_v2"]
pub unsafe extern "C" fn cu_memcpy_dtod_async(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
    h_stream: CUstream,
) -> CUresult {
    let Some((agent, drv)) = both() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    gate(agent);
    let result = (drv.cu_memcpy_dtod_async)(dst_device, src_device, byte_count, h_stream);
    cuda_check(drv, result, "cuMemcpyDtoDAsync");
    result
}

fn mib(bytes: usize) -> f64 {
    bytes as f64 / (1 << 20) as f64
}
