// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Symbols the library provides to loaded Host-Compute objects.
//!
//! Id queries, barriers and the local memory / printf accessors forward to [crate::kernel], so ELF
//! code and native kernels observe the same launch state.  The math entry points are exported
//! under their C names because compilers emit calls to them for builtins.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::imp::host::executor;
use crate::kernel;

/// Data symbol through which loaded code may read the launch geometry directly.
pub(crate) const ID_BLOCK_SYMBOL: &str = "floor_host_compute_id_block";

#[derive(Debug, Clone, Default)]
pub(crate) struct ExternTable {
    entries: HashMap<&'static str, usize>,
}

impl ExternTable {
    pub(crate) fn address(&self, name: &str) -> Option<usize> {
        self.entries.get(name).copied()
    }

    pub(crate) fn insert(&mut self, name: &'static str, address: usize) {
        self.entries.insert(name, address);
    }
}

extern "C" fn global_id(dim: u32) -> u32 {
    kernel::global_id(dim as usize)
}
extern "C" fn local_id(dim: u32) -> u32 {
    kernel::local_id(dim as usize)
}
extern "C" fn group_id(dim: u32) -> u32 {
    kernel::group_id(dim as usize)
}
extern "C" fn global_size(dim: u32) -> u32 {
    kernel::global_size(dim as usize)
}
extern "C" fn local_size(dim: u32) -> u32 {
    kernel::local_size(dim as usize)
}
extern "C" fn group_size(dim: u32) -> u32 {
    kernel::group_count(dim as usize)
}
extern "C" fn work_dim() -> u32 {
    kernel::work_dim()
}
extern "C" fn sub_group_id() -> u32 {
    kernel::sub_group_id()
}
extern "C" fn sub_group_local_id() -> u32 {
    kernel::sub_group_local_id()
}
extern "C" fn sub_group_size() -> u32 {
    kernel::sub_group_size()
}
extern "C" fn num_sub_groups() -> u32 {
    kernel::num_sub_groups()
}
extern "C" fn local_barrier() {
    kernel::barrier()
}
extern "C" fn sub_group_barrier() {
    kernel::sub_group_barrier()
}
extern "C" fn global_barrier() {
    kernel::global_barrier()
}
extern "C" fn local_memory() -> *mut u8 {
    executor::group_memory().0
}
extern "C" fn printf_buffer() -> *mut u8 {
    executor::launch_view()
        .and_then(|view| view.printf)
        .map_or(std::ptr::null_mut(), |target| target.0.as_ptr())
}

extern "C" fn host_memcpy(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    // SAFETY: C memcpy contract
    unsafe { std::ptr::copy_nonoverlapping(src, dst, n) };
    dst
}
extern "C" fn host_memmove(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    // SAFETY: C memmove contract
    unsafe { std::ptr::copy(src, dst, n) };
    dst
}
extern "C" fn host_memset(dst: *mut u8, value: i32, n: usize) -> *mut u8 {
    // SAFETY: C memset contract
    unsafe { std::ptr::write_bytes(dst, value as u8, n) };
    dst
}

macro_rules! unary {
    ($($c:ident => $t:ty, $m:ident;)*) => {
        $(extern "C" fn $c(x: $t) -> $t {
            x.$m()
        })*
    };
}

macro_rules! binary {
    ($($c:ident => $t:ty, $m:ident;)*) => {
        $(extern "C" fn $c(x: $t, y: $t) -> $t {
            x.$m(y)
        })*
    };
}

unary! {
    sinf => f32, sin;
    cosf => f32, cos;
    tanf => f32, tan;
    asinf => f32, asin;
    acosf => f32, acos;
    atanf => f32, atan;
    sqrtf => f32, sqrt;
    expf => f32, exp;
    exp2f => f32, exp2;
    logf => f32, ln;
    log2f => f32, log2;
    floorf => f32, floor;
    ceilf => f32, ceil;
    fabsf => f32, abs;
    truncf => f32, trunc;
    roundf => f32, round;
    sin => f64, sin;
    cos => f64, cos;
    tan => f64, tan;
    asin => f64, asin;
    acos => f64, acos;
    atan => f64, atan;
    sqrt => f64, sqrt;
    exp => f64, exp;
    exp2 => f64, exp2;
    log => f64, ln;
    log2 => f64, log2;
    floor => f64, floor;
    ceil => f64, ceil;
    fabs => f64, abs;
    trunc => f64, trunc;
    round => f64, round;
}

binary! {
    powf => f32, powf;
    atan2f => f32, atan2;
    fminf => f32, min;
    fmaxf => f32, max;
    pow => f64, powf;
    atan2 => f64, atan2;
    fmin => f64, min;
    fmax => f64, max;
}

extern "C" fn fmodf(x: f32, y: f32) -> f32 {
    x % y
}
extern "C" fn fmod(x: f64, y: f64) -> f64 {
    x % y
}
extern "C" fn fmaf(x: f32, y: f32, z: f32) -> f32 {
    x.mul_add(y, z)
}
extern "C" fn fma(x: f64, y: f64, z: f64) -> f64 {
    x.mul_add(y, z)
}

macro_rules! table {
    ($($name:literal => $f:expr),* $(,)?) => {{
        let mut table = ExternTable::default();
        $(table.insert($name, $f as usize);)*
        table
    }};
}

/// The symbols every instance is linked against.
pub(crate) fn host_externs() -> &'static ExternTable {
    static TABLE: OnceLock<ExternTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        table! {
            "floor_host_compute_global_id_get" => global_id,
            "floor_host_compute_local_id_get" => local_id,
            "floor_host_compute_group_id_get" => group_id,
            "floor_host_compute_global_size_get" => global_size,
            "floor_host_compute_local_size_get" => local_size,
            "floor_host_compute_group_size_get" => group_size,
            "floor_host_compute_work_dim_get" => work_dim,
            "floor_host_compute_sub_group_id_get" => sub_group_id,
            "floor_host_compute_sub_group_local_id_get" => sub_group_local_id,
            "floor_host_compute_sub_group_size_get" => sub_group_size,
            "floor_host_compute_num_sub_groups_get" => num_sub_groups,
            "floor_host_compute_local_barrier" => local_barrier,
            "floor_host_compute_sub_group_barrier" => sub_group_barrier,
            "floor_host_compute_global_barrier" => global_barrier,
            "floor_host_compute_local_memory_get" => local_memory,
            "floor_host_compute_printf_buffer_get" => printf_buffer,
            "memcpy" => host_memcpy,
            "memmove" => host_memmove,
            "memset" => host_memset,
            "sinf" => sinf,
            "cosf" => cosf,
            "tanf" => tanf,
            "asinf" => asinf,
            "acosf" => acosf,
            "atanf" => atanf,
            "atan2f" => atan2f,
            "sqrtf" => sqrtf,
            "expf" => expf,
            "exp2f" => exp2f,
            "logf" => logf,
            "log2f" => log2f,
            "powf" => powf,
            "fmodf" => fmodf,
            "fmaf" => fmaf,
            "floorf" => floorf,
            "ceilf" => ceilf,
            "fabsf" => fabsf,
            "truncf" => truncf,
            "roundf" => roundf,
            "fminf" => fminf,
            "fmaxf" => fmaxf,
            "sin" => sin,
            "cos" => cos,
            "tan" => tan,
            "asin" => asin,
            "acos" => acos,
            "atan" => atan,
            "atan2" => atan2,
            "sqrt" => sqrt,
            "exp" => exp,
            "exp2" => exp2,
            "log" => log,
            "log2" => log2,
            "pow" => pow,
            "fmod" => fmod,
            "fma" => fma,
            "floor" => floor,
            "ceil" => ceil,
            "fabs" => fabs,
            "trunc" => trunc,
            "round" => round,
            "fmin" => fmin,
            "fmax" => fmax,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_resolves_accessors_and_libm() {
        let table = host_externs();
        assert!(table.address("floor_host_compute_global_id_get").is_some());
        assert!(table.address("sinf").is_some());
        assert!(table.address("printf").is_none());
        let address = table.address("sqrtf").unwrap();
        // SAFETY: registered from an extern "C" fn(f32) -> f32
        let sqrt: extern "C" fn(f32) -> f32 = unsafe { std::mem::transmute(address) };
        assert_eq!(sqrt(9.0), 3.0);
    }
}
