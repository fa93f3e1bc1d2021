// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Describes the CPU as a Host-Compute device.

use crate::device::{Device, DeviceFeatures, DeviceType, PlatformType, Vendor};

const LOCAL_MEMORY_SIZE: u64 = 256 * 1024;
const MAX_TOTAL_LOCAL_SIZE: u32 = 1024;
const FALLBACK_MEMORY: u64 = 4 << 30;

/// Name and vendor as reported by the OS, if it tells.
fn cpu_identity() -> (Option<String>, Option<String>) {
    let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
        return (None, None);
    };
    let field = |key: &str| {
        cpuinfo.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            (name.trim() == key).then(|| value.trim().to_string())
        })
    };
    (field("model name"), field("vendor_id"))
}

fn meminfo(key: &str) -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        let kib = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok()?;
        Some(kib * 1024)
    })
}

fn total_memory() -> u64 {
    meminfo("MemTotal").unwrap_or(FALLBACK_MEMORY)
}

/// Bytes of system memory currently in use, if the OS tells.
pub(crate) fn used_memory() -> Option<u64> {
    let total = meminfo("MemTotal")?;
    let available = meminfo("MemAvailable")?;
    Some(total.saturating_sub(available))
}

/// Lanes of 32-bit values in the widest vector unit available.
fn simd_width() -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx512f") {
            return 16;
        }
        if std::arch::is_x86_feature_detected!("avx2") || std::arch::is_x86_feature_detected!("avx") {
            return 8;
        }
    }
    4
}

/// The Host-Compute device for this machine.
pub(crate) fn discover(index: u32) -> Device {
    let (model, vendor_id) = cpu_identity();
    let name = model.unwrap_or_else(|| format!("{} CPU", std::env::consts::ARCH));
    let vendor_name = vendor_id.unwrap_or_else(|| name.clone());
    let cores = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1);
    let memory = total_memory();
    let simd = simd_width();

    let mut device = Device::template(PlatformType::Host, index);
    device.device_type = DeviceType::Cpu;
    device.vendor = match vendor_id_tag(&vendor_name) {
        Vendor::Unknown => Vendor::from_name(&name),
        vendor => vendor,
    };
    device.name = name;
    device.vendor_name = vendor_name;
    device.driver_version = env!("CARGO_PKG_VERSION").to_string();
    device.pointer_width = (std::mem::size_of::<usize>() * 8) as u32;
    device.compute_units = cores;
    device.simd_width = simd;
    device.simd_range = (1, simd);
    device.global_mem_size = memory;
    device.local_mem_size = LOCAL_MEMORY_SIZE;
    device.constant_mem_size = memory;
    device.max_mem_alloc = memory;
    device.max_total_local_size = MAX_TOTAL_LOCAL_SIZE;
    device.max_local_size = [MAX_TOTAL_LOCAL_SIZE; 3];
    device.max_image_1d_dim = 16384;
    device.max_image_2d_dim = [16384, 16384];
    device.max_image_3d_dim = [2048, 2048, 2048];
    device.max_image_cube_dim = 16384;
    device.max_inline_uniform_block_size = u32::MAX;
    device.features = DeviceFeatures::IMAGES
        | DeviceFeatures::DOUBLE
        | DeviceFeatures::UNIFIED_MEMORY
        | DeviceFeatures::BASIC_64_BIT_ATOMICS
        | DeviceFeatures::EXTENDED_64_BIT_ATOMICS
        | DeviceFeatures::SUB_GROUPS
        | DeviceFeatures::INDIRECT_COMPUTE
        | DeviceFeatures::ARGUMENT_BUFFERS
        | DeviceFeatures::COOPERATIVE_KERNELS
        | DeviceFeatures::IMAGE_MIP_MAPS
        | DeviceFeatures::IMAGE_MIP_MAP_WRITE
        | DeviceFeatures::IMAGE_CUBE
        | DeviceFeatures::IMAGE_DEPTH
        | DeviceFeatures::SOFT_PRINTF;
    device
}

/// Maps the `vendor_id` strings of /proc/cpuinfo.
fn vendor_id_tag(vendor_id: &str) -> Vendor {
    match vendor_id {
        "GenuineIntel" => Vendor::Intel,
        "AuthenticAMD" => Vendor::Amd,
        _ => Vendor::from_name(vendor_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_device_is_usable() {
        let device = discover(0);
        assert_eq!(device.platform, PlatformType::Host);
        assert_eq!(device.device_type, DeviceType::Cpu);
        assert!(device.compute_units >= 1);
        assert!([4, 8, 16].contains(&device.simd_width));
        assert!(device.supports(DeviceFeatures::COOPERATIVE_KERNELS | DeviceFeatures::SOFT_PRINTF));
        assert!(!device.supports(DeviceFeatures::RENDERING));
        assert!(!device.name.is_empty());
    }

    #[test]
    fn vendor_ids() {
        assert_eq!(vendor_id_tag("GenuineIntel"), Vendor::Intel);
        assert_eq!(vendor_id_tag("AuthenticAMD"), Vendor::Amd);
        assert_eq!(vendor_id_tag("something else"), Vendor::Unknown);
    }
}
