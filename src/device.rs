// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Device descriptors.
//!
//! A [Device] is produced by its owning context during discovery and never changes afterwards.
//! Memory objects, queues and programs hold an `Arc<Device>` to it.

use std::fmt::{Display, Formatter};

/// The backend a context, device or memory object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlatformType {
    Cuda,
    Metal,
    Vulkan,
    OpenCl,
    Host,
}

impl PlatformType {
    /// Parses the names accepted by `FLOOR_BACKEND`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cuda" => Some(PlatformType::Cuda),
            "metal" => Some(PlatformType::Metal),
            "vulkan" => Some(PlatformType::Vulkan),
            "opencl" => Some(PlatformType::OpenCl),
            "host" | "host-compute" | "host_compute" => Some(PlatformType::Host),
            _ => None,
        }
    }
}

impl Display for PlatformType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlatformType::Cuda => "CUDA",
            PlatformType::Metal => "Metal",
            PlatformType::Vulkan => "Vulkan",
            PlatformType::OpenCl => "OpenCL",
            PlatformType::Host => "Host-Compute",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    IntegratedGpu,
    DiscreteGpu,
    Virtual,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Arm,
    Qualcomm,
    Unknown,
}

impl Vendor {
    /// Maps a PCI vendor id to a vendor tag.
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10de => Vendor::Nvidia,
            0x1002 | 0x1022 => Vendor::Amd,
            0x8086 => Vendor::Intel,
            0x106b => Vendor::Apple,
            0x13b5 => Vendor::Arm,
            0x5143 => Vendor::Qualcomm,
            _ => Vendor::Unknown,
        }
    }

    pub(crate) fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("intel") {
            Vendor::Intel
        } else if name.contains("amd") {
            Vendor::Amd
        } else if name.contains("apple") {
            Vendor::Apple
        } else if name.contains("arm") {
            Vendor::Arm
        } else if name.contains("nvidia") {
            Vendor::Nvidia
        } else if name.contains("qualcomm") {
            Vendor::Qualcomm
        } else {
            Vendor::Unknown
        }
    }
}

bitflags::bitflags! {
    /// Optional capabilities a device may advertise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFeatures: u32 {
        const IMAGES = 1 << 0;
        const DOUBLE = 1 << 1;
        const UNIFIED_MEMORY = 1 << 2;
        const BASIC_64_BIT_ATOMICS = 1 << 3;
        const EXTENDED_64_BIT_ATOMICS = 1 << 4;
        const SUB_GROUPS = 1 << 5;
        const INDIRECT_COMPUTE = 1 << 6;
        const INDIRECT_RENDER = 1 << 7;
        const ARGUMENT_BUFFERS = 1 << 8;
        const TESSELLATION = 1 << 9;
        const COOPERATIVE_KERNELS = 1 << 10;
        const HEAP_ALLOCATION = 1 << 11;
        const IMAGE_MIP_MAPS = 1 << 12;
        const IMAGE_MIP_MAP_WRITE = 1 << 13;
        const IMAGE_CUBE = 1 << 14;
        const IMAGE_MSAA = 1 << 15;
        const IMAGE_DEPTH = 1 << 16;
        const RENDERING = 1 << 17;
        const SOFT_PRINTF = 1 << 18;
    }
}

/// Immutable description of one device.
#[derive(Debug, Clone)]
pub struct Device {
    pub platform: PlatformType,
    /// Index within the owning context; with `platform` this identifies the device.
    pub index: u32,
    pub device_type: DeviceType,
    pub vendor: Vendor,
    pub name: String,
    pub vendor_name: String,
    pub driver_version: String,
    /// Byte width of device pointers.
    pub pointer_width: u32,
    pub compute_units: u32,
    pub simd_width: u32,
    /// Inclusive range of sub-group sizes the device may run with.
    pub simd_range: (u32, u32),
    pub global_mem_size: u64,
    pub local_mem_size: u64,
    pub constant_mem_size: u64,
    pub max_mem_alloc: u64,
    pub max_total_local_size: u32,
    pub max_local_size: [u32; 3],
    pub max_work_groups: [u32; 3],
    pub max_image_1d_dim: u32,
    pub max_image_2d_dim: [u32; 2],
    pub max_image_3d_dim: [u32; 3],
    pub max_image_cube_dim: u32,
    pub image_mip_level_limit: u32,
    /// Largest plain-data argument that is placed inline instead of in a constant buffer.
    pub max_inline_uniform_block_size: u32,
    pub features: DeviceFeatures,
    /// Cross-backend identity, when the backend exposes one.
    pub uuid: Option<[u8; 16]>,
}

impl Device {
    pub fn supports(&self, features: DeviceFeatures) -> bool {
        self.features.contains(features)
    }

    /// Whether this device passes a user whitelist.
    ///
    /// An empty whitelist admits everything; otherwise one entry must be a case-insensitive
    /// substring of the device name (or the vendor name).
    pub fn matches_whitelist(&self, whitelist: &[String]) -> bool {
        if whitelist.is_empty() {
            return true;
        }
        let name = self.name.to_ascii_lowercase();
        let vendor = self.vendor_name.to_ascii_lowercase();
        whitelist.iter().any(|entry| {
            let entry = entry.trim().to_ascii_lowercase();
            !entry.is_empty() && (name.contains(&entry) || vendor.contains(&entry))
        })
    }

    /// Two devices from different contexts refer to the same hardware.
    pub fn is_same_hardware(&self, other: &Device) -> bool {
        match (self.uuid, other.uuid) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// A device with conservative defaults, used as a starting point by backends.
    pub(crate) fn template(platform: PlatformType, index: u32) -> Self {
        Device {
            platform,
            index,
            device_type: DeviceType::Other,
            vendor: Vendor::Unknown,
            name: String::new(),
            vendor_name: String::new(),
            driver_version: String::new(),
            pointer_width: 8,
            compute_units: 1,
            simd_width: 1,
            simd_range: (1, 1),
            global_mem_size: 0,
            local_mem_size: 0,
            constant_mem_size: 0,
            max_mem_alloc: 0,
            max_total_local_size: 1,
            max_local_size: [1, 1, 1],
            max_work_groups: [u32::MAX, u32::MAX, u32::MAX],
            max_image_1d_dim: 0,
            max_image_2d_dim: [0, 0],
            max_image_3d_dim: [0, 0, 0],
            max_image_cube_dim: 0,
            image_mip_level_limit: crate::image_type::DEFAULT_MIP_LEVEL_LIMIT,
            max_inline_uniform_block_size: 0,
            features: DeviceFeatures::empty(),
            uuid: None,
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.platform == other.platform && self.index == other.index
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.platform.hash(state);
        self.index.hash(state);
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} #{} ({})", self.platform, self.index, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist() {
        let mut device = Device::template(PlatformType::Host, 0);
        device.name = "AMD Ryzen 9 7950X".to_string();
        device.vendor_name = "AuthenticAMD".to_string();
        assert!(device.matches_whitelist(&[]));
        assert!(device.matches_whitelist(&["ryzen".to_string()]));
        assert!(device.matches_whitelist(&["nvidia".to_string(), "authenticamd".to_string()]));
        assert!(!device.matches_whitelist(&["nvidia".to_string()]));
        assert!(!device.matches_whitelist(&[" ".to_string()]));
    }

    #[test]
    fn platform_names() {
        assert_eq!(PlatformType::from_name("Vulkan"), Some(PlatformType::Vulkan));
        assert_eq!(PlatformType::from_name(" host "), Some(PlatformType::Host));
        assert_eq!(PlatformType::from_name("d3d"), None);
        assert_eq!(PlatformType::Host.to_string(), "Host-Compute");
    }
}
