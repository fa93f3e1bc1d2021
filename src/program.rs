// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Programs and functions.

A [Program] is built once per context from a [ProgramSource] and holds, for every device of the
context, the functions the device can run.  Its function map is read-only after construction.
A [Function] is the cross-device handle the caller launches; it resolves the per-device
[FunctionEntry] from the queue it is executed on.
*/

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;

use crate::argument_buffer::ArgumentBuffer;
use crate::device::{Device, DeviceFeatures, PlatformType};
use crate::error::Error;
use crate::function_info::{FunctionFlags, FunctionInfo, FunctionType};
use crate::memory_flags::MemoryFlags;
use crate::queue::{ExecutionParams, Queue};
use crate::universal_binary::UniversalBinary;

/// Where a program comes from.
#[derive(Debug, Clone)]
pub enum ProgramSource {
    /// Source code for the backend's online compiler (WGSL on the wgpu backend).
    Source {
        code: String,
        options: String,
        functions: Vec<FunctionInfo>,
    },
    /// A precompiled module on disk (SPIR-V, or an ELF relocatable object on Host-Compute).
    Module {
        path: PathBuf,
        functions: Vec<FunctionInfo>,
    },
    /// A universal binary; every device picks its best-matching target.
    UniversalBinary(Arc<UniversalBinary>),
}

impl ProgramSource {
    pub fn universal_binary_file(path: impl Into<PathBuf>) -> Result<Self, Error> {
        Ok(ProgramSource::UniversalBinary(Arc::new(UniversalBinary::load(
            path.into(),
        )?)))
    }
}

/// Per-device record of one function.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub info: Arc<FunctionInfo>,
    pub max_total_local_size: u32,
    pub max_local_size: [u32; 3],
    pub required_simd_width: Option<u32>,
}

impl FunctionEntry {
    /// The entry of `info` on `device`, or `None` when the device can't run it.
    pub fn for_device(info: Arc<FunctionInfo>, device: &Device) -> Option<FunctionEntry> {
        if info.uses_images() && !device.supports(DeviceFeatures::IMAGES) {
            return None;
        }
        if info.flags.contains(FunctionFlags::USES_GLOBAL_BARRIER)
            && !device.supports(DeviceFeatures::COOPERATIVE_KERNELS)
        {
            return None;
        }
        let (max_total_local_size, max_local_size) = match info.required_local_size {
            Some(required) => (required.iter().map(|c| (*c).max(1)).product(), required),
            None => (device.max_total_local_size, device.max_local_size),
        };
        Some(FunctionEntry {
            required_simd_width: info.required_simd_width,
            info,
            max_total_local_size,
            max_local_size,
        })
    }
}

pub trait Function: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn function_type(&self) -> FunctionType;
    /// Info of the function; identical on every device that carries it.
    fn info(&self) -> &Arc<FunctionInfo>;
    fn entry(&self, device: &Device) -> Option<&FunctionEntry>;
    fn platform_type(&self) -> PlatformType;

    fn execute(&self, queue: &dyn Queue, params: ExecutionParams<'_>) -> Result<(), Error>;

    /// Creates the argument buffer for argument `arg_index` of this function.
    fn create_argument_buffer(
        &self,
        queue: &dyn Queue,
        arg_index: usize,
        extra_flags: MemoryFlags,
        zero_init: bool,
    ) -> Result<Arc<ArgumentBuffer>, Error>;

    fn as_any(&self) -> &dyn Any;
}

pub trait Program: Send + Sync + Debug {
    fn function(&self, name: &str) -> Option<Arc<dyn Function>>;
    /// Names of all functions available on at least one device, sorted.
    fn function_names(&self) -> Vec<String>;
    fn platform_type(&self) -> PlatformType;
    fn as_any(&self) -> &dyn Any;
}

/// The union of function names over per-device entry maps, sorted.
pub(crate) fn union_function_names<'a, V: 'a>(
    per_device: impl IntoIterator<Item = &'a HashMap<String, V>>,
) -> Vec<String> {
    per_device
        .into_iter()
        .flat_map(|m| m.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Key of a specialized pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecializationKey {
    pub local_size: [u32; 3],
    pub simd_width: u32,
}

/// Lazily created specializations of one function entry.
///
/// Creation runs outside the lock; when two threads race, the first insertion wins and both
/// get the same value.
#[derive(Debug)]
pub struct SpecializationCache<K = SpecializationKey, V = ()> {
    entries: spin::Mutex<HashMap<K, V>>,
}

impl<K, V> Default for SpecializationCache<K, V> {
    fn default() -> Self {
        SpecializationCache {
            entries: spin::Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> SpecializationCache<K, V> {
    pub fn get_or_try_insert(
        &self,
        key: K,
        create: impl FnOnce() -> Result<V, Error>,
    ) -> Result<V, Error> {
        if let Some(value) = self.entries.lock().get(&key) {
            return Ok(value.clone());
        }
        let value = create()?;
        Ok(self.entries.lock().entry(key).or_insert(value).clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_info::{ArgAccess, ArgInfo};
    use crate::image_type::ImageType;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn specialization_is_idempotent() {
        let cache: SpecializationCache<SpecializationKey, u32> = SpecializationCache::default();
        let created = AtomicU32::new(0);
        let key = SpecializationKey {
            local_size: [64, 1, 1],
            simd_width: 32,
        };
        for _ in 0..3 {
            let v = cache
                .get_or_try_insert(key, || Ok(created.fetch_add(1, Ordering::Relaxed) + 10))
                .unwrap();
            assert_eq!(v, 10);
        }
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert!(
            cache
                .get_or_try_insert(
                    SpecializationKey {
                        local_size: [1, 1, 1],
                        simd_width: 1
                    },
                    || Err(Error::invalid("no"))
                )
                .is_err()
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn image_functions_need_image_support() {
        let info = Arc::new(FunctionInfo::kernel(
            "sample",
            vec![ArgInfo::image(ImageType::IMAGE_2D | ImageType::RGBA8, ArgAccess::Read)],
        ));
        let mut device = Device::template(PlatformType::Host, 0);
        assert!(FunctionEntry::for_device(info.clone(), &device).is_none());
        device.features |= DeviceFeatures::IMAGES;
        device.max_total_local_size = 1024;
        let entry = FunctionEntry::for_device(info, &device).unwrap();
        assert_eq!(entry.max_total_local_size, 1024);

        let fixed = Arc::new(FunctionInfo::kernel("f", Vec::new()).with_required_local_size([8, 8, 1]));
        let entry = FunctionEntry::for_device(fixed, &device).unwrap();
        assert_eq!(entry.max_total_local_size, 64);
    }

    #[test]
    fn names_are_a_sorted_union() {
        let mut a = HashMap::new();
        a.insert("b".to_string(), ());
        a.insert("a".to_string(), ());
        let mut b = HashMap::new();
        b.insert("c".to_string(), ());
        b.insert("a".to_string(), ());
        assert_eq!(union_function_names([&a, &b]), vec!["a", "b", "c"]);
    }
}
