// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Programs of the wgpu backend.
//!
//! A program is compiled once per bound device: WGSL source directly, SPIR-V modules and
//! universal-binary entries through naga's SPIR-V front end.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::device::PlatformType;
use crate::error::Error;
use crate::function_info::FunctionInfo;
use crate::imp::wgpu::bound_device::BoundDevice;
use crate::imp::wgpu::error::scoped;
use crate::imp::wgpu::function::{Allocator, DeviceFunction, WgpuFunction};
use crate::program::{Function, FunctionEntry, Program, ProgramSource, union_function_names};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Code for one device, before compilation.
enum DeviceCode {
    Wgsl(String),
    SpirV(Vec<u8>),
}

impl DeviceCode {
    fn compile(&self, bound: &BoundDevice, label: &str) -> Result<wgpu::ShaderModule, Error> {
        let source = match self {
            DeviceCode::Wgsl(code) => wgpu::ShaderSource::Wgsl(code.as_str().into()),
            DeviceCode::SpirV(code) => {
                if code.len() % 4 != 0 || code.len() < 20 {
                    return Err(Error::InvalidBinary(format!(
                        "SPIR-V module of {} bytes is truncated",
                        code.len()
                    )));
                }
                let magic = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
                if magic != SPIRV_MAGIC && magic != SPIRV_MAGIC.swap_bytes() {
                    return Err(Error::InvalidBinary(format!("{magic:#010x} is not the SPIR-V magic")));
                }
                wgpu::util::make_spirv(code)
            }
        };
        scoped(bound.device(), || {
            bound.device().create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source,
            })
        })
    }
}

#[derive(Debug)]
pub struct WgpuProgram {
    platform: PlatformType,
    functions: HashMap<String, Arc<WgpuFunction>>,
}

impl WgpuProgram {
    pub(crate) fn new(
        platform: PlatformType,
        bound: &[Arc<BoundDevice>],
        source: ProgramSource,
        allocator: Allocator,
    ) -> Result<WgpuProgram, Error> {
        let mut per_device: Vec<HashMap<String, DeviceFunction>> = Vec::with_capacity(bound.len());
        for device in bound {
            let (code, functions): (DeviceCode, Vec<Arc<FunctionInfo>>) = match &source {
                ProgramSource::Source { code, functions, .. } => (
                    DeviceCode::Wgsl(code.clone()),
                    functions.iter().cloned().map(Arc::new).collect(),
                ),
                ProgramSource::Module { path, functions } => (
                    DeviceCode::SpirV(std::fs::read(path)?),
                    functions.iter().cloned().map(Arc::new).collect(),
                ),
                ProgramSource::UniversalBinary(binary) => match binary.best_entry_for(device.info()) {
                    Some(entry) => (DeviceCode::SpirV(entry.code.clone()), entry.functions.clone()),
                    None => {
                        logwise::warn_sync!(
                            "wgpu: universal binary has no entry for {device}",
                            device = device.info().to_string()
                        );
                        per_device.push(HashMap::new());
                        continue;
                    }
                },
            };
            let module = code.compile(device, "floor program")?;
            let mut compiled = HashMap::new();
            for info in functions {
                let Some(entry) = FunctionEntry::for_device(info.clone(), device.info()) else {
                    logwise::warn_sync!(
                        "wgpu: \"{name}\" can not run on {device}",
                        name = info.name.clone(),
                        device = device.info().to_string()
                    );
                    continue;
                };
                let function = DeviceFunction::new(device.clone(), entry, module.clone())?;
                compiled.insert(info.name.clone(), function);
            }
            per_device.push(compiled);
        }

        let names = union_function_names(per_device.iter());
        let mut functions = HashMap::new();
        for name in names {
            let devices: Vec<DeviceFunction> = per_device.iter_mut().filter_map(|m| m.remove(&name)).collect();
            let Some(info) = devices.first().map(|f| f.entry.info.clone()) else {
                continue;
            };
            functions.insert(
                name,
                Arc::new(WgpuFunction::new(info, platform, devices, allocator.clone())),
            );
        }
        if functions.is_empty() {
            logwise::warn_sync!("wgpu: program defines no function any device can run");
        }
        Ok(WgpuProgram { platform, functions })
    }
}

impl Program for WgpuProgram {
    fn function(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).map(|f| f.clone() as Arc<dyn Function>)
    }

    fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    fn platform_type(&self) -> PlatformType {
        self.platform
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
