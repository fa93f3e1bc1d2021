// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The device-side API of the Host-Compute backend.

Kernels registered with [crate::imp::host::HostProgramBuilder] are ordinary Rust closures; while
one of them runs, the functions in this module describe the work-item it runs as:

```no_run
use floor::kernel;

fn body(args: &kernel::KernelArgs) {
    let data = args.buffer(0);
    let i = kernel::global_id(0) as usize;
    data.set::<u32>(i, data.get::<u32>(i) + 1);
    kernel::barrier();
}
```

Called outside of a launch, ids read as 0 and sizes as 1.

Kernel code is expected to stay within its bounds the way GPU code is: the views below panic on
out-of-bounds access, and the panic fails the launch.
*/

use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use bytemuck::Pod;

use crate::binding::{ADDRESS_SIZE, IMAGE_PARAMS_SIZE, ImageParams, ParamBlob};
use crate::function_info::{ArgKind, FunctionInfo};
use crate::image_type::ImageType;
use crate::imp::host::buffer::lookup_allocation;
use crate::imp::host::executor::{self, BarrierKind};
use crate::imp::host::image::LodTable;
use crate::soft_printf::PrintfBuffer;

fn dimension<R>(dim: usize, default: R, f: impl FnOnce(&executor::LaunchView, &executor::ItemState) -> R) -> R {
    if dim >= 3 {
        return default;
    }
    executor::with_item(f).unwrap_or(default)
}

pub fn global_id(dim: usize) -> u32 {
    dimension(dim, 0, |view, item| item.global_id(&view.shape, dim))
}

pub fn local_id(dim: usize) -> u32 {
    dimension(dim, 0, |_, item| item.local_id[dim])
}

pub fn group_id(dim: usize) -> u32 {
    dimension(dim, 0, |_, item| item.group_id[dim])
}

pub fn global_size(dim: usize) -> u32 {
    dimension(dim, 1, |view, _| view.shape.global[dim])
}

pub fn local_size(dim: usize) -> u32 {
    dimension(dim, 1, |view, _| view.shape.local[dim])
}

/// Number of work-groups in dimension `dim`.
pub fn group_count(dim: usize) -> u32 {
    dimension(dim, 1, |view, _| view.shape.groups[dim])
}

pub fn work_dim() -> u32 {
    executor::launch_view().map_or(1, |view| view.shape.dim)
}

pub fn sub_group_id() -> u32 {
    executor::with_item(|view, item| item.linear_local / view.shape.simd_width()).unwrap_or(0)
}

pub fn sub_group_local_id() -> u32 {
    executor::with_item(|view, item| item.linear_local % view.shape.simd_width()).unwrap_or(0)
}

pub fn sub_group_size() -> u32 {
    executor::launch_view().map_or(1, |view| view.shape.simd_width())
}

pub fn num_sub_groups() -> u32 {
    executor::launch_view().map_or(1, |view| {
        (view.shape.group_size() as u32).div_ceil(view.shape.simd_width())
    })
}

/// Waits until every item of the work-group reached this barrier.
///
/// Only valid in functions flagged `USES_BARRIERS`; elsewhere it returns at once and the launch
/// fails with a backend error.
pub fn barrier() {
    executor::barrier(BarrierKind::Local);
}

pub fn sub_group_barrier() {
    executor::barrier(BarrierKind::SubGroup);
}

/// Waits until every item of the grid reached this barrier (cooperative launches only).
pub fn global_barrier() {
    executor::barrier(BarrierKind::Global);
}

/// The work-group's local memory, zeroed at the start of every group.
pub fn local_memory() -> LocalMemory {
    let (ptr, len) = executor::group_memory();
    LocalMemory { ptr, len }
}

/// Appends a soft-printf record; `args` are 32-bit slots as described in [crate::soft_printf].
///
/// Returns false when the function doesn't use soft printf or the buffer is full.
pub fn printf(format: &str, args: &[u32]) -> bool {
    let Some(target) = executor::launch_view().and_then(|view| view.printf) else {
        logwise::warn_sync!(
            "printf from a function without USES_SOFT_PRINTF: {format}",
            format = format.to_string()
        );
        return false;
    };
    // SAFETY: the printf buffer outlives the launch and is only appended to while it runs
    let appended = unsafe { PrintfBuffer::append(target.0.as_ptr(), format, args) };
    if !appended {
        logwise::warn_sync!("printf buffer full, record dropped");
    }
    appended
}

fn element<T>(ptr: *mut u8, len: usize, index: usize) -> *mut u8 {
    let size = std::mem::size_of::<T>();
    match index.checked_mul(size).and_then(|offset| offset.checked_add(size)) {
        Some(end) if end <= len => ptr.wrapping_add(index * size),
        _ => panic!("index {index} out of bounds for {len} bytes of {}", std::any::type_name::<T>()),
    }
}

/// Shared memory of one work-group.
#[derive(Debug, Clone, Copy)]
pub struct LocalMemory {
    ptr: *mut u8,
    len: usize,
}

impl LocalMemory {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get<T: Pod>(&self, index: usize) -> T {
        // SAFETY: element checked the bounds
        unsafe { element::<T>(self.ptr, self.len, index).cast::<T>().read_unaligned() }
    }

    pub fn set<T: Pod>(&self, index: usize, value: T) {
        // SAFETY: element checked the bounds
        unsafe { element::<T>(self.ptr, self.len, index).cast::<T>().write_unaligned(value) }
    }

    /// The `index`-th u32 of the arena as an atomic.
    pub fn atomic_u32(&self, index: usize) -> &AtomicU32 {
        // SAFETY: the arena is 16-byte aligned, so every u32 slot is aligned
        unsafe { &*element::<u32>(self.ptr, self.len, index).cast::<AtomicU32>() }
    }
}

/// A buffer parameter as seen by kernel code.
#[derive(Debug, Clone, Copy)]
pub struct BufferView {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: views are only created for memory that stays allocated for the whole launch;
// concurrent access follows the GPU rules (the kernel synchronizes itself)
unsafe impl Send for BufferView {}
unsafe impl Sync for BufferView {}

impl BufferView {
    fn at_address(address: u64) -> BufferView {
        match lookup_allocation(address as usize) {
            Some(len) => BufferView {
                ptr: address as usize as *mut u8,
                len,
            },
            None => BufferView {
                ptr: std::ptr::null_mut(),
                len: 0,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Number of whole `T` elements.
    pub fn count<T>(&self) -> usize {
        self.len / std::mem::size_of::<T>().max(1)
    }

    pub fn get<T: Pod>(&self, index: usize) -> T {
        // SAFETY: element checked the bounds
        unsafe { element::<T>(self.ptr, self.len, index).cast::<T>().read_unaligned() }
    }

    pub fn set<T: Pod>(&self, index: usize, value: T) {
        // SAFETY: element checked the bounds
        unsafe { element::<T>(self.ptr, self.len, index).cast::<T>().write_unaligned(value) }
    }

    pub fn atomic_u32(&self, index: usize) -> &AtomicU32 {
        let ptr = element::<u32>(self.ptr, self.len, index);
        assert!(ptr as usize % 4 == 0, "unaligned atomic access");
        // SAFETY: in bounds and aligned
        unsafe { &*ptr.cast::<AtomicU32>() }
    }
}

/// An image parameter as seen by kernel code.
#[derive(Debug, Clone, Copy)]
pub struct ImageView {
    surface: *mut u8,
    lod: *const LodTable,
    image_type: ImageType,
}

// SAFETY: see BufferView
unsafe impl Send for ImageView {}
unsafe impl Sync for ImageView {}

impl ImageView {
    fn from_params(params: &ImageParams) -> ImageView {
        ImageView {
            surface: params.surface as usize as *mut u8,
            lod: params.lod_buffer as usize as *const LodTable,
            image_type: ImageType::from_bits_truncate(params.runtime_image_type as u64),
        }
    }

    fn table(&self) -> &LodTable {
        assert!(!self.lod.is_null(), "image parameter was not bound");
        // SAFETY: the table is owned by the image, which outlives the launch
        unsafe { &*self.lod }
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn level_count(&self) -> u32 {
        self.table().level_count
    }

    /// `[width, height, depth, layers]` of mip `level`.
    pub fn extent(&self, level: u32) -> [u32; 4] {
        let table = self.table();
        assert!(level < table.level_count, "mip level {level} out of range");
        table.levels[level as usize].extent
    }

    fn texel(&self, coord: [u32; 4], level: u32) -> &mut [u8] {
        let table = self.table();
        assert!(level < table.level_count, "mip level {level} out of range");
        let lod = &table.levels[level as usize];
        let [w, h, d, layers] = lod.extent;
        assert!(
            coord[0] < w && coord[1] < h && coord[2] < d && coord[3] < layers,
            "texel {coord:?} out of bounds for {:?}",
            lod.extent
        );
        let bpp = self.image_type.bytes_per_pixel() as usize;
        let index = (((coord[3] as usize * d as usize + coord[2] as usize) * h as usize + coord[1] as usize)
            * w as usize)
            + coord[0] as usize;
        // SAFETY: the mip chain is one contiguous allocation described by the table
        unsafe {
            std::slice::from_raw_parts_mut(self.surface.add(lod.offset as usize + index * bpp), bpp)
        }
    }

    /// Reads the texel at `[x, y, z, layer]`, converted to RGBA floats.
    pub fn read(&self, coord: [u32; 4], level: u32) -> [f32; 4] {
        self.image_type
            .decode_texel(self.texel(coord, level))
            .unwrap_or([0.0, 0.0, 0.0, 1.0])
    }

    pub fn write(&self, coord: [u32; 4], level: u32, value: [f32; 4]) {
        let image_type = self.image_type;
        if image_type.encode_texel(value, self.texel(coord, level)).is_none() {
            logwise::error_sync!(
                "image write: unsupported format {image_type}",
                image_type = logwise::privacy::LogIt(&image_type)
            );
        }
    }
}

/// An argument buffer parameter: a parameter blob for `layout` in device memory.
#[derive(Debug, Clone)]
pub struct ArgumentBufferView {
    storage: BufferView,
    layout: Arc<FunctionInfo>,
}

impl ArgumentBufferView {
    fn field(&self, index: usize) -> (ArgKind, usize) {
        let mut offset = 0;
        for (n, param) in self.layout.args.iter().filter(|a| a.kind.is_user_supplied()).enumerate() {
            if n == index {
                return (param.kind, offset);
            }
            offset += ParamBlob::param_size(param);
        }
        panic!("argument buffer field {index} out of range for {}", self.layout.name);
    }

    pub fn value<T: Pod>(&self, index: usize) -> T {
        let (_, offset) = self.field(index);
        let bytes = self.storage.len.saturating_sub(offset);
        assert!(bytes >= std::mem::size_of::<T>(), "argument buffer field {index} out of bounds");
        // SAFETY: checked above
        unsafe { self.storage.ptr.add(offset).cast::<T>().read_unaligned() }
    }

    pub fn buffer(&self, index: usize) -> BufferView {
        let (kind, _) = self.field(index);
        assert_eq!(kind, ArgKind::Buffer, "argument buffer field {index} is not a buffer");
        BufferView::at_address(self.value::<u64>(index))
    }

    pub fn image(&self, index: usize) -> ImageView {
        let (kind, _) = self.field(index);
        assert_eq!(kind, ArgKind::Image, "argument buffer field {index} is not an image");
        ImageView::from_params(&self.value::<ImageParams>(index))
    }
}

#[derive(Debug, Clone)]
enum ArgView {
    Data(Vec<u8>),
    Buffer(BufferView),
    Buffers(Vec<BufferView>),
    Image(ImageView),
    Images(Vec<ImageView>),
    ArgumentBuffer(ArgumentBufferView),
}

/// The caller-supplied parameters of a Host-Compute launch.
#[derive(Debug, Clone, Default)]
pub struct KernelArgs {
    args: Vec<ArgView>,
}

impl KernelArgs {
    /// Decodes the parameter blob encoded for `info`.
    pub(crate) fn from_blob(info: &FunctionInfo, blob: &ParamBlob) -> KernelArgs {
        let params = info.args.iter().filter(|a| a.kind.is_user_supplied());
        let mut args = Vec::new();
        for (index, param) in params.enumerate() {
            let bytes = blob.param(index).unwrap_or(&[]);
            let address = |chunk: &[u8]| {
                BufferView::at_address(u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8])))
            };
            let image = |chunk: &[u8]| ImageView::from_params(&bytemuck::pod_read_unaligned(chunk));
            args.push(match param.kind {
                ArgKind::Buffer => ArgView::Buffer(address(bytes)),
                ArgKind::BufferArray => ArgView::Buffers(bytes.chunks_exact(ADDRESS_SIZE).map(address).collect()),
                ArgKind::Image => ArgView::Image(image(bytes)),
                ArgKind::ImageArray => ArgView::Images(bytes.chunks_exact(IMAGE_PARAMS_SIZE).map(image).collect()),
                ArgKind::ArgumentBuffer => ArgView::ArgumentBuffer(ArgumentBufferView {
                    storage: address(bytes),
                    layout: param
                        .argument_buffer
                        .clone()
                        .unwrap_or_else(|| Arc::new(FunctionInfo::kernel("", Vec::new()))),
                }),
                _ => ArgView::Data(bytes.to_vec()),
            });
        }
        KernelArgs { args }
    }

    fn arg(&self, index: usize) -> &ArgView {
        self.args
            .get(index)
            .unwrap_or_else(|| panic!("argument {index} out of range ({} arguments)", self.args.len()))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn value<T: Pod>(&self, index: usize) -> T {
        match self.arg(index) {
            ArgView::Data(bytes) => bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<T>()]),
            other => panic!("argument {index} is not plain data: {other:?}"),
        }
    }

    pub fn buffer(&self, index: usize) -> BufferView {
        match self.arg(index) {
            ArgView::Buffer(view) => *view,
            other => panic!("argument {index} is not a buffer: {other:?}"),
        }
    }

    pub fn buffer_array(&self, index: usize) -> &[BufferView] {
        match self.arg(index) {
            ArgView::Buffers(views) => views,
            other => panic!("argument {index} is not a buffer array: {other:?}"),
        }
    }

    pub fn image(&self, index: usize) -> ImageView {
        match self.arg(index) {
            ArgView::Image(view) => *view,
            other => panic!("argument {index} is not an image: {other:?}"),
        }
    }

    pub fn image_array(&self, index: usize) -> &[ImageView] {
        match self.arg(index) {
            ArgView::Images(views) => views,
            other => panic!("argument {index} is not an image array: {other:?}"),
        }
    }

    pub fn argument_buffer(&self, index: usize) -> &ArgumentBufferView {
        match self.arg(index) {
            ArgView::ArgumentBuffer(view) => view,
            other => panic!("argument {index} is not an argument buffer: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_a_launch() {
        assert_eq!(global_id(0), 0);
        assert_eq!(local_size(1), 1);
        assert_eq!(group_count(7), 1);
        assert_eq!(work_dim(), 1);
        assert!(local_memory().is_empty());
        assert!(!printf("x", &[]));
    }

    #[test]
    fn local_memory_bounds() {
        let mut arena = [0u128; 2];
        let memory = LocalMemory {
            ptr: arena.as_mut_ptr().cast(),
            len: 32,
        };
        memory.set::<u32>(7, 5);
        assert_eq!(memory.get::<u32>(7), 5);
        memory.atomic_u32(0).fetch_add(3, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(memory.get::<u32>(0), 3);
        let result = std::panic::catch_unwind(|| memory.get::<u64>(4));
        assert!(result.is_err());
    }
}
