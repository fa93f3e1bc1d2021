// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use std::sync::Arc;

use floor::{
    Buffer, Context, ContextConfig, HostContext, HostSpan, Image, ImageType, MapFlags, MemoryFlags, MemoryObject,
    PlatformType, Queue,
};

fn host() -> (HostContext, Arc<dyn Queue>) {
    let context = HostContext::new(ContextConfig::host());
    let device = context.fastest_device().expect("host device").clone();
    let queue = context.create_queue(&device).unwrap();
    (context, queue)
}

fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

#[test]
fn buffer_read_write() {
    let (context, queue) = host();
    let data: Vec<u8> = (0..64u8).collect();
    let buffer = context
        .create_buffer_with_data(queue.as_ref(), &data, MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE)
        .unwrap();
    assert_eq!(buffer.size(), 64);
    assert_eq!(buffer.platform_type(), PlatformType::Host);

    let mut out = vec![0u8; 16];
    buffer.read_into(queue.as_ref(), &mut out, 8).unwrap();
    assert_eq!(out, (8..24u8).collect::<Vec<_>>());

    buffer.write_from(queue.as_ref(), &[0xaa; 4], 60).unwrap();
    let mut tail = [0u8; 8];
    buffer.read_into(queue.as_ref(), &mut tail, 56).unwrap();
    assert_eq!(tail, [56, 57, 58, 59, 0xaa, 0xaa, 0xaa, 0xaa]);

    assert!(buffer.write_from(queue.as_ref(), &[0; 8], 60).is_err());
    assert!(buffer.read_into(queue.as_ref(), &mut [0; 1], 64).is_err());
}

#[test]
fn buffer_fill_zero_and_copy() {
    let (context, queue) = host();
    let flags = MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE;
    let a = context.create_buffer(queue.as_ref(), 32, flags).unwrap();
    let b = context.create_buffer(queue.as_ref(), 32, flags).unwrap();

    a.fill(queue.as_ref(), &0x1122_3344u32.to_ne_bytes(), 0, 0).unwrap();
    let mut bytes = vec![0u8; 32];
    a.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    assert!(words(&bytes).iter().all(|w| *w == 0x1122_3344));

    // pattern sizes are restricted, and the size must be a multiple of the pattern
    assert!(a.fill(queue.as_ref(), &[1, 2, 3], 0, 0).is_err());
    assert!(a.fill(queue.as_ref(), &[1, 2, 3, 4], 6, 0).is_err());

    b.zero(queue.as_ref()).unwrap();
    b.copy(queue.as_ref(), a.as_ref(), 8, 0, 24).unwrap();
    b.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    assert_eq!(words(&bytes), vec![0, 0, 0, 0, 0, 0, 0x1122_3344, 0x1122_3344]);
    assert!(b.copy(queue.as_ref(), a.as_ref(), 16, 0, 24).is_err());

    a.zero(queue.as_ref()).unwrap();
    a.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    assert!(bytes.iter().all(|b| *b == 0));
}

#[test]
fn sizes_round_up_to_whole_words() {
    let (context, queue) = host();
    let flags = MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE;
    assert_eq!(context.create_buffer(queue.as_ref(), 5, flags).unwrap().size(), 8);
    assert_eq!(context.create_buffer(queue.as_ref(), 1, flags).unwrap().size(), 4);
    assert_eq!(context.create_buffer(queue.as_ref(), 12, flags).unwrap().size(), 12);

    let odd = context
        .create_buffer_with_data(queue.as_ref(), &[1, 2, 3, 4, 5], flags)
        .unwrap();
    assert_eq!(odd.size(), 8);
    let mut bytes = [0xffu8; 8];
    odd.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    assert_eq!(bytes, [1, 2, 3, 4, 5, 0, 0, 0]);

    // a host span shorter than the rounded size can back copies, but can't be aliased
    let mut staging = vec![9u8; 6];
    let copied = unsafe {
        context.create_buffer_with_host_memory(queue.as_ref(), HostSpan::from_slice(&mut staging), flags)
    }
    .unwrap();
    assert_eq!(copied.size(), 8);
    copied.fill(queue.as_ref(), &[2, 2, 2, 2], 0, 0).unwrap();
    copied.read(queue.as_ref(), 0, 0).unwrap();
    drop(copied);
    assert_eq!(staging, vec![2; 6]);

    let mut short = vec![0u8; 6];
    let aliased = unsafe {
        context.create_buffer_with_host_memory(
            queue.as_ref(),
            HostSpan::from_slice(&mut short),
            flags | MemoryFlags::USE_HOST_MEMORY,
        )
    };
    assert!(aliased.is_err());
}

#[test]
fn fill_tiles_the_pattern_bytes() {
    let (context, queue) = host();
    let buffer = context
        .create_buffer(queue.as_ref(), 16, MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE)
        .unwrap();
    buffer.fill(queue.as_ref(), &[0xde, 0xad, 0xbe, 0xef], 0, 0).unwrap();
    let mut bytes = [0u8; 16];
    buffer.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    assert_eq!(bytes.to_vec(), [0xde, 0xad, 0xbe, 0xef].repeat(4));
}

#[test]
fn copy_between_offsets() {
    let (context, queue) = host();
    let flags = MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE;
    let data: Vec<u8> = (0..64u8).collect();
    let src = context.create_buffer_with_data(queue.as_ref(), &data, flags).unwrap();
    let dst = context.create_buffer(queue.as_ref(), 32, flags).unwrap();
    dst.copy(queue.as_ref(), src.as_ref(), 32, 16, 0).unwrap();
    let mut bytes = [0u8; 32];
    dst.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    assert_eq!(bytes.to_vec(), (16..48u8).collect::<Vec<_>>());

    // size 0 copies min(src, dst) bytes
    dst.zero(queue.as_ref()).unwrap();
    dst.copy(queue.as_ref(), src.as_ref(), 0, 0, 0).unwrap();
    dst.read_into(queue.as_ref(), &mut bytes, 0).unwrap();
    assert_eq!(bytes.to_vec(), (0..32u8).collect::<Vec<_>>());

    // overlapping copy within one buffer
    src.copy(queue.as_ref(), src.as_ref(), 8, 0, 4).unwrap();
    let mut head = [0u8; 12];
    src.read_into(queue.as_ref(), &mut head, 0).unwrap();
    assert_eq!(head, [0, 1, 2, 3, 0, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn opposing_copies_do_not_deadlock() {
    let (context, queue) = host();
    let flags = MemoryFlags::READ_WRITE;
    let a = context.create_buffer(queue.as_ref(), 1 << 20, flags).unwrap();
    let b = context.create_buffer(queue.as_ref(), 1 << 20, flags).unwrap();
    std::thread::scope(|scope| {
        let forward = scope.spawn(|| {
            for _ in 0..64 {
                b.copy(queue.as_ref(), a.as_ref(), 0, 0, 0).unwrap();
            }
        });
        let backward = scope.spawn(|| {
            for _ in 0..64 {
                a.copy(queue.as_ref(), b.as_ref(), 0, 0, 0).unwrap();
            }
        });
        forward.join().unwrap();
        backward.join().unwrap();
    });
}

#[test]
fn buffer_mapping() {
    let (context, queue) = host();
    let buffer = context
        .create_buffer(queue.as_ref(), 16, MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE)
        .unwrap();
    let mut mapping = buffer.map(queue.as_ref(), MapFlags::WRITE_INVALIDATE, 8, 4).unwrap();
    assert_eq!(mapping.len(), 8);
    mapping.as_mut_slice().copy_from_slice(&[9; 8]);
    buffer.unmap(queue.as_ref(), mapping).unwrap();

    let mapping = buffer.map(queue.as_ref(), MapFlags::READ, 0, 0).unwrap();
    assert_eq!(mapping.len(), 16);
    assert_eq!(&mapping.as_slice()[..4], &[0; 4]);
    assert_eq!(&mapping.as_slice()[4..12], &[9; 8]);
    buffer.unmap(queue.as_ref(), mapping).unwrap();

    assert!(buffer.map(queue.as_ref(), MapFlags::READ | MapFlags::WRITE_INVALIDATE, 0, 0).is_err());
    let device_only = context.create_buffer(queue.as_ref(), 16, MemoryFlags::READ_WRITE).unwrap();
    assert!(device_only.map(queue.as_ref(), MapFlags::READ, 0, 0).is_err());
}

#[test]
fn host_memory_is_aliased_or_copied() {
    let (context, queue) = host();
    let mut backing = vec![5u8; 32];
    let aliased = unsafe {
        context.create_buffer_with_host_memory(
            queue.as_ref(),
            HostSpan::from_slice(&mut backing),
            MemoryFlags::READ_WRITE | MemoryFlags::USE_HOST_MEMORY,
        )
    }
    .unwrap();
    aliased.write_from(queue.as_ref(), &[1, 2, 3, 4], 0).unwrap();
    drop(aliased);
    assert_eq!(&backing[..6], &[1, 2, 3, 4, 5, 5]);

    let mut staging = vec![7u8; 16];
    let copied = unsafe {
        context.create_buffer_with_host_memory(
            queue.as_ref(),
            HostSpan::from_slice(&mut staging),
            MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE,
        )
    }
    .unwrap();
    copied.fill(queue.as_ref(), &[3], 8, 8).unwrap();
    // nothing reaches the host span until it is read back explicitly
    let mut device = [0u8; 16];
    copied.read_into(queue.as_ref(), &mut device, 0).unwrap();
    assert_eq!(&device[..], &[7, 7, 7, 7, 7, 7, 7, 7, 3, 3, 3, 3, 3, 3, 3, 3]);
    copied.read(queue.as_ref(), 0, 0).unwrap();
    drop(copied);
    assert_eq!(&staging[8..], &[3; 8]);
}

#[test]
fn image_levels_and_mip_generation() {
    let (context, queue) = host();
    let image_type = ImageType::IMAGE_2D | ImageType::RGBA8 | ImageType::MIP_MAPPED;
    let extent = [8, 4, 0, 0];
    let level_sizes = [8 * 4 * 4, 4 * 2 * 4, 2 * 4, 4];
    let total: usize = level_sizes.iter().sum();
    let mut data = vec![0u8; total];
    data[..level_sizes[0]].fill(200);

    let image = context
        .create_image_with_data(
            queue.as_ref(),
            image_type,
            extent,
            &data,
            MemoryFlags::READ | MemoryFlags::HOST_READ_WRITE | MemoryFlags::GENERATE_MIP_MAPS,
        )
        .unwrap();
    assert_eq!(image.mip_level_count(), 4);
    assert_eq!(image.size(), total);

    let mut level1 = vec![0u8; level_sizes[1]];
    image.read_level_into(queue.as_ref(), 1, &mut level1).unwrap();
    assert!(level1.iter().all(|b| *b == 200));
    let mut level3 = vec![0u8; level_sizes[3]];
    image.read_level_into(queue.as_ref(), 3, &mut level3).unwrap();
    assert_eq!(level3, vec![200; 4]);

    // rewriting level 0 regenerates the chain
    image.write_level_from(queue.as_ref(), 0, &vec![40u8; level_sizes[0]]).unwrap();
    image.read_level_into(queue.as_ref(), 3, &mut level3).unwrap();
    assert_eq!(level3, vec![40; 4]);
    assert!(image.read_level_into(queue.as_ref(), 4, &mut level3).is_err());
}

#[test]
fn blit_converts_formats() {
    let (context, queue) = host();
    let extent = [2, 2, 0, 0];
    let texels: Vec<u8> = [255u8, 0, 0, 255].repeat(4);
    let src = context
        .create_image_with_data(
            queue.as_ref(),
            ImageType::IMAGE_2D | ImageType::RGBA8,
            extent,
            &texels,
            MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE,
        )
        .unwrap();
    let dst = context
        .create_image(
            queue.as_ref(),
            ImageType::IMAGE_2D | ImageType::RGBA32F,
            extent,
            MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE,
        )
        .unwrap();
    dst.blit(queue.as_ref(), src.as_ref()).unwrap();
    let mut out = vec![0u8; dst.size()];
    dst.read_into(queue.as_ref(), &mut out).unwrap();
    let floats: Vec<f32> = words(&out).into_iter().map(f32::from_bits).collect();
    assert_eq!(floats, [1.0f32, 0.0, 0.0, 1.0].repeat(4));

    let wrong_size = context
        .create_image(
            queue.as_ref(),
            ImageType::IMAGE_2D | ImageType::RGBA32F,
            [4, 4, 0, 0],
            MemoryFlags::READ_WRITE,
        )
        .unwrap();
    assert!(wrong_size.blit(queue.as_ref(), src.as_ref()).is_err());
}

#[test]
fn image_creation_errors() {
    let (context, queue) = host();
    let msaa = (ImageType::IMAGE_2D | ImageType::RGBA8).with_sample_count(4);
    assert!(
        context
            .create_image(queue.as_ref(), msaa, [4, 4, 0, 0], MemoryFlags::WRITE)
            .is_err()
    );
    assert!(
        context
            .create_image(
                queue.as_ref(),
                ImageType::IMAGE_2D | ImageType::RGBA8,
                [4, 4, 0, 0],
                MemoryFlags::READ_WRITE | MemoryFlags::RENDER_TARGET,
            )
            .is_err()
    );
    assert!(
        context
            .create_image_with_data(
                queue.as_ref(),
                ImageType::IMAGE_2D | ImageType::R8,
                [4, 4, 0, 0],
                &[0u8; 15],
                MemoryFlags::READ_WRITE,
            )
            .is_err()
    );
}

#[test]
fn image_host_memory_alias() {
    let (context, queue) = host();
    let mut backing = vec![0u8; 4 * 4];
    let image = unsafe {
        context.create_image_with_host_memory(
            queue.as_ref(),
            ImageType::IMAGE_2D | ImageType::R8,
            [4, 4, 0, 0],
            HostSpan::from_slice(&mut backing),
            MemoryFlags::READ_WRITE | MemoryFlags::HOST_READ_WRITE | MemoryFlags::USE_HOST_MEMORY,
        )
    }
    .unwrap();
    let mut mapping = image.map(queue.as_ref(), MapFlags::WRITE).unwrap();
    mapping.as_mut_slice()[5] = 77;
    image.unmap(queue.as_ref(), mapping).unwrap();
    drop(image);
    assert_eq!(backing[5], 77);
}

#[test]
fn labels_are_registered() {
    let (context, queue) = host();
    let flags = MemoryFlags::READ_WRITE;
    let a = context.create_buffer(queue.as_ref(), 4, flags).unwrap();
    let b = context.create_buffer(queue.as_ref(), 4, flags).unwrap();
    a.set_debug_label("weights");
    b.set_debug_label("weights");
    assert_eq!(a.debug_label(), "weights");
    assert_eq!(context.registry().find_buffers("weights").len(), 2);

    b.set_debug_label("bias");
    assert_eq!(context.registry().find_buffers("weights").len(), 1);
    assert_eq!(context.registry().labels(), vec!["bias".to_string(), "weights".to_string()]);

    drop(a);
    assert!(context.registry().find_buffers("weights").is_empty());
    assert_eq!(context.registry().labels(), vec!["bias".to_string()]);
    assert!(context.registry().find_images("bias").is_empty());
}

#[test]
fn memory_usage_tracks_allocations() {
    let (context, queue) = host();
    let device = queue.device().clone();
    let before = context.memory_usage(&device).allocated;
    let buffer = context.create_buffer(queue.as_ref(), 4096, MemoryFlags::READ_WRITE).unwrap();
    let during = context.memory_usage(&device);
    assert!(during.allocated >= before + 4096);
    assert!(during.global_total > 0);
    assert!((0.0..=1.0).contains(&during.fraction()));
    drop(buffer);
    assert_eq!(context.memory_usage(&device).allocated, before);
}
