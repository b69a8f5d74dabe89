//! Tests against a real Vulkan device
//!
//! Run with `cargo test -- --ignored` on a machine with a Vulkan driver.

use ash::vk;
use rust_compositor::config::{RendererConfig, ShaderConfig, TransientAllocation};
use rust_compositor::render::vulkan::descriptors::{DescriptorAllocator, DescriptorSetLayoutBuilder};
use rust_compositor::render::vulkan::memory::TransientSizes;
use rust_compositor::render::vulkan::{
    CommandRecorder, FrameFactory, FrameResourcePool, FrameState, MemoryAllocator, MemoryTypes, MemoryUsage,
    RepaintOutcome, Surface, SurfacePresenter, VulkanContext, VulkanError, VulkanInstance,
};
use rust_compositor::render::Window;
use rust_compositor::scene::{SceneError, SceneGraph};

fn headless_context() -> VulkanContext {
    let config = RendererConfig::new("device-tests").with_validation(false);
    let instance = VulkanInstance::new(&config, &[]).expect("Vulkan instance");
    VulkanContext::new(instance, None).expect("headless device")
}

#[test]
#[ignore = "requires a Vulkan device"]
fn test_mapped_block_round_trip() {
    let context = headless_context();
    let allocator = MemoryAllocator::new(&context).unwrap();

    let bytes: Vec<u8> = (0..=255).collect();
    let buffer = allocator.alloc_staging_buffer(bytes.len() as u64).unwrap();
    assert!(buffer.is_mapped());
    buffer.write(&bytes).unwrap();
    assert_eq!(buffer.read(bytes.len()).unwrap(), bytes);

    buffer.write_at(10, &[0xaa; 4]).unwrap();
    let back = buffer.read(16).unwrap();
    assert_eq!(&back[10..14], &[0xaa; 4]);
    assert_eq!(back[9], 9);
    allocator.free_buffer(buffer);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn test_classification_is_stable() {
    let context = headless_context();
    let device = context.raw_device();
    let props = &context.physical_device.memory_properties;

    let first = MemoryTypes::probe(&device, props).unwrap();
    let second = MemoryTypes::probe(&device, props).unwrap();
    assert_eq!(first, second);
    assert!(first.get(MemoryUsage::Staging).is_host_visible());
}

#[test]
#[ignore = "requires a Vulkan device"]
fn test_transient_buffers_are_packed_when_possible() {
    let context = headless_context();
    let allocator = MemoryAllocator::new(&context).unwrap();
    let sizes = TransientSizes {
        vertex: 48 * 4,
        index: 18 * 2,
        uniform: 48,
    };

    let dedicated = allocator.alloc_transient(TransientAllocation::Dedicated, sizes).unwrap();
    assert!(!dedicated.vertex.is_packed());

    let packed = allocator.alloc_transient(TransientAllocation::Packed, sizes).unwrap();
    let expect_packed = allocator.memory_types().transient().is_some();
    assert_eq!(packed.vertex.is_packed(), expect_packed);
    assert_eq!(packed.uniform.is_packed(), expect_packed);
    if expect_packed {
        assert_eq!(packed.vertex.offset(), 0);
        assert!(packed.index.offset() >= sizes.vertex);
        assert!(packed.uniform.offset() >= packed.index.offset() + sizes.index);
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn test_frame_reused_after_fence_signals() {
    let context = headless_context();
    let device = context.raw_device();
    let layout = DescriptorSetLayoutBuilder::new()
        .add_uniform_buffer(1, vk::ShaderStageFlags::VERTEX)
        .build(&device)
        .unwrap();
    let descriptors = DescriptorAllocator::new(device.clone(), 2, 1);
    let factory = FrameFactory::new(device.clone(), context.graphics_queue().family, layout.handle(), descriptors)
        .unwrap();
    let mut pool = FrameResourcePool::new(factory);

    for serial in 1..=4 {
        let frame = pool.acquire().unwrap();
        assert_eq!(frame.state(), FrameState::Idle);

        let mut recorder = CommandRecorder::new(frame.command_buffer, device.clone());
        recorder.begin().unwrap();
        let command_buffer = recorder.end().unwrap();
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            device
                .queue_submit(context.graphics_queue().handle, &[submit.build()], frame.fence.handle())
                .unwrap();
        }
        frame.mark_submitted(serial);
        frame.fence.wait(u64::MAX).unwrap();
    }

    // Every submission completed before the next acquire
    assert_eq!(pool.len(), 1);
    context.wait_idle().unwrap();
}

#[test]
#[ignore = "requires a Vulkan device and a display"]
fn test_scene_error_leaves_presenter_usable() {
    let shader_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/../../target/shaders");
    let config = RendererConfig::new("device-tests")
        .with_validation(false)
        .with_shaders(ShaderConfig::new(
            format!("{shader_dir}/compositor.vert.spv"),
            format!("{shader_dir}/compositor.frag.spv"),
        ));
    let mut window = Window::new("device-tests", 320, 240).unwrap();
    let extensions = window.get_required_instance_extensions().unwrap();
    let instance = VulkanInstance::new(&config, &extensions).unwrap();
    let surface = Surface::from_window(&instance, &mut window).unwrap();
    let context = VulkanContext::new(instance, Some(&surface)).unwrap();
    let (width, height) = window.get_framebuffer_size();
    let mut presenter = SurfacePresenter::new(context, surface, &config, width, height).unwrap();

    let mut graph = SceneGraph::new();
    let crowded = graph.create_scene();
    let root = graph.create_layer();
    graph.set_root(crowded, root).unwrap();
    for _ in 0..16_385 {
        let view = graph.create_view(1, 1);
        graph.push(root, view).unwrap();
    }
    let small = graph.create_scene();
    let layer = graph.create_layer();
    let view = graph.create_view(16, 16);
    graph.set_root(small, layer).unwrap();
    graph.push(layer, view).unwrap();

    assert!(matches!(
        presenter.repaint(&graph, crowded),
        Err(VulkanError::Scene(SceneError::TooManyViews { views: 16_385 }))
    ));
    for _ in 0..3 {
        window.poll_events();
        assert_eq!(presenter.repaint(&graph, small).unwrap(), RepaintOutcome::Presented);
    }
    presenter.wait_idle().unwrap();
}
