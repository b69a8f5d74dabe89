//! # Rust Compositor
//!
//! A small Vulkan compositor that draws a retained tree of layers and
//! textured views into a window.
//!
//! ## Features
//!
//! - **Scene Graph**: Layer/View tree with push, above/below and reparenting
//! - **Memory Management**: Usage-classified memory types, dedicated or packed allocations
//! - **Frame Pool**: Fence-gated recycling of per-frame command and buffer bundles
//! - **Presentation**: Swapchain acquire, record, submit and present with resize handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_compositor::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     rust_compositor::foundation::logging::init();
//!     let config = RendererConfig::default();
//!     let mut window = Window::new("compositor", 800, 600)?;
//!     let instance = VulkanInstance::new(&config, &window.get_required_instance_extensions()?)?;
//!     let surface = Surface::from_window(&instance, &mut window)?;
//!     let context = VulkanContext::new(instance, Some(&surface))?;
//!     let (width, height) = window.get_framebuffer_size();
//!     let mut presenter = SurfacePresenter::new(context, surface, &config, width, height)?;
//!
//!     let mut graph = SceneGraph::new();
//!     let scene = graph.create_scene();
//!     let root = graph.create_layer();
//!     graph.set_root(scene, root)?;
//!     let view = graph.create_view(64, 64);
//!     graph.push(root, view)?;
//!
//!     while !window.should_close() {
//!         window.poll_events();
//!         presenter.repaint(&graph, scene)?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod render;
pub mod scene;

/// Common imports for compositor users
pub mod prelude {
    pub use crate::{
        config::{ClientConfig, Config, ConfigError, RendererConfig, ShaderConfig, WindowConfig},
        render::{
            vulkan::{
                RepaintOutcome, Surface, SurfacePresenter, TextureDesc, TextureFormat,
                VulkanContext, VulkanError, VulkanInstance, VulkanResult,
            },
            TextureId, Window, WindowError,
        },
        scene::{GlyphPlacement, NodeId, QuadVertex, SceneError, SceneGraph, SceneId},
    };
}
