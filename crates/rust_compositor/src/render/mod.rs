//! Rendering: window glue and the Vulkan presenter

pub mod vulkan;
mod window;

pub use window::{Window, WindowError, WindowResult};

slotmap::new_key_type! {
    /// Handle to a texture owned by the presenter
    pub struct TextureId;
}
