//! Compositor demo application
//!
//! Opens a window, builds a small scene of textured views and a glyph run,
//! and bobs the root layer up and down while the window is open.

use glfw::{Action, Key, WindowEvent};
use rust_compositor::foundation::logging;
use rust_compositor::prelude::*;
use thiserror::Error;

const CONFIG_PATH: &str = "compositor.toml";
const BACKGROUND_PATH: &str = "resources/textures/background.png";

#[derive(Error, Debug)]
enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Vulkan(#[from] VulkanError),
    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// RGBA checkerboard, used when no background image is on disk
fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x / cell + y / cell) % 2 == 0 {
                [0x30, 0x60, 0xa0, 0xff]
            } else {
                [0xe0, 0xe0, 0xe0, 0xff]
            }
        })
        .collect()
}

/// Antialiased disc coverage, standing in for a rasterized glyph
fn disc_coverage(size: u32) -> Vec<u8> {
    let radius = size as f32 / 2.0;
    (0..size * size)
        .map(|i| {
            let dx = (i % size) as f32 + 0.5 - radius;
            let dy = (i / size) as f32 + 0.5 - radius;
            let edge = radius - dx.hypot(dy);
            (edge.clamp(0.0, 1.0) * 255.0) as u8
        })
        .collect()
}

/// The presenter's surface must go before the window it was created for
struct CompositorApp {
    presenter: SurfacePresenter,
    graph: SceneGraph,
    scene: SceneId,
    root: NodeId,
    window: Window,
}

impl CompositorApp {
    fn new(config: &ClientConfig) -> Result<Self, DemoError> {
        let mut window = Window::from_config(&config.window)?;
        let instance = VulkanInstance::new(&config.renderer, &window.get_required_instance_extensions()?)?;
        let surface = Surface::from_window(&instance, &mut window)?;
        let context = VulkanContext::new(instance, Some(&surface))?;
        let (width, height) = window.get_framebuffer_size();
        let presenter = SurfacePresenter::new(context, surface, &config.renderer, width, height)?;

        let mut graph = SceneGraph::new();
        let scene = graph.create_scene();
        let root = graph.create_layer();
        graph.set_root(scene, root)?;

        Ok(Self {
            presenter,
            graph,
            scene,
            root,
            window,
        })
    }

    fn background_texture(&mut self) -> Result<TextureId, DemoError> {
        match image::open(BACKGROUND_PATH) {
            Ok(img) => {
                let rgba = img.to_rgba8();
                let (width, height) = rgba.dimensions();
                log::info!("Loaded background {BACKGROUND_PATH} ({width}x{height})");
                Ok(self.presenter.create_texture(&TextureDesc::packed(
                    width,
                    height,
                    TextureFormat::Rgba8,
                    rgba.as_raw(),
                ))?)
            }
            Err(e) => {
                log::info!("No background image ({e}), using a checkerboard");
                let pixels = checkerboard(256, 32);
                Ok(self
                    .presenter
                    .create_texture(&TextureDesc::packed(256, 256, TextureFormat::Rgba8, &pixels))?)
            }
        }
    }

    fn build_scene(&mut self) -> Result<(), DemoError> {
        let background = self.background_texture()?;
        let glyph_size = 24;
        let glyph = self.presenter.create_texture(&TextureDesc::packed(
            glyph_size,
            glyph_size,
            TextureFormat::R8,
            &disc_coverage(glyph_size),
        ))?;

        let panel = self.graph.create_view(320, 240);
        self.graph.set_view_texture(panel, Some(background))?;
        self.graph.set_position(panel, 40, 40)?;
        self.graph.push(self.root, panel)?;

        // Untextured views draw with the default white texture
        let badge = self.graph.create_view(64, 64);
        self.graph.set_position(badge, 400, 60)?;
        self.graph.insert_above(panel, badge)?;

        let text = self.graph.create_layer();
        self.graph.set_position(text, 60, 320)?;
        self.graph.push(self.root, text)?;

        let run: Vec<GlyphPlacement> = (0..12)
            .map(|i| GlyphPlacement {
                x: i * (glyph_size as i32 + 4),
                y: if i % 2 == 0 { 0 } else { 6 },
                width: glyph_size,
                height: glyph_size,
                texture: Some(glyph),
            })
            .collect();
        self.graph.push_glyph_run(text, &run)?;

        log::debug!("Scene:\n{}", self.graph.dump(self.scene)?);
        Ok(())
    }

    fn run(&mut self) -> Result<(), DemoError> {
        log::info!("Starting compositor loop");

        while !self.window.should_close() {
            self.window.poll_events();

            let events: Vec<WindowEvent> = self.window.flush_events().map(|(_, event)| event).collect();
            for event in events {
                match event {
                    WindowEvent::Key(Key::Escape, _, Action::Press, _) => {
                        self.window.set_should_close(true);
                    }
                    WindowEvent::FramebufferSize(width, height) => {
                        self.presenter
                            .resize(width.max(0) as u32, height.max(0) as u32);
                    }
                    _ => {}
                }
            }

            let t = self.window.time();
            let offset = (t.sin() * 50.0 + 50.0) as i32;
            self.graph.set_position(self.root, 0, offset)?;

            self.presenter.repaint(&self.graph, self.scene)?;
        }

        self.presenter.wait_idle()?;
        log::info!("Compositor loop finished with {} frame contexts", self.presenter.frame_count());
        Ok(())
    }
}

fn main() {
    let config = match ClientConfig::load_or_default(CONFIG_PATH).and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration in {CONFIG_PATH}: {e}");
            std::process::exit(1);
        }
    };
    logging::init_with_filter(&config.log_level);

    let result = CompositorApp::new(&config).and_then(|mut app| {
        app.build_scene()?;
        app.run()
    });

    if let Err(e) = result {
        log::error!("Compositor failed: {e}");
        std::process::exit(1);
    }
}
