//! Viewer application: a textured quad seen from an orbiting camera.

use anyhow::Context as _;
use glam::Vec3;
use tracing::{error, info};
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use ember_app::{AppContext, Camera, EmberApp, FrameContext};
use ember_gpu::load_spirv_file;
use ember_render::{checkerboard_rgba8, Orbit, PerspectiveCamera, QuadRenderer, QuadShaders, Texture};

/// Orbit radius around the quad.
const ORBIT_RADIUS: f32 = 1.8;

/// Camera height above the quad's centre.
const ORBIT_HEIGHT: f32 = 0.4;

/// Orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.6;

/// Size of the generated fallback texture.
const CHECKER_SIZE: u32 = 256;
const CHECKER_CELLS: u32 = 8;

/// Viewer application state.
pub struct Viewer {
    camera: PerspectiveCamera,
    // Options so cleanup can hand them back to the allocator
    quad: Option<QuadRenderer>,
    texture: Option<Texture>,
}

impl EmberApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let shader_dir = &ctx.config.shader_dir;
        let shaders = QuadShaders {
            vertex: load_spirv_file(shader_dir.join("quad.vert.spv"))
                .context("Loading the quad vertex shader (compile shaders/quad.vert with glslc)")?,
            fragment: load_spirv_file(shader_dir.join("quad.frag.spv"))
                .context("Loading the quad fragment shader (compile shaders/quad.frag with glslc)")?,
        };

        let texture = match &ctx.config.texture {
            Some(path) => Texture::load(&ctx.gpu, &ctx.command_pool, path)?,
            None => {
                let pixels = checkerboard_rgba8(
                    CHECKER_SIZE,
                    CHECKER_CELLS,
                    [235, 120, 40, 255],
                    [30, 30, 36, 255],
                );
                Texture::from_rgba8(
                    &ctx.gpu,
                    &ctx.command_pool,
                    CHECKER_SIZE,
                    CHECKER_SIZE,
                    &pixels,
                    "checkerboard",
                )?
            }
        };

        let quad = match QuadRenderer::new(
            &ctx.gpu,
            ctx.swapchain_format(),
            &texture,
            ctx.frames_in_flight(),
            shaders,
        ) {
            Ok(quad) => quad,
            Err(e) => {
                let mut allocator = ctx.gpu.allocator().lock();
                if let Err(cleanup) = texture.destroy(ctx.gpu.device(), &mut allocator) {
                    error!("Failed to free texture: {cleanup}");
                }
                return Err(e.into());
            }
        };

        let mut camera = PerspectiveCamera::default().with_orbit(Orbit::new(
            Vec3::ZERO,
            ORBIT_RADIUS,
            ORBIT_HEIGHT,
            ORBIT_SPEED,
        ));
        camera.set_aspect(ctx.aspect_ratio());

        info!("Viewer ready: V toggles vsync, R rebuilds the swapchain");

        Ok(Self {
            camera,
            quad: Some(quad),
            texture: Some(texture),
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.camera.update(dt);
    }

    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let quad = self.quad.as_ref().context("Quad renderer already released")?;

        quad.update_camera(frame.frame_slot, &self.camera)?;
        unsafe {
            quad.record(
                ctx.gpu.device(),
                frame.command_buffer,
                frame.swapchain_image,
                frame.swapchain_image_view,
                frame.extent,
                frame.frame_slot,
                ctx.config.clear_color,
            )?;
        }
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        self.camera.set_aspect(width as f32 / height as f32);
        Ok(())
    }

    fn on_swapchain_recreated(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        self.camera.set_aspect(ctx.aspect_ratio());

        let format = ctx.swapchain_format();
        if let Some(quad) = &mut self.quad {
            if quad.color_format() != format {
                // The pipeline may still be bound by frames in flight
                ctx.gpu.wait_idle()?;
                quad.ensure_format(&ctx.gpu, format)?;
            }
        }
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut AppContext, event: &WindowEvent) -> bool {
        let WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(code),
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
            ..
        } = event
        else {
            return false;
        };

        match code {
            KeyCode::KeyV => {
                let vsync = !ctx.swapchain.vsync();
                info!("Vsync {}", if vsync { "on" } else { "off" });
                ctx.swapchain.set_vsync(vsync);
                true
            }
            KeyCode::KeyR => {
                info!("Swapchain rebuild requested");
                ctx.swapchain.request_recreate();
                true
            }
            _ => false,
        }
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let device = ctx.gpu.device();
        let mut allocator = ctx.gpu.allocator().lock();

        if let Some(quad) = self.quad.take() {
            if let Err(e) = quad.destroy(device, &mut allocator) {
                error!("Failed to release quad renderer: {e}");
            }
        }
        if let Some(texture) = self.texture.take() {
            if let Err(e) = texture.destroy(device, &mut allocator) {
                error!("Failed to release texture: {e}");
            }
        }
    }
}
