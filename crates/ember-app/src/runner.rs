//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use ash::vk;
use ember_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffers};
use ember_gpu::{GpuContextBuilder, GpuError, Maintenance, SwapchainState};
use ember_platform::create_event_loop;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow};
use winit::window::WindowId;

use crate::app::EmberApp;
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Run an `EmberApp` with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the
/// event loop until the window closes or a frame fails.
pub fn run_app<A: EmberApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();

    config.validate()?;
    info!("{} starting...", config.title);

    let event_loop = create_event_loop()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };

    event_loop
        .run_app(&mut runner)
        .context("Event loop terminated abnormally")?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber installed by the host (tests, embedding) takes precedence
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// What happened to a redraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameStatus {
    Presented,
    Skipped,
}

/// Frame time statistics reported on shutdown.
#[derive(Debug, Clone, PartialEq)]
struct FrameStats {
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
    samples: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            samples: 0,
        }
    }
}

impl FrameStats {
    fn record(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let fps = 1.0 / f64::from(dt);
        self.min_fps = self.min_fps.min(fps);
        self.max_fps = self.max_fps.max(fps);
        self.fps_sum += fps;
        self.samples += 1;
    }

    fn average(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.fps_sum / self.samples as f64)
    }

    fn report(&self, frames: u64) {
        let Some(avg_fps) = self.average() else {
            return;
        };
        info!("FPS Statistics:");
        info!("  Min: {:.1}", self.min_fps);
        info!("  Max: {:.1}", self.max_fps);
        info!("  Avg: {:.1}", avg_fps);
        info!("  Total frames: {frames}");
    }
}

/// Back-to-back failed swapchain rebuilds tolerated before the loop stops.
const MAX_REBUILD_FAILURES: u32 = 300;

/// Counts consecutive failed swapchain rebuilds.
#[derive(Debug, Default)]
struct RebuildFailures {
    consecutive: u32,
}

impl RebuildFailures {
    /// Note a failed rebuild; `Err` once the limit is reached.
    fn record(&mut self, error: GpuError) -> anyhow::Result<()> {
        self.consecutive += 1;
        if self.consecutive >= MAX_REBUILD_FAILURES {
            return Err(anyhow::Error::new(error).context(format!(
                "Swapchain rebuild failed {} times in a row",
                self.consecutive
            )));
        }
        warn!("Swapchain recreation failed, skipping frame: {error}");
        Ok(())
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// How the frame goes on after swapchain maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterMaintenance {
    Render { recreated: bool },
    Skip,
}

/// Decide the rest of the frame from the maintenance outcome.
///
/// A maintenance `Err` (lost device while polling or draining) ends the
/// loop. A failed rebuild skips the frame and is retried next frame.
fn after_maintenance(
    outcome: ember_gpu::Result<Maintenance>,
    failures: &mut RebuildFailures,
) -> anyhow::Result<AfterMaintenance> {
    match outcome.context("Swapchain maintenance failed")? {
        Maintenance::Unchanged => {
            failures.reset();
            Ok(AfterMaintenance::Render { recreated: false })
        }
        Maintenance::Recreated => {
            failures.reset();
            Ok(AfterMaintenance::Render { recreated: true })
        }
        Maintenance::RebuildFailed(e) => {
            failures.record(e)?;
            Ok(AfterMaintenance::Skip)
        }
    }
}

/// Time left to sleep to hold `target` per frame.
fn pacing_delay(target: Option<Duration>, elapsed: Duration) -> Option<Duration> {
    target.and_then(|target| target.checked_sub(elapsed)).filter(|d| !d.is_zero())
}

fn target_frame_time(target_fps: Option<u32>) -> Option<Duration> {
    target_fps
        .filter(|&fps| fps > 0)
        .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner<A: EmberApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: EmberApp> {
    // Dropped before the context so app resources never outlive the device
    app: A,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    stats: FrameStats,
    rebuild_failures: RebuildFailures,
}

impl<A: EmberApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };

        // Let the app handle the event first
        if state.app.on_event(&mut state.ctx, &event) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::Resized(size) => {
                state.ctx.framebuffer.on_resize(size.width, size.height);
                if !state.ctx.framebuffer.is_minimized() {
                    state.ctx.window.request_redraw();
                }
            }
            WindowEvent::RedrawRequested => {
                if state.ctx.framebuffer.is_minimized() {
                    return;
                }
                match state.render_frame() {
                    Ok(FrameStatus::Presented) => {}
                    Ok(FrameStatus::Skipped) => trace!("Frame {} skipped", state.ctx.frame_count),
                    Err(e) => {
                        error!("Frame failed, stopping: {e:#}");
                        self.failure = Some(e);
                        self.shutdown(event_loop);
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(state) = &self.state else {
            return;
        };

        // Nothing can be presented to a zero-sized surface; sleep until the
        // next resize event instead of spinning
        if state.ctx.framebuffer.is_minimized() {
            event_loop.set_control_flow(ControlFlow::Wait);
        } else {
            event_loop.set_control_flow(ControlFlow::Poll);
            state.ctx.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
    }
}

impl<A: EmberApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window = Arc::new(self.config.window_config().create_window(event_loop)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build(window.as_ref())?;

        info!("GPU: {}", gpu.device_info().summary());

        let mut ctx = AppContext::new(window, gpu, self.config.clone())?;
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            app,
            ctx,
            target_frame_time: target_frame_time(self.config.target_fps),
            stats: FrameStats::default(),
            rebuild_failures: RebuildFailures::default(),
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: EmberApp> AppState<A> {
    fn render_frame(&mut self) -> anyhow::Result<FrameStatus> {
        let frame_start = Instant::now();

        // Resize events are folded into one size per frame
        if let Some((width, height)) = self.ctx.framebuffer.take_resize() {
            debug!("Framebuffer resized to {width}x{height}");
            self.ctx.swapchain.resize(width, height);
            self.app.on_resize(&mut self.ctx, width, height)?;
        }

        let outcome = self
            .ctx
            .swapchain
            .check_and_recreate_if_needed(self.ctx.gpu.surface(), &self.ctx.frames);
        match after_maintenance(outcome, &mut self.rebuild_failures)? {
            AfterMaintenance::Render { recreated: true } => {
                self.app.on_swapchain_recreated(&mut self.ctx)?;
            }
            AfterMaintenance::Render { recreated: false } => {}
            // The old swapchain is still installed
            AfterMaintenance::Skip => return Ok(FrameStatus::Skipped),
        }

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;
        self.stats.record(dt);

        self.app.update(&self.ctx, dt);

        let slot = self.ctx.frames.current_frame();
        let acquired = self.ctx.swapchain.next_image(self.ctx.frames.current())?;
        if acquired.state == SwapchainState::OutOfDate {
            debug!("Swapchain out of date, skipping frame");
            return Ok(FrameStatus::Skipped);
        }
        let image_index = acquired.index;

        let device = self.ctx.gpu.device();
        let command_buffer = *self
            .ctx
            .command_buffers
            .get(slot)
            .context("No command buffer for frame slot")?;
        let swapchain_image = self
            .ctx
            .swapchain
            .image(image_index)
            .context("Acquired image index out of range")?;
        let swapchain_image_view = self
            .ctx
            .swapchain
            .image_view(image_index)
            .context("Acquired image index out of range")?;

        // The slot's fence was waited on during acquisition, so its command
        // buffer is no longer pending
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            begin_command_buffer(device, command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }

        let mut frame = FrameContext {
            command_buffer,
            image_index,
            swapchain_image,
            swapchain_image_view,
            extent: self.ctx.swapchain.extent(),
            frame_slot: slot,
            dt,
            frame_number: self.ctx.frame_count,
        };
        self.app.render(&self.ctx, &mut frame)?;

        let sync = self.ctx.frames.current();
        let image_acquired = sync.image_acquired;
        let render_complete = sync.render_complete;
        let drawing = sync.drawing;

        unsafe {
            end_command_buffer(device, command_buffer)?;
            submit_command_buffers(
                device,
                self.ctx.gpu.queues().graphics,
                &[command_buffer],
                &[image_acquired],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[render_complete],
                drawing,
            )?;
        }

        let present_queue = self.ctx.gpu.queues().present;
        let presented = unsafe {
            self.ctx
                .swapchain
                .present(present_queue, image_index, &[render_complete])?
        };
        if presented.needs_recreate() {
            debug!("Present reported {presented:?}, swapchain will be rebuilt");
        }

        self.ctx.frames.advance();
        self.ctx.frame_count += 1;

        if let Some(delay) = pacing_delay(self.target_frame_time, frame_start.elapsed()) {
            thread::sleep(delay);
        }

        Ok(FrameStatus::Presented)
    }

    fn cleanup(&mut self) {
        self.stats.report(self.ctx.frame_count);

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // Let the app cleanup first
        self.app.cleanup(&mut self.ctx);
        self.ctx.swapchain.release_retired();

        info!("Cleanup complete");
    }
}
