//! Arclight demo: staged transfers plus a paced swapchain clear.
//!
//! Opens a window, pushes a byte pattern through the staging pool and
//! prints its readback checksum, then presents an animated clear color
//! each frame through the pacing ring.
//!
//! ## Options
//!
//! - `--frames <N>`: exit after presenting N frames
//! - `--no-vsync`: prefer a low-latency present mode
//! - `-h, --help`: print this help
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::sync::Arc;
use std::time::Instant;

use arclight_gpu::{
    Buffer, CommandChain, GpuContext, GpuContextBuilder, QueueRole, StagingPool, SurfaceContext,
    Swapchain,
};
use ash::vk;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const STAGING_BUFFERS: usize = 4;
const STAGING_BUFFER_SIZE: u64 = 8 * 1024 * 1024;
const TRANSFER_BYTES: usize = 1024 * 1024;

/// Demo configuration (from CLI or defaults).
#[derive(Debug, Clone)]
struct DemoConfig {
    frames: Option<u64>,
    vsync: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: None,
            vsync: true,
        }
    }
}

impl DemoConfig {
    /// Parse demo parameters from command line arguments.
    fn from_args() -> Self {
        let mut config = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--frames" => {
                    if i + 1 < args.len() {
                        if let Ok(v) = args[i + 1].parse() {
                            config.frames = Some(v);
                            i += 1;
                        }
                    }
                }
                "--no-vsync" => config.vsync = false,
                _ => {}
            }
            i += 1;
        }

        config
    }
}

fn main() -> anyhow::Result<()> {
    // Check for help flag before starting the app
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Arclight demo starting...");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut demo = Demo {
        config: DemoConfig::from_args(),
        state: None,
    };
    event_loop.run_app(&mut demo)?;
    Ok(())
}

fn print_help() {
    eprintln!(
        "Arclight demo

USAGE:
    cargo run -p arclight-demo -- [OPTIONS]

OPTIONS:
    --frames <N>    Exit after presenting N frames
    --no-vsync      Prefer a low-latency present mode
    -h, --help      Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG        Set log level (e.g., info, debug, trace)"
    );
}

struct Demo {
    config: DemoConfig,
    state: Option<DemoState>,
}

struct DemoState {
    window: Arc<Window>,
    surface: SurfaceContext,
    swapchain: Swapchain,
    staging: Arc<StagingPool>,
    chain: CommandChain,
    start: Instant,
    frame_count: u64,
    ctx: GpuContext,
}

impl ApplicationHandler for Demo {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                info!("Demo ready");
                self.state = Some(state);
            }
            Err(e) => {
                error!("Failed to initialize: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let mut done = false;
                if let Some(state) = &mut self.state {
                    match state.render_frame(self.config.frames) {
                        Ok(finished) => done = finished,
                        Err(e) => {
                            error!("Render error: {e}");
                            done = true;
                        }
                    }
                    state.window.request_redraw();
                }
                if done {
                    if let Some(mut state) = self.state.take() {
                        state.cleanup();
                    }
                    event_loop.exit();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.handle_resize(size.width, size.height);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl Demo {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<DemoState> {
        let window_attrs = Window::default_attributes()
            .with_title("Arclight Demo")
            .with_inner_size(PhysicalSize::new(WIDTH, HEIGHT));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let ctx = GpuContextBuilder::new()
            .app_name("arclight-demo")
            .validation(cfg!(debug_assertions))
            .build()?;
        info!("GPU: {}", ctx.capabilities().summary());

        let surface = unsafe { SurfaceContext::from_window(&ctx, window.as_ref())? };
        if !surface.supports_present(&ctx, ctx.graphics_queue().family())? {
            anyhow::bail!("selected GPU cannot present to this surface");
        }

        let size = window.inner_size();
        let swapchain = unsafe {
            Swapchain::new(
                &ctx,
                &surface,
                size.width.max(1),
                size.height.max(1),
                self.config.vsync,
            )?
        };

        let staging = unsafe {
            Arc::new(StagingPool::with_limits(
                &ctx,
                STAGING_BUFFERS,
                STAGING_BUFFER_SIZE,
            )?)
        };
        let mut chain =
            unsafe { CommandChain::new(&ctx, QueueRole::Graphics, Arc::clone(&staging))? };

        run_transfer_check(&ctx, &mut chain)?;

        Ok(DemoState {
            window,
            surface,
            swapchain,
            staging,
            chain,
            start: Instant::now(),
            frame_count: 0,
            ctx,
        })
    }
}

/// Round-trip a byte pattern through staging and log its checksum.
fn run_transfer_check(ctx: &GpuContext, chain: &mut CommandChain) -> anyhow::Result<()> {
    let pattern: Vec<u8> = (0..TRANSFER_BYTES).map(|i| (i % 251) as u8).collect();

    let mut echoed = vec![0u8; pattern.len()];
    unsafe {
        let mut buffer = Buffer::new(
            ctx,
            pattern.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )?;
        chain.copy_to_buffer(ctx, &pattern, &buffer)?;
        let readback = chain.read_buffer(ctx, &buffer, None, 0)?;
        chain.submit(ctx)?;
        chain.synchronize(ctx)?;
        readback.resolve(&mut echoed[..])?;
        buffer.destroy(ctx.device())?;
    }

    if echoed != pattern {
        anyhow::bail!("staged readback does not match the upload");
    }
    let checksum: u64 = echoed.iter().map(|&b| u64::from(b)).sum();
    info!(bytes = echoed.len(), checksum, "staged round trip verified");
    Ok(())
}

impl DemoState {
    /// Acquire, clear with an animated color, submit, present. Returns
    /// true once the configured frame limit is reached.
    fn render_frame(&mut self, limit: Option<u64>) -> anyhow::Result<bool> {
        let t = self.start.elapsed().as_secs_f32();
        let color = [
            t.sin().mul_add(0.5, 0.5),
            (t * 0.7).sin().mul_add(0.5, 0.5),
            (t * 1.3).sin().mul_add(0.5, 0.5),
            1.0,
        ];

        unsafe {
            let frame = self.swapchain.acquire(&self.ctx, &self.surface)?;
            let image = self.swapchain.image_mut(frame.image_index);
            self.chain.clear_image(&self.ctx, image, color)?;
            self.chain
                .transition(&self.ctx, image, vk::ImageLayout::PRESENT_SRC_KHR)?;
            self.chain
                .submit_frame(&self.ctx, self.swapchain.sync(frame.slot))?;
            self.swapchain.present(&self.ctx, &self.surface)?;
        }

        self.frame_count += 1;
        if let Some(limit) = limit {
            if self.frame_count >= limit {
                info!(frames = self.frame_count, "Frame limit reached");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn handle_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.swapchain.resize(width, height);
        info!("Resized to {width}x{height}");
    }

    fn cleanup(&mut self) {
        info!("Starting cleanup...");
        unsafe {
            if let Err(e) = self.ctx.wait_idle() {
                error!("Failed to wait idle: {e}");
            }
            self.chain.destroy(&self.ctx);
            self.swapchain.destroy(&self.ctx, &self.surface);
            if let Err(e) = self.staging.destroy(self.ctx.device()) {
                error!("Failed to destroy staging pool: {e}");
            }
            self.surface.destroy();
        }
        info!("Cleanup complete");
    }
}
