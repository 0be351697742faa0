// =============================================================================
// VULKAN TUTORIAL RENDERER
// =============================================================================
//
// Draws two textured, depth-tested quads spinning about the Z axis, with
// MSAA, mipmapped texture sampling and CPU/GPU frame pacing.
//
// FRAME FLOW (see frame.rs):
// 1. Wait for the current frame slot's fence
// 2. Acquire swapchain image
// 3. Wait for whichever slot last rendered into that image
// 4. Update the image's uniform buffer
// 5. Submit its pre-recorded command buffer
// 6. Present, rebuilding the swapchain if it went stale or the window resized
//
// =============================================================================

mod app;
mod backend;
mod config;
mod content;
mod frame;
mod recorder;
mod renderer;
mod scene;

use anyhow::Result;
use app::App;
use config::Config;
use content::ContentDirs;
use std::path::PathBuf;
use std::process::ExitCode;
use winit::event_loop::EventLoop;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    init_logging();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config = Config::load();
    log::info!("Starting Vulkan renderer");
    log::info!(
        "Window: {}x{}, {} frames in flight",
        config.window.width,
        config.window.height,
        config.graphics.max_frames_in_flight
    );

    // Content is found relative to the executable, not the working directory
    let executable = std::env::args_os()
        .next()
        .map(PathBuf::from)
        .unwrap_or_default();
    let content = ContentDirs::from_executable(&executable);
    log::info!("Content directory: {}", content.root().display());

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, content);
    event_loop.run_app(&mut app)?;
    app.finish()
}

/// Info by default; RUST_LOG overrides.
fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
