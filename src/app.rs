// =============================================================================
// APPLICATION - Window lifecycle and event handling
// =============================================================================
//
// Only two window events matter: close ends the loop, resize marks the
// swapchain for rebuilding. Everything else is ignored. Rendering runs on
// every RedrawRequested, and a new redraw is requested whenever the loop
// goes idle, unless the window has no drawable area.

use anyhow::{Context, Result};
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    window::{Window, WindowAttributes, WindowId},
};

use crate::config::Config;
use crate::content::ContentDirs;
use crate::frame::FrameStatus;
use crate::renderer::Renderer;

pub struct App {
    config: Config,
    content: ContentDirs,

    // Renderer before window: it must be gone before the window closes
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    /// Set while the window is minimized; no redraws are requested
    paused: bool,
    frame_count: u64,
    /// First fatal error; ends the event loop
    error: Option<anyhow::Error>,
}

impl App {
    pub fn new(config: Config, content: ContentDirs) -> Self {
        Self {
            config,
            content,
            renderer: None,
            window: None,
            paused: false,
            frame_count: 0,
            error: None,
        }
    }

    /// Consume the app after the event loop returns.
    pub fn finish(mut self) -> Result<()> {
        log::info!("Rendered {} frames", self.frame_count);
        // Tear the renderer down before the window goes
        self.renderer = None;
        self.window = None;
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        self.record_error(error);
        event_loop.exit();
    }

    /// Keep the first error; `main` logs it once after the loop exits.
    fn record_error(&mut self, error: anyhow::Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(self.config.window.resizable);

        let window = Arc::new(
            event_loop
                .create_window(window_attributes)
                .context("Failed to create window")?,
        );

        let renderer = Renderer::new(window.clone(), &self.config, &self.content)
            .context("Failed to initialize Vulkan")?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        match renderer.draw_frame() {
            Ok(FrameStatus::Presented { .. }) => self.frame_count += 1,
            Ok(FrameStatus::PresentedAndRecreated { .. }) => {
                self.frame_count += 1;
                self.paused = false;
            }
            Ok(FrameStatus::PresentedAndDeferred { .. }) => {
                self.frame_count += 1;
                self.paused = true;
            }
            Ok(FrameStatus::Recreated) => self.paused = false,
            Ok(FrameStatus::Deferred) => self.paused = true,
            Err(e) => self.fail(event_loop, e.context("Failed to draw frame")),
        }
    }
}

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(renderer) = &self.renderer {
                    if let Err(e) = renderer.wait_idle() {
                        log::error!("{:#}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.notify_resized();
                }
                // A minimized window is retried once it gets its area back
                self.paused = false;
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn app() -> App {
        App::new(
            Config::default(),
            ContentDirs::from_executable(Path::new("/opt/vk-tutorial/vk-tutorial")),
        )
    }

    #[test]
    fn finish_returns_the_first_error() {
        let mut app = app();
        app.record_error(anyhow::anyhow!("device lost"));
        app.record_error(anyhow::anyhow!("swapchain gone"));

        let err = app.finish().unwrap_err();
        assert_eq!(err.to_string(), "device lost");
    }

    #[test]
    fn finish_without_errors_is_clean() {
        assert!(app().finish().is_ok());
    }
}
