//! winit event loop driving the presenter on the render thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::error::EventLoopError;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop, EventLoopProxy};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

use crate::display::gpu::WgpuBackend;
use crate::display::presenter::{DrawOutcome, GpuPresenter, PresenterState};
use crate::effects::{EffectKind, EffectSelector};
use crate::error::PipelineError;
use crate::pipeline::{EffectControl, FrameSlot, LogSink, StatusSink, StatusUpdate};
use crate::DisplayConfig;

/// Events posted to the render thread from other threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    /// A new frame was published to the slot
    FrameReady,
    Shutdown,
}

/// Keyboard commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Select(EffectKind),
    ToggleStage,
    Quit,
}

/// `1`-`7` pick an effect, `G` flips CPU/GPU filtering, `Esc`/`Q` quits.
pub fn key_action(key: &Key) -> Option<KeyAction> {
    match key {
        Key::Named(NamedKey::Escape) => Some(KeyAction::Quit),
        Key::Character(c) => match c.as_str() {
            "g" | "G" => Some(KeyAction::ToggleStage),
            "q" | "Q" => Some(KeyAction::Quit),
            digit => {
                let n: usize = digit.parse().ok()?;
                EffectKind::ALL.get(n.checked_sub(1)?).copied().map(KeyAction::Select)
            }
        },
        _ => None,
    }
}

pub fn event_loop() -> Result<EventLoop<UserEvent>, EventLoopError> {
    let event_loop = EventLoop::<UserEvent>::with_user_event().build()?;
    event_loop.set_control_flow(ControlFlow::Wait);
    Ok(event_loop)
}

/// Wakes the render thread after a publish; silently ignored once the loop
/// has exited.
pub fn frame_ready_notifier(proxy: EventLoopProxy<UserEvent>) -> impl Fn() + Send + 'static {
    move || {
        let _ = proxy.send_event(UserEvent::FrameReady);
    }
}

pub struct DisplayApp {
    config: DisplayConfig,
    slot: Arc<FrameSlot>,
    control: Arc<EffectControl>,
    status: Arc<dyn StatusSink>,
    updates: flume::Receiver<StatusUpdate>,
    shutdown: Arc<AtomicBool>,
    window: Option<Arc<Window>>,
    presenter: Option<GpuPresenter<WgpuBackend>>,
    /// Effect baked into the texture currently on the GPU
    baked: EffectKind,
    fps: Option<f32>,
    paused: bool,
}

impl DisplayApp {
    pub fn new(
        config: DisplayConfig,
        slot: Arc<FrameSlot>,
        control: Arc<EffectControl>,
        status: Arc<dyn StatusSink>,
        updates: flume::Receiver<StatusUpdate>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            slot,
            control,
            status,
            updates,
            shutdown,
            window: None,
            presenter: None,
            baked: EffectKind::Identity,
            fps: None,
            paused: false,
        }
    }

    fn create_presenter(&mut self, window: Arc<Window>) {
        match pollster::block_on(WgpuBackend::new(window, &self.config)) {
            Ok(backend) => self.presenter = Some(GpuPresenter::new(backend)),
            Err(e) => self.pause(e),
        }
    }

    /// Bring the presenter to Ready after creation or context loss.
    fn recover(&mut self) {
        let Some(window) = self.window.clone() else {
            return;
        };
        let Some(presenter) = self.presenter.as_mut() else {
            return;
        };
        let size = window.inner_size();
        let ready = presenter
            .surface_created()
            .and_then(|_| presenter.surface_resized(size.width, size.height));
        match ready {
            Ok(()) => {
                if self.paused {
                    info!("Rendering resumed");
                }
                self.paused = false;
                window.request_redraw();
            }
            Err(e) => self.pause(e),
        }
    }

    fn pause(&mut self, reason: PipelineError) {
        if !self.paused {
            error!("Rendering paused: {}", reason);
            self.status.publish(StatusUpdate::RenderPaused(reason));
        }
        self.paused = true;
    }

    fn redraw(&mut self) {
        let Some(presenter) = self.presenter.as_mut() else {
            return;
        };
        if presenter.state() == PresenterState::Uninitialized {
            return;
        }

        let frame = self.slot.take_latest();
        if let Some(frame) = &frame {
            self.baked = frame.effect;
            metrics::histogram!("frame_latency_ms").record(frame.timestamp.elapsed().as_secs_f64() * 1000.0);
        }
        let effect = self.control.gpu_effect(self.baked);

        match presenter.upload_and_draw(frame.as_ref(), &effect) {
            Ok(DrawOutcome::Drawn | DrawOutcome::ClearedOnly) => {}
            Ok(DrawOutcome::DrawnWithFallback(e)) => {
                self.status.publish(StatusUpdate::ShaderFallback(e));
            }
            Err(e @ PipelineError::ResourceUnavailable(_)) => self.pause(e),
            Err(reason) => {
                warn!("Frame not drawn: {}", reason);
                if let Some(frame) = frame {
                    self.status.publish(StatusUpdate::FrameDropped {
                        sequence: frame.generation,
                        reason,
                    });
                }
            }
        }
    }

    fn drain_updates(&mut self) {
        let mut title_changed = false;
        for update in self.updates.try_iter() {
            if let StatusUpdate::Fps(fps) = update {
                self.fps = Some(fps);
                title_changed = true;
            }
            LogSink.publish(update);
        }
        if title_changed {
            self.update_title();
        }
    }

    fn update_title(&self) {
        let Some(window) = &self.window else {
            return;
        };
        let fps = self.fps.map(|f| format!("{f:.1} fps")).unwrap_or_else(|| "-- fps".into());
        window.set_title(&format!(
            "{} | {} on {:?} | {}",
            self.config.title,
            self.control.effect(),
            self.control.filter_stage(),
            fps
        ));
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, action: KeyAction) {
        match action {
            KeyAction::Select(kind) => self.control.set_effect(EffectSelector::from(kind)),
            KeyAction::ToggleStage => {
                self.control.toggle_filter_stage();
            }
            KeyAction::Quit => {
                self.close(event_loop);
                return;
            }
        }
        self.update_title();
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn close(&mut self, event_loop: &ActiveEventLoop) {
        self.shutdown.store(true, Ordering::Release);
        event_loop.exit();
    }

    /// Release the held frame and GPU resources; idempotent.
    fn teardown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.slot.clear();
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.teardown();
        }
    }
}

impl ApplicationHandler<UserEvent> for DisplayApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window_attrs = Window::default_attributes()
                .with_title(self.config.title.clone())
                .with_inner_size(LogicalSize::new(self.config.width, self.config.height))
                .with_fullscreen(if self.config.fullscreen {
                    Some(winit::window::Fullscreen::Borderless(None))
                } else {
                    None
                });

            let window = match event_loop.create_window(window_attrs) {
                Ok(window) => Arc::new(window),
                Err(e) => {
                    error!("Failed to create window: {}", e);
                    self.close(event_loop);
                    return;
                }
            };
            self.window = Some(window.clone());
            self.create_presenter(window);
        }

        if self
            .presenter
            .as_ref()
            .is_some_and(|p| p.state() != PresenterState::Ready)
        {
            self.recover();
        }
        self.update_title();
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: UserEvent) {
        match event {
            UserEvent::FrameReady => {
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
                self.drain_updates();
            }
            UserEvent::Shutdown => {
                info!("Shutdown requested");
                self.close(event_loop);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window close requested");
                self.close(event_loop);
            }
            WindowEvent::RedrawRequested => self.redraw(),
            WindowEvent::Resized(size) => {
                debug!("Window resized to {}x{}", size.width, size.height);
                let Some(presenter) = self.presenter.as_mut() else {
                    return;
                };
                if presenter.state() == PresenterState::Uninitialized {
                    self.recover();
                } else if let Err(e) = presenter.surface_resized(size.width, size.height) {
                    self.pause(e);
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed && !event.repeat {
                    if let Some(action) = key_action(&event.logical_key) {
                        self.handle_key(event_loop, action);
                    }
                }
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.teardown();
        self.drain_updates();
    }
}
