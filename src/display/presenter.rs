//! Render-thread presenter: texture upload and per-effect shader programs

use std::collections::HashMap;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, instrument, warn};

use crate::effects::{EffectKind, EffectSelector};
use crate::error::{PipelineError, Result};
use crate::frame::{ChannelLayout, ProcessedFrame};

/// Presenter lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterState {
    Uninitialized,
    ProgramsCompiled,
    Ready,
}

/// Uniform block shared by every effect shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct EffectParams {
    pub factor: f32,
    pub radius: f32,
    pub threshold: f32,
    _pad: f32,
}

impl EffectParams {
    pub fn for_effect(effect: &EffectSelector) -> Self {
        let mut params = Self {
            factor: 1.0,
            ..Self::default()
        };
        match *effect {
            EffectSelector::Contrast { factor } => params.factor = factor,
            EffectSelector::Blur { radius } => params.radius = radius as f32,
            EffectSelector::EdgeDetect { threshold1, .. } => params.threshold = threshold1,
            _ => {}
        }
        params
    }
}

/// GPU operations the presenter needs.
///
/// One texture, one compiled program per effect kind.
pub trait RenderBackend {
    type Program;

    fn compile_program(&mut self, effect: EffectKind) -> Result<Self::Program>;

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()>;

    /// (Re)create the frame texture for `width`x`height` RGBA.
    fn create_texture(&mut self, width: u32, height: u32) -> Result<()>;

    fn upload(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<()>;

    /// Draw the texture through `program`; `None` clears only.
    fn draw(&mut self, program: Option<&Self::Program>, params: &EffectParams) -> Result<()>;

    /// Drop every GPU object created so far.
    fn release(&mut self);
}

/// Result of a successful draw call
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOutcome {
    Drawn,
    /// Nothing uploaded yet
    ClearedOnly,
    /// Requested program failed to build; the previous one was used
    DrawnWithFallback(PipelineError),
}

pub struct GpuPresenter<B: RenderBackend> {
    backend: B,
    state: PresenterState,
    programs: HashMap<EffectKind, B::Program>,
    /// Last program that drew successfully, with the uniforms it drew with
    active: EffectKind,
    active_params: EffectParams,
    texture_dims: Option<(u32, u32)>,
    has_frame: bool,
    /// Luma-to-RGBA expansion buffer, reused across frames
    staging: Vec<u8>,
    released: bool,
}

impl<B: RenderBackend> GpuPresenter<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: PresenterState::Uninitialized,
            programs: HashMap::new(),
            active: EffectKind::Identity,
            active_params: EffectParams::for_effect(&EffectSelector::Identity),
            texture_dims: None,
            has_frame: false,
            staging: Vec::new(),
            released: false,
        }
    }

    pub fn state(&self) -> PresenterState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn has_program(&self, effect: EffectKind) -> bool {
        self.programs.contains_key(&effect)
    }

    /// Build the program table. Kinds that fail are retried when selected;
    /// only a broken Identity program is fatal for the surface.
    #[instrument(skip(self))]
    pub fn surface_created(&mut self) -> Result<()> {
        if self.state != PresenterState::Uninitialized {
            debug!("Surface already initialized");
            return Ok(());
        }

        for kind in EffectKind::ALL {
            match self.backend.compile_program(kind) {
                Ok(program) => {
                    self.programs.insert(kind, program);
                }
                Err(e) if kind == EffectKind::Identity => return Err(e),
                Err(e) => warn!("Program for {} unavailable: {}", kind, e),
            }
        }

        self.active = EffectKind::Identity;
        self.active_params = EffectParams::for_effect(&EffectSelector::Identity);
        self.released = false;
        self.state = PresenterState::ProgramsCompiled;
        info!("Compiled {} of {} effect programs", self.programs.len(), EffectKind::ALL.len());
        Ok(())
    }

    /// Size the drawable. Zero-sized surfaces (minimized windows) are ignored.
    pub fn surface_resized(&mut self, width: u32, height: u32) -> Result<()> {
        if self.state == PresenterState::Uninitialized {
            return Err(PipelineError::ResourceUnavailable("surface not created".into()));
        }
        if width == 0 || height == 0 {
            debug!("Ignoring {}x{} surface", width, height);
            return Ok(());
        }

        self.backend.resize_surface(width, height)?;
        self.state = PresenterState::Ready;
        Ok(())
    }

    /// Upload `frame` (if any) and draw the current texture through the
    /// program for `effect`.
    ///
    /// With no frame the last uploaded texture is drawn again, or the surface
    /// is only cleared if nothing was ever uploaded.
    #[instrument(skip_all, fields(effect = %effect))]
    pub fn upload_and_draw(&mut self, frame: Option<&ProcessedFrame>, effect: &EffectSelector) -> Result<DrawOutcome> {
        if self.state != PresenterState::Ready {
            return Err(PipelineError::ResourceUnavailable(format!(
                "presenter is {:?}",
                self.state
            )));
        }
        let render_start = Instant::now();

        if let Some(frame) = frame {
            self.upload(frame)?;
        }

        if !self.has_frame {
            self.guard(|b| b.draw(None, &EffectParams::default()))?;
            return Ok(DrawOutcome::ClearedOnly);
        }

        let fallback = self.select_program(effect.kind()).err();
        let params = match fallback {
            Some(_) => self.active_params,
            None => EffectParams::for_effect(effect),
        };

        let active = self.active;
        let Self {
            backend, programs, ..
        } = self;
        let draw = backend.draw(programs.get(&active), &params);
        if let Err(e) = draw {
            return Err(self.lost_on(e));
        }
        self.active_params = params;

        metrics::histogram!("render_time_us").record(render_start.elapsed().as_micros() as f64);
        Ok(match fallback {
            Some(e) => DrawOutcome::DrawnWithFallback(e),
            None => DrawOutcome::Drawn,
        })
    }

    /// Forget every GPU object; drawing resumes after `surface_created` and
    /// `surface_resized`.
    pub fn context_lost(&mut self) {
        warn!("GPU context lost, rendering paused");
        self.programs.clear();
        self.texture_dims = None;
        self.has_frame = false;
        self.state = PresenterState::Uninitialized;
        self.backend.release();
        self.released = true;
    }

    /// Release GPU resources. Safe to call more than once; returns whether
    /// anything was released.
    pub fn teardown(&mut self) -> bool {
        if self.released {
            self.staging = Vec::new();
            return false;
        }
        self.programs.clear();
        self.texture_dims = None;
        self.has_frame = false;
        self.staging = Vec::new();
        self.state = PresenterState::Uninitialized;
        self.backend.release();
        self.released = true;
        info!("Presenter torn down");
        true
    }

    fn upload(&mut self, frame: &ProcessedFrame) -> Result<()> {
        let (width, height) = frame.dims();
        let expected = frame.stride() * height as usize;
        if width == 0 || height == 0 || frame.pixels.len() != expected {
            return Err(PipelineError::DimensionMismatch(format!(
                "{}x{} {:?} frame with {} bytes",
                width,
                height,
                frame.layout,
                frame.pixels.len()
            )));
        }

        if self.texture_dims != Some((width, height)) {
            self.guard(|b| b.create_texture(width, height))?;
            self.texture_dims = Some((width, height));
            debug!("Frame texture is now {}x{}", width, height);
        }

        let rgba: &[u8] = match frame.layout {
            ChannelLayout::Rgba => &frame.pixels[..],
            ChannelLayout::Luma => {
                self.staging.clear();
                self.staging
                    .extend(frame.pixels.iter().flat_map(|&l| [l, l, l, 255]));
                &self.staging[..]
            }
        };
        if let Err(e) = self.backend.upload(rgba, width, height) {
            return Err(self.lost_on(e));
        }
        self.has_frame = true;
        Ok(())
    }

    /// Make `kind` the active program, compiling it if missing. On failure
    /// the previous program stays active.
    fn select_program(&mut self, kind: EffectKind) -> Result<()> {
        if !self.programs.contains_key(&kind) {
            match self.backend.compile_program(kind) {
                Ok(program) => {
                    self.programs.insert(kind, program);
                }
                Err(e) => {
                    warn!("Keeping {} program: {}", self.active, e);
                    return Err(e);
                }
            }
        }
        self.active = kind;
        Ok(())
    }

    fn guard(&mut self, op: impl FnOnce(&mut B) -> Result<()>) -> Result<()> {
        op(&mut self.backend).map_err(|e| self.lost_on(e))
    }

    /// Backend failures that mean the context is gone pause rendering.
    fn lost_on(&mut self, e: PipelineError) -> PipelineError {
        if matches!(e, PipelineError::ResourceUnavailable(_)) {
            self.context_lost();
        }
        e
    }
}

impl<B: RenderBackend> Drop for GpuPresenter<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Compile(EffectKind),
        Resize(u32, u32),
        CreateTexture(u32, u32),
        Upload(Vec<u8>),
        Draw(Option<EffectKind>, EffectParams),
        Release,
    }

    /// Records every call; selected kinds fail to compile.
    #[derive(Default)]
    pub struct MockBackend {
        pub calls: Vec<Call>,
        pub broken: HashSet<EffectKind>,
        pub lose_context_on_draw: bool,
    }

    impl MockBackend {
        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }

        pub fn last_draw(&self) -> Option<&Call> {
            self.calls.iter().rev().find(|c| matches!(c, Call::Draw(..)))
        }
    }

    impl RenderBackend for MockBackend {
        type Program = EffectKind;

        fn compile_program(&mut self, effect: EffectKind) -> Result<EffectKind> {
            self.calls.push(Call::Compile(effect));
            if self.broken.contains(&effect) {
                return Err(PipelineError::ShaderLink {
                    effect: effect.to_string(),
                    message: "mock link failure".into(),
                });
            }
            Ok(effect)
        }

        fn resize_surface(&mut self, width: u32, height: u32) -> Result<()> {
            self.calls.push(Call::Resize(width, height));
            Ok(())
        }

        fn create_texture(&mut self, width: u32, height: u32) -> Result<()> {
            self.calls.push(Call::CreateTexture(width, height));
            Ok(())
        }

        fn upload(&mut self, rgba: &[u8], _width: u32, _height: u32) -> Result<()> {
            self.calls.push(Call::Upload(rgba.to_vec()));
            Ok(())
        }

        fn draw(&mut self, program: Option<&EffectKind>, params: &EffectParams) -> Result<()> {
            if self.lose_context_on_draw {
                return Err(PipelineError::ResourceUnavailable("mock device lost".into()));
            }
            self.calls.push(Call::Draw(program.copied(), *params));
            Ok(())
        }

        fn release(&mut self) {
            self.calls.push(Call::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Call, MockBackend};
    use super::*;

    fn frame(width: u32, height: u32, layout: ChannelLayout) -> ProcessedFrame {
        let len = (width * height) as usize * layout.channels();
        ProcessedFrame {
            pixels: vec![7u8; len].into(),
            width,
            height,
            layout,
            generation: 1,
            timestamp: Instant::now(),
            effect: EffectKind::Identity,
        }
    }

    fn ready(backend: MockBackend) -> GpuPresenter<MockBackend> {
        let mut presenter = GpuPresenter::new(backend);
        presenter.surface_created().unwrap();
        presenter.surface_resized(640, 480).unwrap();
        presenter
    }

    #[test]
    fn lifecycle_reaches_ready() {
        let mut presenter = GpuPresenter::new(MockBackend::default());
        assert_eq!(presenter.state(), PresenterState::Uninitialized);
        assert!(presenter.surface_resized(10, 10).is_err());

        presenter.surface_created().unwrap();
        assert_eq!(presenter.state(), PresenterState::ProgramsCompiled);
        presenter.surface_resized(0, 0).unwrap();
        assert_eq!(presenter.state(), PresenterState::ProgramsCompiled);

        presenter.surface_resized(320, 240).unwrap();
        assert_eq!(presenter.state(), PresenterState::Ready);

        // Programs are built once.
        presenter.surface_created().unwrap();
        let compiles = presenter.backend().count(|c| matches!(c, Call::Compile(_)));
        assert_eq!(compiles, EffectKind::ALL.len());
    }

    #[test]
    fn no_frame_clears_only() {
        let mut presenter = ready(MockBackend::default());
        let outcome = presenter.upload_and_draw(None, &EffectSelector::Sepia).unwrap();
        assert_eq!(outcome, DrawOutcome::ClearedOnly);
        assert_eq!(
            presenter.backend().last_draw(),
            Some(&Call::Draw(None, EffectParams::default()))
        );
    }

    #[test]
    fn drawing_before_ready_is_unavailable() {
        let mut presenter = GpuPresenter::new(MockBackend::default());
        presenter.surface_created().unwrap();
        assert!(matches!(
            presenter.upload_and_draw(None, &EffectSelector::Identity),
            Err(PipelineError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn texture_is_recreated_only_on_geometry_change() {
        let mut presenter = ready(MockBackend::default());
        let a = frame(4, 2, ChannelLayout::Rgba);
        presenter.upload_and_draw(Some(&a), &EffectSelector::Identity).unwrap();
        presenter.upload_and_draw(Some(&a), &EffectSelector::Invert).unwrap();
        presenter
            .upload_and_draw(Some(&frame(2, 4, ChannelLayout::Rgba)), &EffectSelector::Invert)
            .unwrap();

        let backend = presenter.backend();
        assert_eq!(backend.count(|c| matches!(c, Call::CreateTexture(..))), 2);
        assert_eq!(backend.count(|c| matches!(c, Call::Upload(_))), 3);
    }

    #[test]
    fn redraw_without_new_frame_reuses_texture() {
        let mut presenter = ready(MockBackend::default());
        presenter
            .upload_and_draw(Some(&frame(2, 2, ChannelLayout::Rgba)), &EffectSelector::Identity)
            .unwrap();
        let outcome = presenter.upload_and_draw(None, &EffectSelector::Identity).unwrap();
        assert_eq!(outcome, DrawOutcome::Drawn);
        assert_eq!(presenter.backend().count(|c| matches!(c, Call::Upload(_))), 1);
    }

    #[test]
    fn luma_frames_are_expanded() {
        let mut presenter = ready(MockBackend::default());
        presenter
            .upload_and_draw(Some(&frame(2, 1, ChannelLayout::Luma)), &EffectSelector::Identity)
            .unwrap();
        assert!(presenter
            .backend()
            .calls
            .contains(&Call::Upload(vec![7, 7, 7, 255, 7, 7, 7, 255])));
    }

    #[test]
    fn uniforms_carry_effect_parameters() {
        let mut presenter = ready(MockBackend::default());
        presenter
            .upload_and_draw(Some(&frame(3, 3, ChannelLayout::Rgba)), &EffectSelector::edge_detect(42.0))
            .unwrap();
        let Some(Call::Draw(Some(kind), params)) = presenter.backend().last_draw().cloned() else {
            panic!("no draw recorded");
        };
        assert_eq!(kind, EffectKind::EdgeDetect);
        assert_eq!(params.threshold, 42.0);
    }

    #[test]
    fn broken_program_keeps_previous_one() {
        let mut backend = MockBackend::default();
        backend.broken.insert(EffectKind::Blur);
        let mut presenter = ready(backend);
        assert!(!presenter.has_program(EffectKind::Blur));

        let f = frame(2, 2, ChannelLayout::Rgba);
        presenter.upload_and_draw(Some(&f), &EffectSelector::Sepia).unwrap();
        let outcome = presenter
            .upload_and_draw(Some(&f), &EffectSelector::Blur { radius: 2 })
            .unwrap();

        assert!(matches!(
            outcome,
            DrawOutcome::DrawnWithFallback(PipelineError::ShaderLink { .. })
        ));
        assert!(matches!(
            presenter.backend().last_draw(),
            Some(Call::Draw(Some(EffectKind::Sepia), _))
        ));
    }

    #[test]
    fn fallback_keeps_previous_uniforms() {
        let mut backend = MockBackend::default();
        backend.broken.insert(EffectKind::Blur);
        let mut presenter = ready(backend);

        let f = frame(2, 2, ChannelLayout::Rgba);
        presenter
            .upload_and_draw(Some(&f), &EffectSelector::Contrast { factor: 1.5 })
            .unwrap();
        for _ in 0..2 {
            let outcome = presenter
                .upload_and_draw(Some(&f), &EffectSelector::Blur { radius: 4 })
                .unwrap();
            assert!(matches!(outcome, DrawOutcome::DrawnWithFallback(_)));

            let Some(Call::Draw(Some(kind), params)) = presenter.backend().last_draw().cloned() else {
                panic!("no draw recorded");
            };
            assert_eq!(kind, EffectKind::Contrast);
            assert_eq!(params.factor, 1.5);
            assert_eq!(params.radius, 0.0);
        }
    }

    #[test]
    fn missing_program_is_rebuilt_on_selection() {
        let mut backend = MockBackend::default();
        backend.broken.insert(EffectKind::Contrast);
        let mut presenter = ready(backend);

        presenter.backend_mut().broken.clear();
        let f = frame(2, 2, ChannelLayout::Rgba);
        let outcome = presenter
            .upload_and_draw(Some(&f), &EffectSelector::Contrast { factor: 2.0 })
            .unwrap();
        assert_eq!(outcome, DrawOutcome::Drawn);
        assert!(presenter.has_program(EffectKind::Contrast));
    }

    #[test]
    fn broken_identity_fails_surface_creation() {
        let mut backend = MockBackend::default();
        backend.broken.insert(EffectKind::Identity);
        let mut presenter = GpuPresenter::new(backend);
        assert!(matches!(
            presenter.surface_created(),
            Err(PipelineError::ShaderLink { .. })
        ));
        assert_eq!(presenter.state(), PresenterState::Uninitialized);
    }

    #[test]
    fn context_loss_pauses_until_recreated() {
        let mut presenter = ready(MockBackend::default());
        let f = frame(2, 2, ChannelLayout::Rgba);
        presenter.backend_mut().lose_context_on_draw = true;
        assert!(matches!(
            presenter.upload_and_draw(Some(&f), &EffectSelector::Identity),
            Err(PipelineError::ResourceUnavailable(_))
        ));
        assert_eq!(presenter.state(), PresenterState::Uninitialized);

        presenter.backend_mut().lose_context_on_draw = false;
        presenter.surface_created().unwrap();
        presenter.surface_resized(640, 480).unwrap();
        assert_eq!(
            presenter.upload_and_draw(Some(&f), &EffectSelector::Identity).unwrap(),
            DrawOutcome::Drawn
        );
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut presenter = ready(MockBackend::default());
        assert!(presenter.teardown());
        assert!(!presenter.teardown());
        assert_eq!(presenter.backend().count(|c| matches!(c, Call::Release)), 1);
        assert_eq!(presenter.state(), PresenterState::Uninitialized);
    }

    #[test]
    fn context_loss_then_teardown_releases_once() {
        let mut presenter = ready(MockBackend::default());
        presenter.context_lost();
        assert!(!presenter.teardown());
        assert_eq!(presenter.backend().count(|c| matches!(c, Call::Release)), 1);

        // A rebuilt surface owns new resources again.
        presenter.surface_created().unwrap();
        assert!(presenter.teardown());
        assert_eq!(presenter.backend().count(|c| matches!(c, Call::Release)), 2);
    }

    #[test]
    fn bad_geometry_is_rejected_before_upload() {
        let mut presenter = ready(MockBackend::default());
        let mut f = frame(2, 2, ChannelLayout::Rgba);
        f.width = 3;
        assert!(matches!(
            presenter.upload_and_draw(Some(&f), &EffectSelector::Identity),
            Err(PipelineError::DimensionMismatch(_))
        ));
        assert_eq!(presenter.state(), PresenterState::Ready);
    }
}
