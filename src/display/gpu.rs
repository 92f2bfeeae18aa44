//! WebGPU backend for the presenter

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use wgpu::*;
use winit::window::Window;

use crate::display::presenter::{EffectParams, RenderBackend};
use crate::effects::EffectKind;
use crate::error::{PipelineError, Result};
use crate::{DisplayConfig, GpuBackend};

const SHADER_SOURCE: &str = include_str!("shaders.wgsl");

fn unavailable(what: impl std::fmt::Display) -> PipelineError {
    PipelineError::ResourceUnavailable(what.to_string())
}

fn backends(backend: GpuBackend) -> Backends {
    match backend {
        GpuBackend::Vulkan => Backends::VULKAN,
        GpuBackend::Metal => Backends::METAL,
        GpuBackend::Dx12 => Backends::DX12,
        GpuBackend::OpenGl => Backends::GL,
        GpuBackend::Auto => Backends::all(),
    }
}

/// Frame texture and the bind group that samples it
struct FrameTexture {
    texture: Texture,
    bind_group: BindGroup,
    width: u32,
    height: u32,
}

/// wgpu device, window surface and the shared shader inputs
pub struct WgpuBackend {
    device: Device,
    queue: Queue,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    bind_group_layout: BindGroupLayout,
    pipeline_layout: PipelineLayout,
    params: Buffer,
    shader: Option<ShaderModule>,
    frame: Option<FrameTexture>,
    pub window: Arc<Window>,
}

impl WgpuBackend {
    /// Open the GPU for `window`
    #[instrument(skip(window, config))]
    pub async fn new(window: Arc<Window>, config: &DisplayConfig) -> Result<Self> {
        info!("Initializing WebGPU display");

        let instance = Instance::new(InstanceDescriptor {
            backends: backends(config.backend),
            ..Default::default()
        });

        let surface = instance.create_surface(window.clone()).map_err(unavailable)?;

        // Get adapter - prefer high-performance
        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| unavailable("no suitable GPU adapter found"))?;

        info!("GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("fxcam device"),
                    required_features: Features::empty(),
                    required_limits: Limits::downlevel_defaults().using_resolution(adapter.limits()),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(unavailable)?;

        // Frames are already display-encoded, so skip sRGB conversion when we can.
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or_else(|| unavailable("surface reports no formats"))?;

        let size = window.inner_size();
        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if config.vsync {
                PresentMode::AutoVsync
            } else {
                PresentMode::AutoNoVsync
            },
            alpha_mode: surface_caps.alpha_modes.first().copied().unwrap_or(CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("Frame Bind Group Layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: false },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("Effect Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let params = device.create_buffer(&BufferDescriptor {
            label: Some("Effect Params"),
            size: std::mem::size_of::<EffectParams>() as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            bind_group_layout,
            pipeline_layout,
            params,
            shader: None,
            frame: None,
            window,
        })
    }
}

impl RenderBackend for WgpuBackend {
    type Program = RenderPipeline;

    fn compile_program(&mut self, effect: EffectKind) -> Result<RenderPipeline> {
        let entry_point = format!("fs_{}", effect.name());
        let format = self.surface_config.format;

        self.device.push_error_scope(ErrorFilter::Validation);
        let device = &self.device;
        let shader: &ShaderModule = self.shader.get_or_insert_with(|| {
            device.create_shader_module(ShaderModuleDescriptor {
                label: Some("Effect Shaders"),
                source: ShaderSource::Wgsl(SHADER_SOURCE.into()),
            })
        });
        let pipeline = self.device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(entry_point.as_str()),
            layout: Some(&self.pipeline_layout),
            cache: None,
            vertex: VertexState {
                module: shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(FragmentState {
                module: shader,
                entry_point: Some(entry_point.as_str()),
                compilation_options: Default::default(),
                targets: &[Some(ColorTargetState {
                    format,
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState::default(),
            multiview: None,
        });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(PipelineError::ShaderLink {
                effect: effect.to_string(),
                message: error.to_string(),
            });
        }
        debug!("Compiled {}", entry_point);
        Ok(pipeline)
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()> {
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<()> {
        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some("Frame Texture"),
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Frame Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: self.params.as_entire_binding(),
                },
            ],
        });

        self.frame = Some(FrameTexture {
            texture,
            bind_group,
            width,
            height,
        });
        Ok(())
    }

    fn upload(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<()> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| unavailable("no frame texture"))?;
        if (frame.width, frame.height) != (width, height) {
            return Err(PipelineError::DimensionMismatch(format!(
                "{}x{} upload into {}x{} texture",
                width, height, frame.width, frame.height
            )));
        }

        self.queue.write_texture(
            ImageCopyTexture {
                texture: &frame.texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            rgba,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn draw(&mut self, program: Option<&RenderPipeline>, params: &EffectParams) -> Result<()> {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(SurfaceError::Lost | SurfaceError::Outdated) => {
                // Skip this frame; the next one draws into the fresh surface.
                self.surface.configure(&self.device, &self.surface_config);
                return Ok(());
            }
            Err(SurfaceError::Timeout) => {
                warn!("Surface acquire timed out");
                return Ok(());
            }
            Err(e) => return Err(unavailable(e)),
        };
        let view = output.texture.create_view(&TextureViewDescriptor::default());

        self.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(params));

        let mut encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("Render Encoder"),
        });

        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(Color::BLACK),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            if let (Some(pipeline), Some(frame)) = (program, &self.frame) {
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, &frame.bind_group, &[]);
                render_pass.draw(0..3, 0..1); // Fullscreen triangle
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        self.window.pre_present_notify();
        output.present();
        Ok(())
    }

    fn release(&mut self) {
        self.frame = None;
        self.shader = None;
    }
}
