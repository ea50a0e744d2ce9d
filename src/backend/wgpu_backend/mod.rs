//! wgpu backend implementation

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// First attachment view of `desc` (color, resolve or depth) that `known`
/// rejects
fn unknown_attachment(
    desc: &RenderPassDescriptor,
    known: impl Fn(TextureViewHandle) -> bool,
) -> Option<TextureViewHandle> {
    desc.color_attachments
        .iter()
        .flat_map(|att| std::iter::once(att.view).chain(att.resolve_target))
        .chain(desc.depth_stencil_attachment.as_ref().map(|att| att.view))
        .find(|&view| !known(view))
}

/// Buffered render pass command
#[derive(Clone)]
enum RenderCommand {
    SetPipeline(RenderPipelineHandle),
    SetBindGroup { index: u32, bind_group: BindGroupHandle },
    SetVertexBuffer { slot: u32, buffer: BufferHandle, offset: u64 },
    SetIndexBuffer { buffer: BufferHandle, offset: u64, format: IndexFormat },
    SetViewport { x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32 },
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, base_vertex: i32, instances: Range<u32> },
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    descriptor: RenderPassDescriptor,
    commands: Vec<RenderCommand>,
}

/// Where finished frames go
enum Presentation {
    /// Window surface; the view handle is re-issued every frame
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        current_texture: Option<wgpu::SurfaceTexture>,
        current_view_id: u64,
    },
    /// Offscreen texture standing in for the swapchain
    Headless {
        texture: TextureHandle,
        view: TextureViewHandle,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    },
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    presentation: Presentation,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, (wgpu::Texture, TextureDescriptor)>,
    texture_views: HashMap<u64, (wgpu::TextureView, wgpu::TextureFormat)>,
    samplers: HashMap<u64, wgpu::Sampler>,
    bind_group_layouts: HashMap<u64, wgpu::BindGroupLayout>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,

    // Handle counters
    next_buffer_id: u64,
    next_texture_id: u64,
    next_view_id: u64,
    next_sampler_id: u64,
    next_layout_id: u64,
    next_bind_group_id: u64,
    next_render_pipeline_id: u64,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,

    // Commands are buffered here and executed on end_render_pass
    pending_render_pass: Option<PendingRenderPass>,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        }
    }

    fn convert_texture_format_back(format: wgpu::TextureFormat) -> TextureFormat {
        match format {
            wgpu::TextureFormat::R8Unorm => TextureFormat::R8Unorm,
            wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
            wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
            wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Depth32Float => TextureFormat::Depth32Float,
            wgpu::TextureFormat::Depth24PlusStencil8 => TextureFormat::Depth24PlusStencil8,
            _ => TextureFormat::Rgba8Unorm,
        }
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        result
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_view_dimension(dimension: TextureViewDimension) -> wgpu::TextureViewDimension {
        match dimension {
            TextureViewDimension::D2 => wgpu::TextureViewDimension::D2,
            TextureViewDimension::Cube => wgpu::TextureViewDimension::Cube,
        }
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        }
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
        match mode {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }

    fn convert_load_op<V: Copy>(op: &LoadOp, clear: V) -> wgpu::LoadOp<V> {
        match op {
            LoadOp::Clear(_) => wgpu::LoadOp::Clear(clear),
            LoadOp::Load => wgpu::LoadOp::Load,
        }
    }

    fn convert_store_op(op: StoreOp) -> wgpu::StoreOp {
        match op {
            StoreOp::Store => wgpu::StoreOp::Store,
            StoreOp::Discard => wgpu::StoreOp::Discard,
        }
    }

    /// Lost and outdated surfaces need reconfiguring; a timeout only costs
    /// the current frame
    fn convert_surface_error(e: wgpu::SurfaceError) -> BackendError {
        match e {
            wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => BackendError::SurfaceLost,
            wgpu::SurfaceError::Timeout => BackendError::SurfaceTimeout,
            wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
            #[allow(unreachable_patterns)]
            other => BackendError::AcquireImageFailed(other.to_string()),
        }
    }

    /// Clamp to device limits while maintaining aspect ratio
    fn clamp_extent(max_size: u32, width: u32, height: u32) -> (u32, u32) {
        if width > max_size || height > max_size {
            let scale = (max_size as f32 / width as f32).min(max_size as f32 / height as f32);
            (
                ((width as f32 * scale) as u32).max(1),
                ((height as f32 * scale) as u32).max(1),
            )
        } else {
            (width.max(1), height.max(1))
        }
    }
}

impl WgpuBackend {
    /// Create a backend presenting to `window`
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    /// Create a backend that renders frames into an offscreen texture
    pub fn new_headless(width: u32, height: u32) -> BackendResult<Self> {
        pollster::block_on(Self::new_headless_async(width, height))
    }

    pub async fn new_async(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: Self::preferred_backends(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

        let adapter = Self::request_adapter(&instance, Some(&surface)).await?;
        let (device, queue) = Self::request_device(&adapter).await?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| {
                BackendError::SurfaceCreationFailed("surface reports no formats".into())
            })?;

        let present_mode = if vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };

        let (width, height) =
            Self::clamp_extent(device.limits().max_texture_dimension_2d, size.width, size.height);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        surface.configure(&device, &config);

        Ok(Self::assemble(
            instance,
            adapter,
            device,
            queue,
            Presentation::Surface {
                surface,
                config,
                current_texture: None,
                current_view_id: 0,
            },
        ))
    }

    pub async fn new_headless_async(width: u32, height: u32) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: Self::preferred_backends(),
            ..Default::default()
        });

        let adapter = Self::request_adapter(&instance, None).await?;
        let (device, queue) = Self::request_device(&adapter).await?;

        let placeholder = Presentation::Headless {
            texture: TextureHandle(0),
            view: TextureViewHandle(0),
            format: wgpu::TextureFormat::Rgba8Unorm,
            width,
            height,
        };
        let mut backend = Self::assemble(instance, adapter, device, queue, placeholder);
        backend.presentation = backend.create_headless_target(width, height)?;
        Ok(backend)
    }

    fn assemble(
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        presentation: Presentation,
    ) -> Self {
        Self {
            instance,
            adapter,
            device,
            queue,
            presentation,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            next_buffer_id: 1,
            next_texture_id: 1,
            next_view_id: 1,
            next_sampler_id: 1,
            next_layout_id: 1,
            next_bind_group_id: 1,
            next_render_pipeline_id: 1,
            encoder: None,
            pending_render_pass: None,
        }
    }

    fn preferred_backends() -> wgpu::Backends {
        // On Windows, try Vulkan first to avoid D3D12 debug layer validation errors
        if std::env::var("WGPU_BACKEND").is_ok() {
            wgpu::Backends::all()
        } else {
            #[cfg(target_os = "windows")]
            {
                wgpu::Backends::VULKAN
            }
            #[cfg(not(target_os = "windows"))]
            {
                wgpu::Backends::all()
            }
        }
    }

    async fn request_adapter(
        instance: &wgpu::Instance,
        surface: Option<&wgpu::Surface<'static>>,
    ) -> BackendResult<wgpu::Adapter> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );
        Ok(adapter)
    }

    async fn request_device(adapter: &wgpu::Adapter) -> BackendResult<(wgpu::Device, wgpu::Queue)> {
        // Sample counts beyond 4 are adapter specific
        let required_features = adapter.features()
            & wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;

        adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Asteroid Field Device"),
                    required_features,
                    required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))
    }

    fn create_headless_target(&mut self, width: u32, height: u32) -> BackendResult<Presentation> {
        let texture = self.create_texture(&TextureDescriptor {
            label: Some("Headless Presentation".into()),
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::RENDER_ATTACHMENT
                | TextureUsage::COPY_SRC
                | TextureUsage::TEXTURE_BINDING,
            ..Default::default()
        })?;
        let view = self.create_texture_view(texture, TextureViewDimension::D2)?;
        Ok(Presentation::Headless {
            texture,
            view,
            format: wgpu::TextureFormat::Rgba8Unorm,
            width,
            height,
        })
    }

    /// The texture frames are rendered into when running headless
    pub fn presentation_texture(&self) -> Option<TextureHandle> {
        match &self.presentation {
            Presentation::Headless { texture, .. } => Some(*texture),
            Presentation::Surface { .. } => None,
        }
    }

    fn encoder_or_new(&mut self) -> wgpu::CommandEncoder {
        self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Immediate Encoder"),
                })
        })
    }

    fn submit_pending(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }
}

impl GraphicsBackend for WgpuBackend {
    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let max_size = self.device.limits().max_texture_dimension_2d;
        let (clamped_width, clamped_height) = Self::clamp_extent(max_size, width, height);

        if let Presentation::Surface { surface, config, .. } = &mut self.presentation {
            config.width = clamped_width;
            config.height = clamped_height;
            surface.configure(&self.device, config);
            return;
        }

        if let Presentation::Headless { texture, view, .. } = self.presentation {
            self.destroy_texture_view(view);
            self.destroy_texture(texture);
            match self.create_headless_target(clamped_width, clamped_height) {
                Ok(presentation) => self.presentation = presentation,
                Err(e) => log::error!("Failed to resize headless target: {}", e),
            }
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        match &self.presentation {
            Presentation::Surface { config, .. } => (config.width, config.height),
            Presentation::Headless { width, height, .. } => (*width, *height),
        }
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        let (swapchain_view, width, height) = match &mut self.presentation {
            Presentation::Surface {
                surface,
                config,
                current_texture,
                current_view_id,
            } => {
                let output = surface
                    .get_current_texture()
                    .map_err(Self::convert_surface_error)?;

                // The view itself is created on demand when a pass targets it
                let view_id = self.next_view_id;
                self.next_view_id += 1;
                *current_view_id = view_id;
                *current_texture = Some(output);
                (TextureViewHandle(view_id), config.width, config.height)
            }
            Presentation::Headless {
                view, width, height, ..
            } => (*view, *width, *height),
        };

        self.encoder = Some(
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Frame Encoder"),
                }),
        );

        Ok(FrameContext {
            swapchain_view,
            width,
            height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.submit_pending();

        if let Presentation::Surface {
            current_texture, ..
        } = &mut self.presentation
        {
            if let Some(texture) = current_texture.take() {
                texture.present();
            }
        }

        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        match &self.presentation {
            Presentation::Surface { config, .. } => Self::convert_texture_format_back(config.format),
            Presentation::Headless { format, .. } => Self::convert_texture_format_back(*format),
        }
    }

    fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    fn supports_sample_count(&self, format: TextureFormat, count: u32) -> bool {
        let format = Self::convert_texture_format(format);
        let features = if self
            .device
            .features()
            .contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES)
        {
            self.adapter.get_texture_format_features(format)
        } else {
            format.guaranteed_format_features(self.device.features())
        };
        features.flags.sample_count_supported(count)
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        if data.is_empty() {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?} has no contents",
                desc.label
            )));
        }

        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: desc.label.as_deref(),
            contents: data,
            usage: Self::convert_buffer_usage(desc.usage),
        });

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(id, buffer);

        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some(buf) = self.buffers.get(&buffer.0) {
            self.queue.write_buffer(buf, offset, data);
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let max = self.max_texture_dimension();
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: extent {}x{} outside 1..={}",
                desc.label, desc.width, desc.height, max
            )));
        }
        if desc.sample_count > 1 && !self.supports_sample_count(desc.format, desc.sample_count) {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: {} samples unsupported for {:?}",
                desc.label, desc.sample_count, desc.format
            )));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers.max(1),
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: desc.sample_count.max(1),
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });

        let id = self.next_texture_id;
        self.next_texture_id += 1;
        self.textures.insert(id, (texture, desc.clone()));

        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        dimension: TextureViewDimension,
    ) -> BackendResult<TextureViewHandle> {
        let (tex, desc) = self.textures.get(&texture.0).ok_or(BackendError::ResourceNotFound {
            kind: "texture",
            id: texture.0,
        })?;

        let view = tex.create_view(&wgpu::TextureViewDescriptor {
            label: desc.label.as_deref(),
            dimension: Some(Self::convert_view_dimension(dimension)),
            ..Default::default()
        });
        let format = Self::convert_texture_format(desc.format);

        let id = self.next_view_id;
        self.next_view_id += 1;
        self.texture_views.insert(id, (view, format));

        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, region: TextureRegion, data: &[u8]) {
        let Some((tex, desc)) = self.textures.get(&texture.0) else {
            return;
        };
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: tex,
                mip_level: region.mip_level,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: region.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(region.width * desc.format.bytes_per_pixel()),
                rows_per_image: Some(region.height),
            },
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: desc.label.as_deref(),
            address_mode_u: Self::convert_address_mode(desc.address_mode_u),
            address_mode_v: Self::convert_address_mode(desc.address_mode_v),
            address_mode_w: Self::convert_address_mode(desc.address_mode_w),
            mag_filter: Self::convert_filter_mode(desc.mag_filter),
            min_filter: Self::convert_filter_mode(desc.min_filter),
            mipmap_filter: Self::convert_filter_mode(desc.mipmap_filter),
            lod_min_clamp: 0.0,
            lod_max_clamp: 32.0,
            compare: None,
            anisotropy_clamp: 1,
            border_color: None,
        });

        let id = self.next_sampler_id;
        self.next_sampler_id += 1;
        self.samplers.insert(id, sampler);

        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let wgpu_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|e| {
                let ty = match e.ty {
                    BindingType::UniformBuffer => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    BindingType::Texture { view_dimension } => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: Self::convert_view_dimension(view_dimension),
                        multisampled: false,
                    },
                    BindingType::Sampler => {
                        wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
                    }
                };

                let mut visibility = wgpu::ShaderStages::empty();
                if e.visibility.contains(ShaderStageFlags::VERTEX) {
                    visibility |= wgpu::ShaderStages::VERTEX;
                }
                if e.visibility.contains(ShaderStageFlags::FRAGMENT) {
                    visibility |= wgpu::ShaderStages::FRAGMENT;
                }

                wgpu::BindGroupLayoutEntry {
                    binding: e.binding,
                    visibility,
                    ty,
                    count: None,
                }
            })
            .collect();

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &wgpu_entries,
            });

        let id = self.next_layout_id;
        self.next_layout_id += 1;
        self.bind_group_layouts.insert(id, layout);

        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let layout_ref = self
            .bind_group_layouts
            .get(&layout.0)
            .ok_or(BackendError::ResourceNotFound {
                kind: "bind group layout",
                id: layout.0,
            })?;

        let mut wgpu_entries = Vec::with_capacity(entries.len());
        for (binding, entry) in entries {
            let resource = match entry {
                BindGroupEntry::Buffer(buffer) => self
                    .buffers
                    .get(&buffer.0)
                    .ok_or(BackendError::ResourceNotFound {
                        kind: "buffer",
                        id: buffer.0,
                    })?
                    .as_entire_binding(),
                BindGroupEntry::Texture(view) => wgpu::BindingResource::TextureView(
                    &self
                        .texture_views
                        .get(&view.0)
                        .ok_or(BackendError::ResourceNotFound {
                            kind: "texture view",
                            id: view.0,
                        })?
                        .0,
                ),
                BindGroupEntry::Sampler(sampler) => wgpu::BindingResource::Sampler(
                    self.samplers
                        .get(&sampler.0)
                        .ok_or(BackendError::ResourceNotFound {
                            kind: "sampler",
                            id: sampler.0,
                        })?,
                ),
            };
            wgpu_entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: layout_ref,
            entries: &wgpu_entries,
        });

        let id = self.next_bind_group_id;
        self.next_bind_group_id += 1;
        self.bind_groups.insert(id, bind_group);

        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: desc.label.as_deref(),
                source: wgpu::ShaderSource::Wgsl(desc.shader.as_str().into()),
            });

        let mut layouts = Vec::with_capacity(desc.bind_group_layouts.len());
        for handle in &desc.bind_group_layouts {
            layouts.push(self.bind_group_layouts.get(&handle.0).ok_or(
                BackendError::ResourceNotFound {
                    kind: "bind group layout",
                    id: handle.0,
                },
            )?);
        }

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: desc.label.as_deref(),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });

        let vertex_attrs: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: Self::convert_vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();

        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(vertex_attrs.iter())
            .map(|(layout, attrs)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: match layout.step_mode {
                    VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes: attrs,
            })
            .collect();

        let color_targets = [Some(wgpu::ColorTargetState {
            format: Self::convert_texture_format(desc.color_format),
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];

        let primitive = wgpu::PrimitiveState {
            topology: match desc.primitive_topology {
                PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
                PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
            },
            strip_index_format: None,
            front_face: match desc.front_face {
                FrontFace::Ccw => wgpu::FrontFace::Ccw,
                FrontFace::Cw => wgpu::FrontFace::Cw,
            },
            cull_mode: match desc.cull_mode {
                CullMode::None => None,
                CullMode::Front => Some(wgpu::Face::Front),
                CullMode::Back => Some(wgpu::Face::Back),
            },
            ..Default::default()
        };

        let depth_stencil = desc.depth_stencil.as_ref().map(|ds| wgpu::DepthStencilState {
            format: Self::convert_texture_format(ds.format),
            depth_write_enabled: ds.depth_write_enabled,
            depth_compare: Self::convert_compare_function(ds.depth_compare),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: desc.label.as_deref(),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive,
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: desc.sample_count.max(1),
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                multiview: None,
            });

        let id = self.next_render_pipeline_id;
        self.next_render_pipeline_id += 1;
        self.render_pipelines.insert(id, pipeline);

        Ok(RenderPipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.pending_render_pass = Some(PendingRenderPass {
            descriptor: desc.clone(),
            commands: Vec::new(),
        });
    }

    fn end_render_pass(&mut self) {
        let Some(pending) = self.pending_render_pass.take() else {
            return;
        };

        let Some(mut encoder) = self.encoder.take() else {
            log::warn!("Render pass {:?} ended outside a frame", pending.descriptor.label);
            return;
        };

        let (swapchain_view, current_view_id) = match &self.presentation {
            Presentation::Surface {
                current_texture,
                current_view_id,
                ..
            } => (
                current_texture
                    .as_ref()
                    .map(|tex| tex.texture.create_view(&wgpu::TextureViewDescriptor::default())),
                *current_view_id,
            ),
            Presentation::Headless { .. } => (None, 0),
        };

        let resolve_view = |handle: TextureViewHandle| -> Option<&wgpu::TextureView> {
            if current_view_id != 0 && handle.0 == current_view_id {
                swapchain_view.as_ref()
            } else {
                self.texture_views.get(&handle.0).map(|(view, _)| view)
            }
        };

        // A pass with a dangling attachment would draw into nothing
        if let Some(missing) = unknown_attachment(&pending.descriptor, |handle| resolve_view(handle).is_some()) {
            log::error!(
                "Render pass {:?} dropped: attachment view {} does not exist",
                pending.descriptor.label,
                missing.0
            );
            self.encoder = Some(encoder);
            return;
        }

        {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pending
                .descriptor
                .color_attachments
                .iter()
                .filter_map(|att| {
                    let view = resolve_view(att.view)?;
                    let resolve_target = att.resolve_target.and_then(resolve_view);
                    let clear = match att.load_op {
                        LoadOp::Clear(c) => wgpu::Color {
                            r: c[0] as f64,
                            g: c[1] as f64,
                            b: c[2] as f64,
                            a: c[3] as f64,
                        },
                        LoadOp::Load => wgpu::Color::BLACK,
                    };
                    Some(Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target,
                        ops: wgpu::Operations {
                            load: Self::convert_load_op(&att.load_op, clear),
                            store: Self::convert_store_op(att.store_op),
                        },
                    }))
                })
                .collect();

            let depth_attachment = pending
                .descriptor
                .depth_stencil_attachment
                .as_ref()
                .and_then(|att| {
                    let (view, format) = self.texture_views.get(&att.view.0)?;
                    Some(wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: Self::convert_load_op(&att.depth_load_op, att.depth_clear_value),
                            store: Self::convert_store_op(att.depth_store_op),
                        }),
                        stencil_ops: format.has_stencil_aspect().then_some(wgpu::Operations {
                            load: wgpu::LoadOp::Clear(0),
                            store: wgpu::StoreOp::Discard,
                        }),
                    })
                });

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: pending.descriptor.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for cmd in &pending.commands {
                match cmd {
                    RenderCommand::SetPipeline(handle) => {
                        if let Some(pipeline) = self.render_pipelines.get(&handle.0) {
                            render_pass.set_pipeline(pipeline);
                        }
                    }
                    RenderCommand::SetBindGroup { index, bind_group } => {
                        if let Some(bg) = self.bind_groups.get(&bind_group.0) {
                            render_pass.set_bind_group(*index, bg, &[]);
                        }
                    }
                    RenderCommand::SetVertexBuffer { slot, buffer, offset } => {
                        if let Some(buf) = self.buffers.get(&buffer.0) {
                            render_pass.set_vertex_buffer(*slot, buf.slice(*offset..));
                        }
                    }
                    RenderCommand::SetIndexBuffer { buffer, offset, format } => {
                        if let Some(buf) = self.buffers.get(&buffer.0) {
                            let wgpu_format = match format {
                                IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
                                IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
                            };
                            render_pass.set_index_buffer(buf.slice(*offset..), wgpu_format);
                        }
                    }
                    RenderCommand::SetViewport {
                        x,
                        y,
                        width,
                        height,
                        min_depth,
                        max_depth,
                    } => {
                        render_pass.set_viewport(*x, *y, *width, *height, *min_depth, *max_depth);
                    }
                    RenderCommand::Draw { vertices, instances } => {
                        render_pass.draw(vertices.clone(), instances.clone());
                    }
                    RenderCommand::DrawIndexed {
                        indices,
                        base_vertex,
                        instances,
                    } => {
                        render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                    }
                }
            }
        }

        self.encoder = Some(encoder);
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetPipeline(pipeline));
        }
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetBindGroup { index, bind_group });
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetVertexBuffer { slot, buffer, offset });
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetIndexBuffer { buffer, offset, format });
        }
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetViewport {
                x,
                y,
                width,
                height,
                min_depth,
                max_depth,
            });
        }
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::Draw { vertices, instances });
        }
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::DrawIndexed {
                indices,
                base_vertex,
                instances,
            });
        }
    }

    fn copy_texture_to_texture(&mut self, src: TextureHandle, dst: TextureHandle, width: u32, height: u32) {
        let mut encoder = self.encoder_or_new();
        if let (Some((src_tex, _)), Some((dst_tex, _))) =
            (self.textures.get(&src.0), self.textures.get(&dst.0))
        {
            encoder.copy_texture_to_texture(
                src_tex.as_image_copy(),
                dst_tex.as_image_copy(),
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        }
        self.encoder = Some(encoder);
    }

    fn read_texture(&mut self, texture: TextureHandle) -> BackendResult<Vec<u8>> {
        self.submit_pending();

        let (tex, desc) = self.textures.get(&texture.0).ok_or(BackendError::ResourceNotFound {
            kind: "texture",
            id: texture.0,
        })?;
        let bytes_per_pixel = desc.format.bytes_per_pixel();
        let unpadded_row = desc.width * bytes_per_pixel;
        let padded_row = unpadded_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded_row as u64 * desc.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            tex.as_image_copy(),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(desc.height),
                },
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?;

        let mut pixels = Vec::with_capacity((unpadded_row * desc.height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded_row as usize) {
                pixels.extend_from_slice(&row[..unpadded_row as usize]);
            }
        }
        staging.unmap();
        Ok(pixels)
    }

    fn wait_idle(&mut self) {
        self.submit_pending();
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buf) = self.buffers.remove(&buffer.0) {
            buf.destroy();
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some((tex, _)) = self.textures.remove(&texture.0) {
            tex.destroy();
        }
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.texture_views.remove(&view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        self.bind_group_layouts.remove(&layout.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.render_pipelines.remove(&pipeline.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(view: u64, resolve: Option<u64>, depth: Option<u64>) -> RenderPassDescriptor {
        RenderPassDescriptor {
            label: Some("test".into()),
            color_attachments: vec![ColorAttachment {
                view: TextureViewHandle(view),
                resolve_target: resolve.map(TextureViewHandle),
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: depth.map(|id| DepthStencilAttachment {
                view: TextureViewHandle(id),
                depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                depth_store_op: StoreOp::Discard,
                depth_clear_value: 1.0,
            }),
        }
    }

    #[test]
    fn dangling_attachments_are_found() {
        let known = |view: TextureViewHandle| view.0 <= 3;
        assert_eq!(unknown_attachment(&pass(1, Some(2), Some(3)), known), None);
        assert_eq!(unknown_attachment(&pass(9, Some(2), None), known), Some(TextureViewHandle(9)));
        assert_eq!(unknown_attachment(&pass(1, Some(7), None), known), Some(TextureViewHandle(7)));
        assert_eq!(unknown_attachment(&pass(1, None, Some(8)), known), Some(TextureViewHandle(8)));
    }

    #[test]
    fn surface_errors_separate_skippable_from_fatal() {
        assert!(matches!(
            WgpuBackend::convert_surface_error(wgpu::SurfaceError::Timeout),
            BackendError::SurfaceTimeout
        ));
        assert!(matches!(
            WgpuBackend::convert_surface_error(wgpu::SurfaceError::Outdated),
            BackendError::SurfaceLost
        ));
        assert!(matches!(
            WgpuBackend::convert_surface_error(wgpu::SurfaceError::OutOfMemory),
            BackendError::OutOfMemory
        ));
    }
}
