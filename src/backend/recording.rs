//! Recording backend for tests and tooling.
//!
//! This backend performs no GPU work. Every call is appended to a command log
//! and every resource is tracked from creation to destruction, so callers can
//! assert pass ordering, bound layouts, instance counts and teardown
//! discipline without GPU hardware. Texture limits mirror what a real device
//! enforces: zero-sized or oversized extents and unsupported sample counts
//! are rejected. [`RecordingBackend::fail_nth`] injects a one-off creation
//! failure for exercising cleanup paths.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Kind of tracked resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Buffer,
    Texture,
    TextureView,
    Sampler,
    BindGroupLayout,
    BindGroup,
    RenderPipeline,
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginFrame,
    EndFrame,
    BeginRenderPass {
        label: Option<String>,
        color_views: Vec<TextureViewHandle>,
        resolve_targets: Vec<Option<TextureViewHandle>>,
        color_load: Vec<LoadOp>,
        depth_view: Option<TextureViewHandle>,
    },
    EndRenderPass,
    SetPipeline(RenderPipelineHandle),
    SetBindGroup { index: u32, bind_group: BindGroupHandle },
    SetVertexBuffer { slot: u32, buffer: BufferHandle },
    SetIndexBuffer { buffer: BufferHandle, format: IndexFormat },
    SetViewport { width: f32, height: f32 },
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, instances: Range<u32> },
    WriteTexture { texture: TextureHandle, region: TextureRegion },
    CopyTexture { src: TextureHandle, dst: TextureHandle },
    WaitIdle,
}

/// Backend that records instead of rendering
#[derive(Debug)]
pub struct RecordingBackend {
    width: u32,
    height: u32,
    max_dimension: u32,
    sample_counts: Vec<u32>,
    swapchain_view: TextureViewHandle,

    next_id: u64,
    in_frame: bool,
    in_pass: bool,

    commands: Vec<RecordedCommand>,
    live: BTreeMap<(ResourceKind, u64), String>,
    double_destroys: Vec<(ResourceKind, u64)>,
    buffers: HashMap<u64, (BufferDescriptor, Vec<u8>)>,
    textures: HashMap<u64, TextureDescriptor>,
    view_targets: HashMap<u64, (u64, TextureViewDimension)>,
    pipelines: HashMap<u64, RenderPipelineDescriptor>,
    /// Creations of each kind left to succeed before one fails
    injected_failures: HashMap<ResourceKind, usize>,
}

impl RecordingBackend {
    /// Create a recording backend with a `width`x`height` presentation surface
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            max_dimension: 8192,
            sample_counts: vec![1, 2, 4, 8],
            // Handle 0 is never issued to a resource
            swapchain_view: TextureViewHandle(0),
            next_id: 1,
            in_frame: false,
            in_pass: false,
            commands: Vec::new(),
            live: BTreeMap::new(),
            double_destroys: Vec::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            view_targets: HashMap::new(),
            pipelines: HashMap::new(),
            injected_failures: HashMap::new(),
        }
    }

    /// Restrict the sample counts reported as supported
    pub fn with_sample_counts(mut self, counts: &[u32]) -> Self {
        self.sample_counts = counts.to_vec();
        self
    }

    /// Override the maximum texture dimension
    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = max;
        self
    }

    /// Make the `n`th creation of `kind` from now on fail once, counting from 0
    pub fn fail_nth(mut self, kind: ResourceKind, n: usize) -> Self {
        self.injected_failures.insert(kind, n);
        self
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn swapchain_view(&self) -> TextureViewHandle {
        self.swapchain_view
    }

    /// Number of live resources of `kind`
    pub fn live_count(&self, kind: ResourceKind) -> usize {
        self.live.keys().filter(|(k, _)| *k == kind).count()
    }

    /// Labels of every resource not yet destroyed
    pub fn live_resources(&self) -> Vec<(ResourceKind, String)> {
        self.live
            .iter()
            .map(|((kind, _), label)| (*kind, label.clone()))
            .collect()
    }

    /// Resources destroyed more than once, or never created
    pub fn double_destroys(&self) -> &[(ResourceKind, u64)] {
        &self.double_destroys
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|(_, data)| data.as_slice())
    }

    pub fn buffer_descriptor(&self, buffer: BufferHandle) -> Option<&BufferDescriptor> {
        self.buffers.get(&buffer.0).map(|(desc, _)| desc)
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    /// Texture a view was created from, with its view dimension
    pub fn view_target(&self, view: TextureViewHandle) -> Option<(TextureHandle, TextureViewDimension)> {
        self.view_targets
            .get(&view.0)
            .map(|(texture, dim)| (TextureHandle(*texture), *dim))
    }

    pub fn pipeline_descriptor(&self, pipeline: RenderPipelineHandle) -> Option<&RenderPipelineDescriptor> {
        self.pipelines.get(&pipeline.0)
    }

    fn issue(&mut self, kind: ResourceKind, label: Option<&str>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let label = label.map(str::to_string).unwrap_or_else(|| format!("{:?}#{}", kind, id));
        log::trace!("RecordingBackend: creating {:?} {}", kind, label);
        self.live.insert((kind, id), label);
        id
    }

    fn injected(&mut self, kind: ResourceKind) -> BackendResult<()> {
        match self.injected_failures.get_mut(&kind) {
            Some(0) => {
                self.injected_failures.remove(&kind);
                let reason = format!("injected {:?} failure", kind);
                Err(match kind {
                    ResourceKind::Buffer => BackendError::BufferCreationFailed(reason),
                    ResourceKind::Texture | ResourceKind::TextureView | ResourceKind::Sampler => {
                        BackendError::TextureCreationFailed(reason)
                    }
                    ResourceKind::BindGroupLayout | ResourceKind::BindGroup | ResourceKind::RenderPipeline => {
                        BackendError::PipelineCreationFailed(reason)
                    }
                })
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn release(&mut self, kind: ResourceKind, id: u64) -> bool {
        if self.live.remove(&(kind, id)).is_none() {
            log::trace!("RecordingBackend: {:?} {} destroyed twice", kind, id);
            self.double_destroys.push((kind, id));
            return false;
        }
        true
    }

    fn record(&mut self, command: RecordedCommand) {
        if matches!(
            command,
            RecordedCommand::SetPipeline(_)
                | RecordedCommand::SetBindGroup { .. }
                | RecordedCommand::SetVertexBuffer { .. }
                | RecordedCommand::SetIndexBuffer { .. }
                | RecordedCommand::SetViewport { .. }
                | RecordedCommand::Draw { .. }
                | RecordedCommand::DrawIndexed { .. }
        ) && !self.in_pass
        {
            log::trace!("RecordingBackend: dropping {:?} outside a render pass", command);
            return;
        }
        self.commands.push(command);
    }
}

impl GraphicsBackend for RecordingBackend {
    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.width = width;
            self.height = height;
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        self.in_frame = true;
        self.commands.push(RecordedCommand::BeginFrame);
        Ok(FrameContext {
            swapchain_view: self.swapchain_view,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.in_frame = false;
        self.commands.push(RecordedCommand::EndFrame);
        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8Unorm
    }

    fn max_texture_dimension(&self) -> u32 {
        self.max_dimension
    }

    fn supports_sample_count(&self, _format: TextureFormat, count: u32) -> bool {
        self.sample_counts.contains(&count)
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
        self.injected(ResourceKind::Buffer)?;
        let id = self.issue(ResourceKind::Buffer, desc.label.as_deref());
        let mut stored = desc.clone();
        stored.size = data.len() as u64;
        self.buffers.insert(id, (stored, data.to_vec()));
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some((_, contents)) = self.buffers.get_mut(&buffer.0) {
            let start = offset as usize;
            let end = start + data.len();
            if end <= contents.len() {
                contents[start..end].copy_from_slice(data);
            }
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0
            || desc.height == 0
            || desc.width > self.max_dimension
            || desc.height > self.max_dimension
        {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: extent {}x{} outside 1..={}",
                desc.label, desc.width, desc.height, self.max_dimension
            )));
        }
        if !self.supports_sample_count(desc.format, desc.sample_count) {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: {} samples unsupported",
                desc.label, desc.sample_count
            )));
        }
        self.injected(ResourceKind::Texture)?;
        let id = self.issue(ResourceKind::Texture, desc.label.as_deref());
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        dimension: TextureViewDimension,
    ) -> BackendResult<TextureViewHandle> {
        let label = self
            .textures
            .get(&texture.0)
            .ok_or(BackendError::ResourceNotFound {
                kind: "texture",
                id: texture.0,
            })?
            .label
            .as_ref()
            .map(|l| format!("{} view", l));
        self.injected(ResourceKind::TextureView)?;
        let id = self.issue(ResourceKind::TextureView, label.as_deref());
        self.view_targets.insert(id, (texture.0, dimension));
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, region: TextureRegion, _data: &[u8]) {
        self.commands
            .push(RecordedCommand::WriteTexture { texture, region });
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        self.injected(ResourceKind::Sampler)?;
        Ok(SamplerHandle(
            self.issue(ResourceKind::Sampler, desc.label.as_deref()),
        ))
    }

    fn create_bind_group_layout(
        &mut self,
        _entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        Ok(BindGroupLayoutHandle(
            self.issue(ResourceKind::BindGroupLayout, None),
        ))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        if !self.live.contains_key(&(ResourceKind::BindGroupLayout, layout.0)) {
            return Err(BackendError::ResourceNotFound {
                kind: "bind group layout",
                id: layout.0,
            });
        }
        for (_, entry) in entries {
            let (kind, id) = match entry {
                BindGroupEntry::Buffer(b) => (ResourceKind::Buffer, b.0),
                BindGroupEntry::Texture(v) => (ResourceKind::TextureView, v.0),
                BindGroupEntry::Sampler(s) => (ResourceKind::Sampler, s.0),
            };
            if !self.live.contains_key(&(kind, id)) {
                return Err(BackendError::ResourceNotFound { kind: "binding", id });
            }
        }
        self.injected(ResourceKind::BindGroup)?;
        Ok(BindGroupHandle(self.issue(ResourceKind::BindGroup, None)))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if !self.supports_sample_count(desc.color_format, desc.sample_count) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{:?}: {} samples unsupported",
                desc.label, desc.sample_count
            )));
        }
        self.injected(ResourceKind::RenderPipeline)?;
        let id = self.issue(ResourceKind::RenderPipeline, desc.label.as_deref());
        self.pipelines.insert(id, desc.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.in_pass = true;
        self.commands.push(RecordedCommand::BeginRenderPass {
            label: desc.label.clone(),
            color_views: desc.color_attachments.iter().map(|a| a.view).collect(),
            resolve_targets: desc
                .color_attachments
                .iter()
                .map(|a| a.resolve_target)
                .collect(),
            color_load: desc.color_attachments.iter().map(|a| a.load_op).collect(),
            depth_view: desc.depth_stencil_attachment.as_ref().map(|d| d.view),
        });
    }

    fn end_render_pass(&mut self) {
        if self.in_pass {
            self.in_pass = false;
            self.commands.push(RecordedCommand::EndRenderPass);
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record(RecordedCommand::SetPipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        self.record(RecordedCommand::SetBindGroup { index, bind_group });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, _offset: u64) {
        self.record(RecordedCommand::SetVertexBuffer { slot, buffer });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _offset: u64, format: IndexFormat) {
        self.record(RecordedCommand::SetIndexBuffer { buffer, format });
    }

    fn set_viewport(&mut self, _x: f32, _y: f32, width: f32, height: f32, _min_depth: f32, _max_depth: f32) {
        self.record(RecordedCommand::SetViewport { width, height });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record(RecordedCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, _base_vertex: i32, instances: Range<u32>) {
        self.record(RecordedCommand::DrawIndexed { indices, instances });
    }

    fn copy_texture_to_texture(&mut self, src: TextureHandle, dst: TextureHandle, _width: u32, _height: u32) {
        self.commands.push(RecordedCommand::CopyTexture { src, dst });
    }

    fn read_texture(&mut self, texture: TextureHandle) -> BackendResult<Vec<u8>> {
        let desc = self.textures.get(&texture.0).ok_or(BackendError::ResourceNotFound {
            kind: "texture",
            id: texture.0,
        })?;
        Ok(vec![
            0;
            (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize
        ])
    }

    fn wait_idle(&mut self) {
        self.commands.push(RecordedCommand::WaitIdle);
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.release(ResourceKind::Buffer, buffer.0) {
            self.buffers.remove(&buffer.0);
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.release(ResourceKind::Texture, texture.0);
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.release(ResourceKind::TextureView, view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.release(ResourceKind::Sampler, sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.release(ResourceKind::BindGroup, bind_group.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        self.release(ResourceKind::BindGroupLayout, layout.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.release(ResourceKind::RenderPipeline, pipeline.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_sized_textures() {
        let mut backend = RecordingBackend::new(64, 64);
        let result = backend.create_texture(&TextureDescriptor {
            width: 0,
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(backend.live_count(ResourceKind::Texture), 0);
    }

    #[test]
    fn tracks_double_destroy() {
        let mut backend = RecordingBackend::new(64, 64);
        let texture = backend.create_texture(&TextureDescriptor::default()).unwrap();
        backend.destroy_texture(texture);
        backend.destroy_texture(texture);
        assert_eq!(backend.double_destroys(), &[(ResourceKind::Texture, texture.0)]);
    }

    #[test]
    fn injected_failure_fires_once_on_the_nth_creation() {
        let mut backend = RecordingBackend::new(64, 64).fail_nth(ResourceKind::Texture, 1);
        assert!(backend.create_texture(&TextureDescriptor::default()).is_ok());
        assert!(backend.create_texture(&TextureDescriptor::default()).is_err());
        assert!(backend.create_texture(&TextureDescriptor::default()).is_ok());
        assert_eq!(backend.live_count(ResourceKind::Texture), 2);
    }

    #[test]
    fn draws_outside_pass_are_not_recorded() {
        let mut backend = RecordingBackend::new(64, 64);
        backend.draw(0..3, 0..1);
        assert!(backend.commands().is_empty());

        backend.begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
        assert_eq!(backend.commands().len(), 3);
    }
}
