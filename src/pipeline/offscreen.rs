//! Multisampled scene target and its single-sample resolve texture
//!
//! The scene is drawn into a multisampled color attachment with a combined
//! depth/stencil attachment. [`OffscreenTarget::resolve`] then collapses the
//! samples into a single-sample texture of the same size, which the composite
//! pass samples.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};

/// Lifecycle of an [`OffscreenTarget`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unconfigured,
    Ready,
    Destroyed,
}

impl TargetState {
    fn name(&self) -> &'static str {
        match self {
            TargetState::Unconfigured => "unconfigured",
            TargetState::Ready => "ready",
            TargetState::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Attachments {
    width: u32,
    height: u32,
    sample_count: u32,
    color: TextureHandle,
    color_view: TextureViewHandle,
    depth: TextureHandle,
    depth_view: TextureViewHandle,
    resolve: TextureHandle,
    resolve_view: TextureViewHandle,
}

/// Multisampled color + depth/stencil pair plus a single-sample resolve texture
#[derive(Debug)]
pub struct OffscreenTarget {
    color_format: TextureFormat,
    depth_format: TextureFormat,
    state: TargetState,
    attachments: Option<Attachments>,
}

/// Highest sample count not above `requested` that both formats support
pub fn choose_sample_count<B: GraphicsBackend>(
    backend: &B,
    color_format: TextureFormat,
    depth_format: TextureFormat,
    requested: u32,
) -> u32 {
    let supported = |count: u32| {
        backend.supports_sample_count(color_format, count) && backend.supports_sample_count(depth_format, count)
    };
    let mut count = requested.max(1).next_power_of_two();
    if count > requested.max(1) {
        count /= 2;
    }
    while count > 1 && !supported(count) {
        count /= 2;
    }
    if count != requested {
        log::warn!(
            "{}x MSAA unsupported for {:?}/{:?}, using {}x",
            requested,
            color_format,
            depth_format,
            count
        );
    }
    count
}

impl OffscreenTarget {
    pub const DEFAULT_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;

    pub fn new(color_format: TextureFormat) -> Self {
        Self {
            color_format,
            depth_format: Self::DEFAULT_DEPTH_FORMAT,
            state: TargetState::Unconfigured,
            attachments: None,
        }
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn color_format(&self) -> TextureFormat {
        self.color_format
    }

    pub fn depth_format(&self) -> TextureFormat {
        self.depth_format
    }

    fn ready(&self, operation: &'static str) -> RenderResult<&Attachments> {
        match (&self.state, &self.attachments) {
            (TargetState::Ready, Some(attachments)) => Ok(attachments),
            (state, _) => Err(RenderError::InvalidTargetState {
                state: state.name(),
                operation,
            }),
        }
    }

    /// Width and height of every attachment
    pub fn size(&self) -> Option<(u32, u32)> {
        self.attachments.map(|a| (a.width, a.height))
    }

    pub fn sample_count(&self) -> Option<u32> {
        self.attachments.map(|a| a.sample_count)
    }

    pub fn resolve_texture(&self) -> RenderResult<TextureHandle> {
        self.ready("sample the resolve texture").map(|a| a.resolve)
    }

    pub fn resolve_view(&self) -> RenderResult<TextureViewHandle> {
        self.ready("sample the resolve texture").map(|a| a.resolve_view)
    }

    /// Completeness check run before any allocation
    pub fn validate<B: GraphicsBackend>(
        &self,
        backend: &B,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Err(RenderError::FramebufferIncomplete(format!(
                "attachment size {}x{} is empty",
                width, height
            )));
        }
        let max = backend.max_texture_dimension();
        if width > max || height > max {
            return Err(RenderError::FramebufferIncomplete(format!(
                "attachment size {}x{} exceeds the device limit {}",
                width, height, max
            )));
        }
        for format in [self.color_format, self.depth_format] {
            if !backend.supports_sample_count(format, sample_count) {
                return Err(RenderError::FramebufferIncomplete(format!(
                    "{:?} cannot be rendered with {} samples",
                    format, sample_count
                )));
            }
        }
        Ok(())
    }

    /// Validate, then allocate every attachment. On failure the target stays
    /// unconfigured and nothing is left allocated.
    pub fn create<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> RenderResult<()> {
        if self.state != TargetState::Unconfigured {
            return Err(RenderError::InvalidTargetState {
                state: self.state.name(),
                operation: "create",
            });
        }
        if let Err(e) = self.validate(backend, width, height, sample_count) {
            log::error!("{}", e);
            return Err(e);
        }

        let mut created = Vec::new();
        match self.allocate(backend, width, height, sample_count, &mut created) {
            Ok(attachments) => {
                log::info!(
                    "Offscreen target ready: {}x{}, {}x MSAA",
                    width,
                    height,
                    sample_count
                );
                self.attachments = Some(attachments);
                self.state = TargetState::Ready;
                Ok(())
            }
            Err(e) => {
                for (texture, view) in created {
                    if let Some(view) = view {
                        backend.destroy_texture_view(view);
                    }
                    backend.destroy_texture(texture);
                }
                log::error!("Offscreen target incomplete: {}", e);
                Err(RenderError::FramebufferIncomplete(e.to_string()))
            }
        }
    }

    fn allocate<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        width: u32,
        height: u32,
        sample_count: u32,
        created: &mut Vec<(TextureHandle, Option<TextureViewHandle>)>,
    ) -> BackendResult<Attachments> {
        let mut attachment = |label: &str,
                              format: TextureFormat,
                              samples: u32,
                              usage: TextureUsage|
         -> BackendResult<(TextureHandle, TextureViewHandle)> {
            let texture = backend.create_texture(&TextureDescriptor {
                label: Some(label.to_string()),
                width,
                height,
                sample_count: samples,
                format,
                usage,
                ..Default::default()
            })?;
            created.push((texture, None));
            let view = backend.create_texture_view(texture, TextureViewDimension::D2)?;
            if let Some(last) = created.last_mut() {
                last.1 = Some(view);
            }
            Ok((texture, view))
        };

        // A single-sample scene target is copied, not resolved
        let color_usage = if sample_count > 1 {
            TextureUsage::RENDER_ATTACHMENT
        } else {
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC
        };
        let (color, color_view) = attachment("Offscreen MSAA Color", self.color_format, sample_count, color_usage)?;
        let (depth, depth_view) = attachment(
            "Offscreen MSAA Depth/Stencil",
            self.depth_format,
            sample_count,
            TextureUsage::RENDER_ATTACHMENT,
        )?;
        let (resolve, resolve_view) = attachment(
            "Offscreen Resolve",
            self.color_format,
            1,
            TextureUsage::RENDER_ATTACHMENT
                | TextureUsage::TEXTURE_BINDING
                | TextureUsage::COPY_DST
                | TextureUsage::COPY_SRC,
        )?;

        Ok(Attachments {
            width,
            height,
            sample_count,
            color,
            color_view,
            depth,
            depth_view,
            resolve,
            resolve_view,
        })
    }

    /// Pass descriptor that clears and draws into the multisampled attachments
    pub fn scene_pass(&self, clear_color: [f32; 4]) -> RenderResult<RenderPassDescriptor> {
        let a = self.ready("begin the scene pass")?;
        Ok(RenderPassDescriptor {
            label: Some("Scene Pass".into()),
            color_attachments: vec![ColorAttachment {
                view: a.color_view,
                resolve_target: None,
                load_op: LoadOp::Clear(clear_color),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: a.depth_view,
                depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                depth_store_op: StoreOp::Discard,
                depth_clear_value: 1.0,
            }),
        })
    }

    /// Collapse the multisampled color into the resolve texture over the full
    /// extent. Must follow every scene draw and precede any sampling of the
    /// resolve texture.
    pub fn resolve<B: GraphicsBackend>(&self, backend: &mut B) -> RenderResult<()> {
        let a = *self.ready("resolve")?;
        if a.sample_count == 1 {
            backend.copy_texture_to_texture(a.color, a.resolve, a.width, a.height);
            return Ok(());
        }
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("MSAA Resolve".into()),
            color_attachments: vec![ColorAttachment {
                view: a.color_view,
                resolve_target: Some(a.resolve_view),
                load_op: LoadOp::Load,
                store_op: StoreOp::Discard,
            }],
            depth_stencil_attachment: None,
        });
        backend.end_render_pass();
        Ok(())
    }

    /// Reallocate every attachment at a new size, keeping the sample count.
    /// Handles change; dependent bind groups must be rebuilt.
    pub fn resize<B: GraphicsBackend>(&mut self, backend: &mut B, width: u32, height: u32) -> RenderResult<()> {
        let a = *self.ready("resize")?;
        if (a.width, a.height) == (width, height) {
            return Ok(());
        }
        self.validate(backend, width, height, a.sample_count)?;
        self.release(backend);
        self.state = TargetState::Unconfigured;
        self.create(backend, width, height, a.sample_count)
    }

    fn release<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if let Some(a) = self.attachments.take() {
            for (texture, view) in [
                (a.color, a.color_view),
                (a.depth, a.depth_view),
                (a.resolve, a.resolve_view),
            ] {
                backend.destroy_texture_view(view);
                backend.destroy_texture(texture);
            }
        }
    }

    /// Release every attachment. Idempotent; the target cannot be used again.
    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        self.release(backend);
        self.state = TargetState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RecordedCommand, RecordingBackend, ResourceKind};
    use rstest::rstest;

    #[rstest]
    #[case(0, 600)]
    #[case(800, 0)]
    #[case(9000, 600)]
    fn incomplete_sizes_leave_target_unconfigured(#[case] width: u32, #[case] height: u32) {
        let mut backend = RecordingBackend::new(800, 600);
        let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
        let err = target.create(&mut backend, width, height, 4).unwrap_err();
        assert!(matches!(err, RenderError::FramebufferIncomplete(_)));
        assert!(err.is_fatal());
        assert_eq!(target.state(), TargetState::Unconfigured);
        assert!(backend.live_resources().is_empty());
    }

    #[test]
    fn unsupported_sample_count_is_incomplete() {
        let mut backend = RecordingBackend::new(800, 600).with_sample_counts(&[1, 4]);
        let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
        assert!(matches!(
            target.create(&mut backend, 800, 600, 8),
            Err(RenderError::FramebufferIncomplete(_))
        ));
        assert_eq!(choose_sample_count(&backend, TextureFormat::Rgba8Unorm, TextureFormat::Depth24PlusStencil8, 8), 4);
    }

    #[test]
    fn create_allocates_matching_attachments() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
        target.create(&mut backend, 800, 600, 8).unwrap();
        assert_eq!(target.state(), TargetState::Ready);
        assert_eq!(backend.live_count(ResourceKind::Texture), 3);

        let resolve = backend.texture_descriptor(target.resolve_texture().unwrap()).unwrap();
        assert_eq!((resolve.width, resolve.height, resolve.sample_count), (800, 600, 1));
    }

    #[test]
    fn resolve_loads_msaa_color_into_resolve_view() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
        target.create(&mut backend, 64, 64, 4).unwrap();
        backend.clear_commands();

        target.resolve(&mut backend).unwrap();
        match &backend.commands()[0] {
            RecordedCommand::BeginRenderPass {
                resolve_targets,
                color_load,
                depth_view,
                ..
            } => {
                assert_eq!(resolve_targets, &vec![Some(target.resolve_view().unwrap())]);
                assert_eq!(color_load, &vec![LoadOp::Load]);
                assert!(depth_view.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn single_sample_resolve_is_a_copy() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
        target.create(&mut backend, 64, 64, 1).unwrap();
        backend.clear_commands();
        target.resolve(&mut backend).unwrap();
        assert!(matches!(backend.commands(), [RecordedCommand::CopyTexture { .. }]));
    }

    #[test]
    fn resize_reallocates_all_attachments_together() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
        target.create(&mut backend, 64, 64, 4).unwrap();
        let before = target.resolve_texture().unwrap();

        target.resize(&mut backend, 128, 32).unwrap();
        assert_ne!(target.resolve_texture().unwrap(), before);
        assert_eq!(target.size(), Some((128, 32)));
        assert_eq!(target.sample_count(), Some(4));
        assert_eq!(backend.live_count(ResourceKind::Texture), 3);
        assert!(backend.double_destroys().is_empty());
    }

    #[test]
    fn destroy_is_idempotent_and_final() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut target = OffscreenTarget::new(TextureFormat::Rgba8Unorm);
        target.create(&mut backend, 64, 64, 4).unwrap();

        target.destroy(&mut backend);
        target.destroy(&mut backend);
        assert_eq!(target.state(), TargetState::Destroyed);
        assert!(backend.live_resources().is_empty());
        assert!(backend.double_destroys().is_empty());
        assert!(matches!(
            target.resolve(&mut backend),
            Err(RenderError::InvalidTargetState { .. })
        ));
        assert!(target.create(&mut backend, 64, 64, 4).is_err());
    }
}
