// Render graph - declarative render passes
//
// Two phases: a `RenderGraphBuilder` collects attachments, subpasses,
// dependencies and pipelines; `build` validates the indices and compiles it
// all against the current swapchain into a `RenderGraph`. The compiled graph
// owns its render pass, pipelines, framebuffers and transient images, and
// rebuilds the size-dependent parts whenever the swapchain is recreated.
//
// `process` records the whole pass: one begin, `next_subpass` between
// subpasses, each ready pipeline in the order it was attached, one end.

pub mod attachment;
pub mod backend;
pub mod pipeline;
pub mod subpass;

pub use attachment::{Attachment, AttachmentKind, AttachmentSource, ClearValue};
pub use backend::{GraphBackend, PipelineTarget, TransientImage, TransientImageDesc};
pub use pipeline::{alpha_blend, opaque, DrawContext, Pipeline, PipelineState, ViewportConvention};
pub use subpass::{Dependency, Subpass, SubpassId, SubpassTarget};

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::{CommandRecorder, Device, SwapchainInfo};
use crate::error::GfxError;
use crate::signal::{Signal, SubscriptionId};
use pipeline::{CompiledPipeline, DrawFn};

pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.13, 0.03, 0.11, 1.0];

/// A compiled graph shared between its owner and the swapchain's
/// recreation subscriber
pub type SharedGraph = Arc<Mutex<RenderGraph>>;

/// Location of a compiled pipeline within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId {
    pub subpass: SubpassId,
    pub index: usize,
}

#[derive(Debug)]
pub struct RenderGraphBuilder {
    attachments: Vec<Attachment>,
    subpasses: Vec<(Subpass, Vec<Pipeline>)>,
    dependencies: Vec<Dependency>,
    clear_color: [f32; 4],
}

impl Default for RenderGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGraphBuilder {
    pub fn new() -> Self {
        Self {
            attachments: Vec::new(),
            subpasses: Vec::new(),
            dependencies: Vec::new(),
            clear_color: DEFAULT_CLEAR_COLOR,
        }
    }

    /// Single subpass drawing straight to the swapchain image.
    ///
    /// The incoming dependency waits for the previous frame's color output
    /// before this frame clears; the outgoing one makes the writes visible
    /// to presentation.
    pub fn presenting(clear_color: [f32; 4]) -> (Self, SubpassId) {
        let mut builder = Self::new();
        builder.clear_color(clear_color);

        let color = builder.add_attachment(Attachment::color());
        let main = builder.add_subpass(
            Subpass::new().color(color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );

        builder.add_dependency(
            Dependency::new(SubpassTarget::External, main)
                .stages(
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                )
                .access(vk::AccessFlags::empty(), vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        );
        builder.add_dependency(
            Dependency::new(main, SubpassTarget::External)
                .stages(
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                )
                .access(vk::AccessFlags::COLOR_ATTACHMENT_WRITE, vk::AccessFlags::empty()),
        );

        (builder, main)
    }

    /// Color used for color attachments without their own clear value
    pub fn clear_color(&mut self, rgba: [f32; 4]) -> &mut Self {
        self.clear_color = rgba;
        self
    }

    pub fn add_attachment(&mut self, attachment: Attachment) -> u32 {
        self.attachments.push(attachment);
        (self.attachments.len() - 1) as u32
    }

    pub fn add_subpass(&mut self, subpass: Subpass) -> SubpassId {
        self.subpasses.push((subpass, Vec::new()));
        SubpassId(self.subpasses.len() - 1)
    }

    pub fn add_dependency(&mut self, dependency: Dependency) -> &mut Self {
        self.dependencies.push(dependency);
        self
    }

    /// Queue a pipeline for compilation into `subpass`
    pub fn add_pipeline(&mut self, subpass: SubpassId, pipeline: Pipeline) -> Result<PipelineId> {
        let count = self.subpasses.len();
        let (_, pipelines) = self
            .subpasses
            .get_mut(subpass.0)
            .ok_or(GfxError::InvalidSubpass {
                index: subpass.0,
                count,
            })?;
        pipelines.push(pipeline);
        Ok(PipelineId {
            subpass,
            index: pipelines.len() - 1,
        })
    }

    pub fn subpass_count(&self) -> usize {
        self.subpasses.len()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Check every attachment and subpass index
    pub fn validate(&self) -> Result<()> {
        let attachment_count = self.attachments.len();
        let subpass_count = self.subpasses.len();

        for (index, (subpass, _)) in self.subpasses.iter().enumerate() {
            if let Some(attachment) = subpass
                .referenced()
                .find(|&a| a as usize >= attachment_count)
            {
                return Err(GfxError::InvalidAttachment {
                    subpass: index,
                    attachment,
                    count: attachment_count,
                }
                .into());
            }
            if !subpass.resolve.is_empty() && subpass.resolve.len() != subpass.color.len() {
                anyhow::bail!(
                    "Subpass {} has {} resolve attachments for {} color attachments",
                    index,
                    subpass.resolve.len(),
                    subpass.color.len()
                );
            }
        }

        for dependency in &self.dependencies {
            if dependency.src == SubpassTarget::External && dependency.dst == SubpassTarget::External {
                anyhow::bail!("Dependency must involve at least one subpass");
            }
            for target in [dependency.src, dependency.dst] {
                if let SubpassTarget::Subpass(id) = target {
                    if id.0 >= subpass_count {
                        return Err(GfxError::InvalidSubpass {
                            index: id.0,
                            count: subpass_count,
                        }
                        .into());
                    }
                }
            }
        }

        Ok(())
    }

    /// Compile against the current swapchain
    pub fn build<B: GraphBackend>(self, backend: Arc<B>, target: &SwapchainInfo) -> Result<RenderGraph<B>> {
        self.validate()?;

        let clear_values = self
            .attachments
            .iter()
            .map(|a| a.clear_value(self.clear_color))
            .collect();

        let mut graph = RenderGraph {
            render_pass: vk::RenderPass::null(),
            attachments: self.attachments,
            subpasses: Vec::new(),
            dependencies: self.dependencies,
            clear_values,
            format: target.format,
            extent: target.extent,
            framebuffers: Vec::new(),
            transient: Vec::new(),
            backend,
        };

        if self.subpasses.is_empty() {
            log::debug!("Render graph has no subpasses, nothing to compile");
            return Ok(graph);
        }

        let mut pending = Vec::with_capacity(self.subpasses.len());
        for (subpass, pipelines) in self.subpasses {
            graph.subpasses.push(CompiledSubpass {
                subpass,
                pipelines: Vec::new(),
            });
            pending.push(pipelines);
        }

        graph.render_pass = graph.create_render_pass()?;

        for (index, pipelines) in pending.into_iter().enumerate() {
            for pipeline in pipelines {
                graph.compile(SubpassId(index), pipeline)?;
            }
        }

        graph.rebuild_framebuffers(target)?;

        log::debug!(
            "Built render graph: {} attachments, {} subpasses",
            graph.attachments.len(),
            graph.subpasses.len()
        );

        Ok(graph)
    }
}

struct CompiledSubpass {
    subpass: Subpass,
    pipelines: Vec<CompiledPipeline>,
}

/// Keep `graph`'s framebuffers in step with every swapchain recreation.
/// The subscription lapses once the last reference to the graph is dropped.
pub fn rebuild_on_recreate<B>(graph: &Arc<Mutex<RenderGraph<B>>>, on_recreate: &Signal<SwapchainInfo>) -> SubscriptionId
where
    B: GraphBackend + Send + Sync + 'static,
{
    on_recreate.connect_weak(graph, |graph: &Mutex<RenderGraph<B>>, info: &SwapchainInfo| {
        graph.lock().rebuild_framebuffers(info)
    })
}

pub struct RenderGraph<B: GraphBackend = Device> {
    render_pass: vk::RenderPass,
    attachments: Vec<Attachment>,
    subpasses: Vec<CompiledSubpass>,
    dependencies: Vec<Dependency>,
    clear_values: Vec<ClearValue>,
    format: vk::Format,
    extent: vk::Extent2D,
    framebuffers: Vec<vk::Framebuffer>,
    /// Indexed by attachment, `None` for swapchain attachments
    transient: Vec<Option<TransientImage>>,
    backend: Arc<B>,
}

impl<B: GraphBackend> RenderGraph<B> {
    /// Compile and add a pipeline after the graph was built
    pub fn attach(&mut self, subpass: SubpassId, pipeline: Pipeline) -> Result<PipelineId> {
        self.compile(subpass, pipeline)
    }

    fn compile(&mut self, subpass: SubpassId, pipeline: Pipeline) -> Result<PipelineId> {
        let count = self.subpasses.len();
        if subpass.0 >= count {
            return Err(GfxError::InvalidSubpass {
                index: subpass.0,
                count,
            }
            .into());
        }

        let (handle, layout) = self.create_pipeline(subpass.0, &pipeline.state)?;

        let pipelines = &mut self.subpasses[subpass.0].pipelines;
        pipelines.push(CompiledPipeline {
            state: pipeline.state,
            pipeline: handle,
            layout,
            on_draw: pipeline.on_draw,
        });

        Ok(PipelineId {
            subpass,
            index: pipelines.len() - 1,
        })
    }

    fn create_pipeline(&self, subpass: usize, state: &PipelineState) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        let target = PipelineTarget {
            render_pass: self.render_pass,
            subpass: subpass as u32,
            color_attachments: self.subpasses[subpass].subpass.color_count(),
            extent: self.extent,
        };
        self.backend
            .create_pipeline(state, &target)
            .with_context(|| format!("Failed to compile pipeline for subpass {}", subpass))
    }

    fn create_render_pass(&self) -> Result<vk::RenderPass> {
        let descriptions: Vec<_> = self
            .attachments
            .iter()
            .map(|a| a.description(self.format))
            .collect();
        let subpasses: Vec<_> = self.subpasses.iter().map(|s| s.subpass.describe()).collect();
        let dependencies: Vec<_> = self.dependencies.iter().map(|d| d.to_vk()).collect();
        self.backend
            .create_render_pass(&descriptions, &subpasses, &dependencies)
    }

    /// Recreate the render pass for the current format and recompile every
    /// pipeline against it. Draw callbacks are kept.
    fn recompile(&mut self) -> Result<()> {
        for subpass in &mut self.subpasses {
            for pipeline in &mut subpass.pipelines {
                self.backend.destroy_pipeline(pipeline.pipeline, pipeline.layout);
                pipeline.pipeline = vk::Pipeline::null();
                pipeline.layout = vk::PipelineLayout::null();
            }
        }
        self.backend.destroy_render_pass(self.render_pass);
        self.render_pass = vk::RenderPass::null();

        self.render_pass = self.create_render_pass()?;
        for subpass in 0..self.subpasses.len() {
            for index in 0..self.subpasses[subpass].pipelines.len() {
                let (handle, layout) = self.create_pipeline(subpass, &self.subpasses[subpass].pipelines[index].state)?;
                let compiled = &mut self.subpasses[subpass].pipelines[index];
                compiled.pipeline = handle;
                compiled.layout = layout;
            }
        }
        Ok(())
    }

    /// Replace the draw callback of an attached pipeline
    pub fn set_on_draw<F>(&mut self, id: PipelineId, f: F) -> Result<()>
    where
        F: FnMut(&mut dyn CommandRecorder, &DrawContext) -> Result<()> + Send + 'static,
    {
        let pipeline = self
            .subpasses
            .get_mut(id.subpass.0)
            .and_then(|s| s.pipelines.get_mut(id.index))
            .with_context(|| format!("No pipeline at {:?}", id))?;
        pipeline.on_draw = Some(Box::new(f) as DrawFn);
        Ok(())
    }

    /// Recreate framebuffers and transient images for a new swapchain.
    /// A format change also recreates the render pass and its pipelines.
    pub fn rebuild_framebuffers(&mut self, target: &SwapchainInfo) -> Result<()> {
        self.destroy_targets();
        self.extent = target.extent;

        if target.format != self.format {
            log::info!(
                "Swapchain format changed from {:?} to {:?}, recompiling render pass",
                self.format,
                target.format
            );
            self.format = target.format;
            if self.render_pass != vk::RenderPass::null() {
                self.recompile()?;
            }
        }

        if self.render_pass == vk::RenderPass::null() {
            return Ok(());
        }

        for attachment in &self.attachments {
            let image = match attachment.source {
                AttachmentSource::Swapchain => None,
                AttachmentSource::Transient => Some(self.backend.create_transient_image(
                    &TransientImageDesc {
                        format: attachment.resolved_format(self.format),
                        extent: self.extent,
                        usage: attachment.usage(),
                        aspect: attachment.aspect(),
                        samples: attachment.samples,
                    },
                )?),
            };
            self.transient.push(image);
        }

        for &swapchain_view in &target.views {
            let views: Vec<vk::ImageView> = self
                .transient
                .iter()
                .map(|t| t.as_ref().map_or(swapchain_view, |t| t.view))
                .collect();
            let framebuffer = self
                .backend
                .create_framebuffer(self.render_pass, &views, self.extent)?;
            self.framebuffers.push(framebuffer);
        }

        log::debug!(
            "Rebuilt {} framebuffers at {}x{}",
            self.framebuffers.len(),
            self.extent.width,
            self.extent.height
        );

        Ok(())
    }

    /// Record the whole pass for swapchain image `frame_index`
    pub fn process(&mut self, frame_index: u32, recorder: &mut dyn CommandRecorder) -> Result<()> {
        if self.subpasses.is_empty() {
            return Ok(());
        }

        let framebuffer = *self
            .framebuffers
            .get(frame_index as usize)
            .ok_or(GfxError::ImageIndexOutOfRange {
                index: frame_index,
                count: self.framebuffers.len() as u32,
            })?;
        let clear_values: Vec<vk::ClearValue> = self.clear_values.iter().map(|c| c.to_vk()).collect();
        let extent = self.extent;

        recorder.begin_render_pass(
            self.render_pass,
            framebuffer,
            pipeline::full_scissor(extent),
            &clear_values,
        );

        for (index, subpass) in self.subpasses.iter_mut().enumerate() {
            if index > 0 {
                recorder.next_subpass();
            }
            for pipeline in &mut subpass.pipelines {
                pipeline.record(recorder, extent, frame_index)?;
            }
        }

        recorder.end_render_pass();
        Ok(())
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn subpass_count(&self) -> usize {
        self.subpasses.len()
    }

    pub fn clear_values(&self) -> &[ClearValue] {
        &self.clear_values
    }

    fn destroy_targets(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.backend.destroy_framebuffer(framebuffer);
        }
        for image in self.transient.drain(..).flatten() {
            self.backend.destroy_transient_image(image);
        }
    }
}

impl<B: GraphBackend> Drop for RenderGraph<B> {
    fn drop(&mut self) {
        self.destroy_targets();
        for subpass in &mut self.subpasses {
            for pipeline in subpass.pipelines.drain(..) {
                if pipeline.pipeline != vk::Pipeline::null() {
                    self.backend.destroy_pipeline(pipeline.pipeline, pipeline.layout);
                }
            }
        }
        if self.render_pass != vk::RenderPass::null() {
            self.backend.destroy_render_pass(self.render_pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::command::testing::{CommandLog, Recorded};
    use ash::vk::Handle;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        CreateRenderPass {
            formats: Vec<vk::Format>,
            subpasses: usize,
            dependencies: Vec<(u32, u32)>,
        },
        DestroyRenderPass,
        CreateFramebuffer {
            views: Vec<vk::ImageView>,
            width: u32,
        },
        DestroyFramebuffer,
        CreateImage {
            format: vk::Format,
            width: u32,
        },
        DestroyImage,
        CreatePipeline {
            subpass: u32,
            color_attachments: u32,
        },
        DestroyPipeline,
    }

    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<Call>>,
        next_handle: Mutex<u64>,
    }

    impl FakeBackend {
        fn handle(&self) -> u64 {
            let mut next = self.next_handle.lock();
            *next += 1;
            100 + *next
        }

        fn push(&self, call: Call) {
            self.calls.lock().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| pred(c)).count()
        }
    }

    impl GraphBackend for FakeBackend {
        fn create_render_pass(
            &self,
            attachments: &[vk::AttachmentDescription],
            subpasses: &[vk::SubpassDescription],
            dependencies: &[vk::SubpassDependency],
        ) -> Result<vk::RenderPass> {
            self.push(Call::CreateRenderPass {
                formats: attachments.iter().map(|a| a.format).collect(),
                subpasses: subpasses.len(),
                dependencies: dependencies
                    .iter()
                    .map(|d| (d.src_subpass, d.dst_subpass))
                    .collect(),
            });
            Ok(vk::RenderPass::from_raw(self.handle()))
        }

        fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
            self.push(Call::DestroyRenderPass);
        }

        fn create_framebuffer(
            &self,
            _render_pass: vk::RenderPass,
            views: &[vk::ImageView],
            extent: vk::Extent2D,
        ) -> Result<vk::Framebuffer> {
            self.push(Call::CreateFramebuffer {
                views: views.to_vec(),
                width: extent.width,
            });
            Ok(vk::Framebuffer::from_raw(self.handle()))
        }

        fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
            self.push(Call::DestroyFramebuffer);
        }

        fn create_transient_image(&self, desc: &TransientImageDesc) -> Result<TransientImage> {
            self.push(Call::CreateImage {
                format: desc.format,
                width: desc.extent.width,
            });
            Ok(TransientImage {
                image: vk::Image::from_raw(self.handle()),
                view: vk::ImageView::from_raw(self.handle()),
                allocation: None,
            })
        }

        fn destroy_transient_image(&self, _image: TransientImage) {
            self.push(Call::DestroyImage);
        }

        fn create_pipeline(
            &self,
            _state: &PipelineState,
            target: &PipelineTarget,
        ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
            self.push(Call::CreatePipeline {
                subpass: target.subpass,
                color_attachments: target.color_attachments,
            });
            Ok((
                vk::Pipeline::from_raw(self.handle()),
                vk::PipelineLayout::from_raw(self.handle()),
            ))
        }

        fn destroy_pipeline(&self, _pipeline: vk::Pipeline, _layout: vk::PipelineLayout) {
            self.push(Call::DestroyPipeline);
        }
    }

    fn swapchain(images: u64, width: u32) -> SwapchainInfo {
        SwapchainInfo {
            format: vk::Format::B8G8R8A8_SRGB,
            extent: vk::Extent2D { width, height: 600 },
            views: (0..images).map(|i| vk::ImageView::from_raw(1 + i)).collect(),
        }
    }

    fn drawing(count: u32) -> Pipeline {
        Pipeline::new().on_draw(move |rec, _| {
            rec.draw(count, 1, 0, 0);
            Ok(())
        })
    }

    #[test]
    fn test_process_records_one_pass_in_order() {
        let backend = Arc::new(FakeBackend::default());
        let mut builder = RenderGraphBuilder::new();
        let color = builder.add_attachment(Attachment::color());
        let a = builder.add_subpass(Subpass::new().color(color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        let b = builder.add_subpass(Subpass::new().color(color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        builder.add_dependency(Dependency::new(a, b));
        builder.add_pipeline(a, drawing(1)).unwrap();
        builder.add_pipeline(a, Pipeline::new()).unwrap(); // no callback, skipped
        builder.add_pipeline(a, drawing(2)).unwrap();
        builder.add_pipeline(b, drawing(3)).unwrap();

        let mut graph = builder.build(backend.clone(), &swapchain(2, 800)).unwrap();

        let mut log = CommandLog::default();
        graph.process(1, &mut log).unwrap();

        let draws: Vec<&Recorded> = log
            .commands
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Recorded::BeginRenderPass { .. }
                        | Recorded::NextSubpass
                        | Recorded::EndRenderPass
                        | Recorded::Draw(_)
                )
            })
            .collect();
        assert!(matches!(draws[0], Recorded::BeginRenderPass { width: 800, height: 600, clear_count: 1, .. }));
        assert_eq!(
            draws[1..],
            [
                &Recorded::Draw(1),
                &Recorded::Draw(2),
                &Recorded::NextSubpass,
                &Recorded::Draw(3),
                &Recorded::EndRenderPass,
            ]
        );
        assert_eq!(
            log.commands
                .iter()
                .filter(|c| matches!(c, Recorded::BindPipeline(_)))
                .count(),
            3
        );
    }

    #[test]
    fn test_process_uses_framebuffer_for_frame() {
        let backend = Arc::new(FakeBackend::default());
        let (mut builder, main) = RenderGraphBuilder::presenting(DEFAULT_CLEAR_COLOR);
        builder.add_pipeline(main, drawing(3)).unwrap();
        let mut graph = builder.build(backend.clone(), &swapchain(3, 800)).unwrap();

        let mut first = CommandLog::default();
        let mut second = CommandLog::default();
        graph.process(0, &mut first).unwrap();
        graph.process(2, &mut second).unwrap();

        let framebuffer = |log: &CommandLog| match log.commands[0] {
            Recorded::BeginRenderPass { framebuffer, .. } => framebuffer,
            ref other => panic!("expected begin, got {:?}", other),
        };
        assert_ne!(framebuffer(&first), framebuffer(&second));
    }

    #[test]
    fn test_process_frame_out_of_range() {
        let backend = Arc::new(FakeBackend::default());
        let (builder, _) = RenderGraphBuilder::presenting(DEFAULT_CLEAR_COLOR);
        let mut graph = builder.build(backend, &swapchain(2, 800)).unwrap();

        let mut log = CommandLog::default();
        let err = graph.process(2, &mut log).unwrap_err();
        assert!(GfxError::matches(&err, |e| matches!(
            e,
            GfxError::ImageIndexOutOfRange { index: 2, count: 2 }
        )));
        assert!(log.commands.is_empty());
    }

    #[test]
    fn test_empty_graph_is_a_noop() {
        let backend = Arc::new(FakeBackend::default());
        let mut graph = RenderGraphBuilder::new()
            .build(backend.clone(), &swapchain(2, 800))
            .unwrap();

        let mut log = CommandLog::default();
        graph.process(0, &mut log).unwrap();
        assert!(log.commands.is_empty());
        assert!(backend.calls().is_empty());
        assert_eq!(graph.render_pass(), vk::RenderPass::null());

        drop(graph);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_build_rejects_bad_attachment_index() {
        let backend = Arc::new(FakeBackend::default());
        let mut builder = RenderGraphBuilder::new();
        builder.add_attachment(Attachment::color());
        builder.add_subpass(Subpass::new().color(3, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));

        let err = builder.build(backend.clone(), &swapchain(2, 800)).err().unwrap();
        assert!(GfxError::matches(&err, |e| matches!(
            e,
            GfxError::InvalidAttachment {
                subpass: 0,
                attachment: 3,
                count: 1
            }
        )));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_build_rejects_bad_dependency() {
        let mut builder = RenderGraphBuilder::new();
        let color = builder.add_attachment(Attachment::color());
        let main = builder.add_subpass(Subpass::new().color(color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        builder.add_dependency(Dependency::new(main, SubpassId(4)));

        let err = builder.validate().unwrap_err();
        assert!(GfxError::matches(&err, |e| matches!(
            e,
            GfxError::InvalidSubpass { index: 4, count: 1 }
        )));
    }

    #[test]
    fn test_build_rejects_external_to_external() {
        let mut builder = RenderGraphBuilder::new();
        builder.add_dependency(Dependency::new(SubpassTarget::External, SubpassTarget::External));
        assert!(builder.validate().is_err());
    }

    #[test]
    fn test_build_rejects_resolve_count_mismatch() {
        let mut builder = RenderGraphBuilder::new();
        let msaa = builder.add_attachment(
            Attachment::color()
                .transient()
                .with_samples(vk::SampleCountFlags::TYPE_4),
        );
        let a = builder.add_attachment(Attachment::color());
        let b = builder.add_attachment(Attachment::color());
        builder.add_subpass(
            Subpass::new()
                .color(msaa, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .resolve(a, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .resolve(b, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        assert!(builder.validate().is_err());
    }

    #[test]
    fn test_add_pipeline_to_missing_subpass() {
        let mut builder = RenderGraphBuilder::new();
        let err = builder.add_pipeline(SubpassId(0), Pipeline::new()).unwrap_err();
        assert!(GfxError::matches(&err, |e| matches!(
            e,
            GfxError::InvalidSubpass { index: 0, count: 0 }
        )));
    }

    #[test]
    fn test_build_compiles_against_swapchain() {
        let backend = Arc::new(FakeBackend::default());
        let mut builder = RenderGraphBuilder::new();
        let color = builder.add_attachment(Attachment::color());
        let depth = builder.add_attachment(Attachment::depth());
        let main = builder.add_subpass(
            Subpass::new()
                .color(color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .depth(depth, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
        builder.add_dependency(Dependency::new(SubpassTarget::External, main));
        builder.add_pipeline(main, drawing(3)).unwrap();

        let graph = builder.build(backend.clone(), &swapchain(3, 800)).unwrap();
        let calls = backend.calls();

        assert_eq!(
            calls[0],
            Call::CreateRenderPass {
                formats: vec![vk::Format::B8G8R8A8_SRGB, vk::Format::D32_SFLOAT],
                subpasses: 1,
                dependencies: vec![(vk::SUBPASS_EXTERNAL, 0)],
            }
        );
        assert_eq!(
            calls[1],
            Call::CreatePipeline {
                subpass: 0,
                color_attachments: 1
            }
        );
        assert_eq!(
            calls[2],
            Call::CreateImage {
                format: vk::Format::D32_SFLOAT,
                width: 800
            }
        );

        // every framebuffer pairs its own swapchain view with the shared depth view
        let framebuffers: Vec<Vec<vk::ImageView>> = calls
            .iter()
            .filter_map(|c| match c {
                Call::CreateFramebuffer { views, .. } => Some(views.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(framebuffers.len(), 3);
        for (i, views) in framebuffers.iter().enumerate() {
            assert_eq!(views[0], vk::ImageView::from_raw(1 + i as u64));
            assert_eq!(views[1], framebuffers[0][1]);
        }
        assert_eq!(graph.framebuffer_count(), 3);
        assert_eq!(graph.clear_values().len(), 2);
    }

    #[test]
    fn test_rebuild_replaces_size_dependent_objects() {
        let backend = Arc::new(FakeBackend::default());
        let mut builder = RenderGraphBuilder::new();
        let color = builder.add_attachment(Attachment::color());
        let depth = builder.add_attachment(Attachment::depth());
        builder.add_subpass(
            Subpass::new()
                .color(color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .depth(depth, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
        let mut graph = builder.build(backend.clone(), &swapchain(3, 800)).unwrap();
        backend.calls.lock().clear();

        graph.rebuild_framebuffers(&swapchain(2, 1024)).unwrap();

        assert_eq!(backend.count(|c| *c == Call::DestroyFramebuffer), 3);
        assert_eq!(backend.count(|c| *c == Call::DestroyImage), 1);
        assert_eq!(
            backend.count(|c| matches!(c, Call::CreateFramebuffer { width: 1024, .. })),
            2
        );
        assert_eq!(
            backend.count(|c| matches!(c, Call::CreateImage { width: 1024, .. })),
            1
        );
        // render pass and pipelines survive a resize
        assert_eq!(backend.count(|c| matches!(c, Call::CreateRenderPass { .. })), 0);
        assert_eq!(graph.extent().width, 1024);
        assert_eq!(graph.framebuffer_count(), 2);
    }

    #[test]
    fn test_format_change_recompiles_render_pass_and_pipelines() {
        let backend = Arc::new(FakeBackend::default());
        let (mut builder, main) = RenderGraphBuilder::presenting(DEFAULT_CLEAR_COLOR);
        builder.add_pipeline(main, drawing(3)).unwrap();
        builder.add_pipeline(main, drawing(4)).unwrap();
        let mut graph = builder.build(backend.clone(), &swapchain(2, 800)).unwrap();
        let old_pass = graph.render_pass();
        backend.calls.lock().clear();

        let target = SwapchainInfo {
            format: vk::Format::R8G8B8A8_UNORM,
            ..swapchain(2, 800)
        };
        graph.rebuild_framebuffers(&target).unwrap();

        assert_eq!(backend.count(|c| *c == Call::DestroyPipeline), 2);
        assert_eq!(backend.count(|c| *c == Call::DestroyRenderPass), 1);
        assert_eq!(
            backend.count(|c| matches!(
                c,
                Call::CreateRenderPass { formats, .. } if formats == &vec![vk::Format::R8G8B8A8_UNORM]
            )),
            1
        );
        assert_eq!(backend.count(|c| matches!(c, Call::CreatePipeline { .. })), 2);
        assert_eq!(graph.framebuffer_count(), 2);
        assert_ne!(graph.render_pass(), old_pass);

        // draw callbacks survive the recompile
        let mut log = CommandLog::default();
        graph.process(1, &mut log).unwrap();
        match &log.commands[0] {
            Recorded::BeginRenderPass { render_pass, .. } => assert_eq!(*render_pass, graph.render_pass()),
            other => panic!("unexpected first command {:?}", other),
        }
        assert!(log.commands.contains(&Recorded::Draw(3)));
        assert!(log.commands.contains(&Recorded::Draw(4)));

        // same format again only rebuilds framebuffers
        backend.calls.lock().clear();
        graph.rebuild_framebuffers(&target).unwrap();
        assert_eq!(backend.count(|c| matches!(c, Call::CreateRenderPass { .. })), 0);
        assert_eq!(backend.count(|c| matches!(c, Call::CreatePipeline { .. })), 0);
    }

    #[test]
    fn test_recreation_signal_rebuilds_until_graph_dropped() {
        let backend = Arc::new(FakeBackend::default());
        let (mut builder, main) = RenderGraphBuilder::presenting(DEFAULT_CLEAR_COLOR);
        builder.add_pipeline(main, drawing(3)).unwrap();
        let graph = Arc::new(Mutex::new(builder.build(backend.clone(), &swapchain(2, 800)).unwrap()));

        let on_recreate = Signal::<SwapchainInfo>::new();
        rebuild_on_recreate(&graph, &on_recreate);
        assert_eq!(on_recreate.len(), 1);
        backend.calls.lock().clear();

        on_recreate.emit(&swapchain(3, 1280)).unwrap();

        assert_eq!(backend.count(|c| *c == Call::DestroyFramebuffer), 2);
        assert_eq!(
            backend.count(|c| matches!(c, Call::CreateFramebuffer { width: 1280, .. })),
            3
        );
        {
            let mut graph = graph.lock();
            assert_eq!(graph.extent().width, 1280);
            assert_eq!(graph.framebuffer_count(), 3);

            let mut log = CommandLog::default();
            graph.process(2, &mut log).unwrap();
            assert!(matches!(log.commands[0], Recorded::BeginRenderPass { width: 1280, .. }));
        }

        drop(graph);
        assert!(on_recreate.is_empty());

        backend.calls.lock().clear();
        on_recreate.emit(&swapchain(2, 640)).unwrap();
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_dropped_graphs_leave_no_subscribers() {
        let backend = Arc::new(FakeBackend::default());
        let on_recreate = Signal::<SwapchainInfo>::new();

        for _ in 0..100 {
            let (builder, _) = RenderGraphBuilder::presenting(DEFAULT_CLEAR_COLOR);
            let graph = Arc::new(Mutex::new(builder.build(backend.clone(), &swapchain(2, 800)).unwrap()));
            rebuild_on_recreate(&graph, &on_recreate);
        }

        assert_eq!(on_recreate.len(), 0);
    }

    #[test]
    fn test_attach_after_build_and_set_on_draw() {
        let backend = Arc::new(FakeBackend::default());
        let (builder, main) = RenderGraphBuilder::presenting(DEFAULT_CLEAR_COLOR);
        let mut graph = builder.build(backend.clone(), &swapchain(2, 800)).unwrap();

        let id = graph.attach(main, Pipeline::new()).unwrap();
        assert_eq!(id, PipelineId { subpass: main, index: 0 });

        let mut log = CommandLog::default();
        graph.process(0, &mut log).unwrap();
        assert!(!log.commands.iter().any(|c| matches!(c, Recorded::Draw(_))));

        graph
            .set_on_draw(id, |rec, _| {
                rec.draw(6, 1, 0, 0);
                Ok(())
            })
            .unwrap();
        let mut log = CommandLog::default();
        graph.process(0, &mut log).unwrap();
        assert!(log.commands.contains(&Recorded::Draw(6)));

        assert!(graph.attach(SubpassId(5), Pipeline::new()).is_err());
    }

    #[test]
    fn test_drop_destroys_everything_created() {
        let backend = Arc::new(FakeBackend::default());
        let mut builder = RenderGraphBuilder::new();
        let color = builder.add_attachment(Attachment::color());
        let depth = builder.add_attachment(Attachment::depth());
        let main = builder.add_subpass(
            Subpass::new()
                .color(color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .depth(depth, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
        builder.add_pipeline(main, drawing(3)).unwrap();
        builder.add_pipeline(main, drawing(4)).unwrap();

        let graph = builder.build(backend.clone(), &swapchain(2, 800)).unwrap();
        drop(graph);

        assert_eq!(backend.count(|c| matches!(c, Call::CreateFramebuffer { .. })), 2);
        assert_eq!(backend.count(|c| *c == Call::DestroyFramebuffer), 2);
        assert_eq!(backend.count(|c| matches!(c, Call::CreatePipeline { .. })), 2);
        assert_eq!(backend.count(|c| *c == Call::DestroyPipeline), 2);
        assert_eq!(backend.count(|c| *c == Call::DestroyImage), 1);
        assert_eq!(backend.count(|c| *c == Call::DestroyRenderPass), 1);
    }

    #[test]
    fn test_presenting_dependencies() {
        let (builder, main) = RenderGraphBuilder::presenting([0.0, 0.0, 0.0, 1.0]);
        assert_eq!(builder.subpass_count(), 1);

        let deps = builder.dependencies();
        assert_eq!(deps.len(), 2);

        let incoming = deps[0].to_vk();
        assert_eq!(incoming.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(incoming.dst_subpass, main.index() as u32);
        assert_eq!(incoming.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(incoming.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

        let outgoing = deps[1].to_vk();
        assert_eq!(outgoing.src_subpass, 0);
        assert_eq!(outgoing.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(outgoing.src_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(outgoing.dst_stage_mask, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn test_clear_color_applies_to_color_attachments() {
        let backend = Arc::new(FakeBackend::default());
        let (builder, _) = RenderGraphBuilder::presenting([0.0, 0.5, 0.0, 1.0]);
        let graph = builder.build(backend, &swapchain(2, 800)).unwrap();
        assert_eq!(graph.clear_values(), &[ClearValue::Color([0.0, 0.5, 0.0, 1.0])]);
    }
}
