// Graphics pipeline declarations
//
// A `Pipeline` is the fixed-function state plus shader stages for one draw
// path, and the callback that records its draws. The graph compiles it
// against its render pass and subpass; viewport and scissor are dynamic and
// set from the swapchain extent every frame.

use anyhow::Result;
use ash::vk;
use std::fmt;

use crate::backend::CommandRecorder;

/// Handed to draw callbacks alongside the recorder
#[derive(Debug, Clone, Copy)]
pub struct DrawContext {
    pub layout: vk::PipelineLayout,
    pub extent: vk::Extent2D,
    pub frame_index: u32,
}

pub type DrawFn = Box<dyn FnMut(&mut dyn CommandRecorder, &DrawContext) -> Result<()> + Send>;

/// Y axis convention for the viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewportConvention {
    /// Vulkan native: +Y points down
    #[default]
    Standard,
    /// Negative-height viewport: +Y points up
    FlipY,
}

impl ViewportConvention {
    pub fn viewport(self, extent: vk::Extent2D) -> vk::Viewport {
        let width = extent.width as f32;
        let height = extent.height as f32;
        match self {
            ViewportConvention::Standard => vk::Viewport {
                x: 0.0,
                y: 0.0,
                width,
                height,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            ViewportConvention::FlipY => vk::Viewport {
                x: 0.0,
                y: height,
                width,
                height: -height,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        }
    }
}

pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Straight alpha blending over the destination
pub fn alpha_blend() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

/// No blending, writes every channel
pub fn opaque() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::FALSE,
        color_write_mask: vk::ColorComponentFlags::RGBA,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    pub stages: Vec<ShaderStage>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub samples: vk::SampleCountFlags,
    /// Empty means one opaque attachment per subpass color attachment
    pub blend: Vec<vk::PipelineColorBlendAttachmentState>,
    /// Depth test and write with this compare op
    pub depth_test: Option<vk::CompareOp>,
    pub push_constants: Vec<vk::PushConstantRange>,
    pub viewport: ViewportConvention,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            line_width: 1.0,
            samples: vk::SampleCountFlags::TYPE_1,
            blend: Vec::new(),
            depth_test: None,
            push_constants: Vec::new(),
            viewport: ViewportConvention::Standard,
        }
    }
}

impl PipelineState {
    /// Blend states matched to the subpass color attachment count
    pub fn blend_for(&self, color_attachments: u32) -> Vec<vk::PipelineColorBlendAttachmentState> {
        if self.blend.is_empty() {
            vec![opaque(); color_attachments as usize]
        } else {
            self.blend.clone()
        }
    }
}

/// A pipeline waiting to be attached to a graph
#[derive(Default)]
pub struct Pipeline {
    pub(crate) state: PipelineState,
    pub(crate) on_draw: Option<DrawFn>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state)
            .field("on_draw", &self.on_draw.is_some())
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: vk::ShaderStageFlags, module: vk::ShaderModule, entry: &str) -> Self {
        self.state.stages.push(ShaderStage {
            stage,
            module,
            entry: entry.to_string(),
        });
        self
    }

    pub fn vertex(self, module: vk::ShaderModule, entry: &str) -> Self {
        self.stage(vk::ShaderStageFlags::VERTEX, module, entry)
    }

    pub fn fragment(self, module: vk::ShaderModule, entry: &str) -> Self {
        self.stage(vk::ShaderStageFlags::FRAGMENT, module, entry)
    }

    pub fn vertex_layout(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.state.vertex_bindings = bindings;
        self.state.vertex_attributes = attributes;
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.state.topology = topology;
        self
    }

    pub fn polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.state.polygon_mode = mode;
        self
    }

    pub fn cull(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.state.cull_mode = cull_mode;
        self.state.front_face = front_face;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.state.samples = samples;
        self
    }

    /// Add a color blend attachment state. Call once per color attachment.
    pub fn blend(mut self, state: vk::PipelineColorBlendAttachmentState) -> Self {
        self.state.blend.push(state);
        self
    }

    pub fn depth_test(mut self, compare: vk::CompareOp) -> Self {
        self.state.depth_test = Some(compare);
        self
    }

    pub fn push_constant(mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) -> Self {
        self.state.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
        self
    }

    pub fn viewport_convention(mut self, convention: ViewportConvention) -> Self {
        self.state.viewport = convention;
        self
    }

    /// Set the callback that records this pipeline's draws
    pub fn on_draw<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut dyn CommandRecorder, &DrawContext) -> Result<()> + Send + 'static,
    {
        self.on_draw = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }
}

/// A pipeline after compilation against a render pass
pub(crate) struct CompiledPipeline {
    pub state: PipelineState,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub on_draw: Option<DrawFn>,
}

impl CompiledPipeline {
    /// Drawn only with a callback and a live pipeline
    pub fn is_ready(&self) -> bool {
        self.on_draw.is_some() && self.pipeline != vk::Pipeline::null()
    }

    pub fn record(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        extent: vk::Extent2D,
        frame_index: u32,
    ) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        let ctx = DrawContext {
            layout: self.layout,
            extent,
            frame_index,
        };

        recorder.bind_pipeline(self.pipeline);
        recorder.set_viewport(self.state.viewport.viewport(extent));
        recorder.set_scissor(full_scissor(extent));

        match self.on_draw.as_mut() {
            Some(draw) => draw(recorder, &ctx),
            None => Ok(()),
        }
    }
}
