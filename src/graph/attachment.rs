// Render pass attachments
//
// Swapchain attachments inherit the swapchain format unless one is given.
// Transient attachments are images the graph allocates itself and sizes to
// the swapchain extent on every rebuild.

use ash::vk;

/// Clear value for one attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// Where an attachment's image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentSource {
    /// One view per swapchain image
    Swapchain,
    /// Allocated by the graph, one image shared by every framebuffer
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Color,
    Depth,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub source: AttachmentSource,
    /// `None` inherits the swapchain format
    pub format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    /// `None` uses the graph's default for this kind
    pub clear: Option<ClearValue>,
}

impl Attachment {
    /// Swapchain color target: cleared, stored, ends ready to present
    pub fn color() -> Self {
        Self {
            kind: AttachmentKind::Color,
            source: AttachmentSource::Swapchain,
            format: None,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            clear: None,
        }
    }

    /// Transient D32 depth buffer, contents discarded after the pass
    pub fn depth() -> Self {
        Self {
            kind: AttachmentKind::Depth,
            source: AttachmentSource::Transient,
            format: Some(vk::Format::D32_SFLOAT),
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            clear: None,
        }
    }

    pub fn transient(mut self) -> Self {
        self.source = AttachmentSource::Transient;
        self
    }

    pub fn with_format(mut self, format: vk::Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_ops(mut self, load: vk::AttachmentLoadOp, store: vk::AttachmentStoreOp) -> Self {
        self.load_op = load;
        self.store_op = store;
        self
    }

    pub fn with_stencil_ops(mut self, load: vk::AttachmentLoadOp, store: vk::AttachmentStoreOp) -> Self {
        self.stencil_load_op = load;
        self.stencil_store_op = store;
        self
    }

    pub fn with_layouts(mut self, initial: vk::ImageLayout, last: vk::ImageLayout) -> Self {
        self.initial_layout = initial;
        self.final_layout = last;
        self
    }

    pub fn with_clear(mut self, clear: ClearValue) -> Self {
        self.clear = Some(clear);
        self
    }

    pub fn resolved_format(&self, swapchain_format: vk::Format) -> vk::Format {
        self.format.unwrap_or(swapchain_format)
    }

    pub fn clear_value(&self, default_color: [f32; 4]) -> ClearValue {
        self.clear.unwrap_or(match self.kind {
            AttachmentKind::Color => ClearValue::Color(default_color),
            AttachmentKind::Depth => ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
        })
    }

    pub fn description(&self, swapchain_format: vk::Format) -> vk::AttachmentDescription {
        vk::AttachmentDescription {
            format: self.resolved_format(swapchain_format),
            samples: self.samples,
            load_op: self.load_op,
            store_op: self.store_op,
            stencil_load_op: self.stencil_load_op,
            stencil_store_op: self.stencil_store_op,
            initial_layout: self.initial_layout,
            final_layout: self.final_layout,
            ..Default::default()
        }
    }

    /// Usage flags for a transient image backing this attachment
    pub fn usage(&self) -> vk::ImageUsageFlags {
        match self.kind {
            AttachmentKind::Color => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            AttachmentKind::Depth => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        }
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        match self.kind {
            AttachmentKind::Color => vk::ImageAspectFlags::COLOR,
            AttachmentKind::Depth => vk::ImageAspectFlags::DEPTH,
        }
    }
}
