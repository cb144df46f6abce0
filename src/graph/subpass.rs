// Subpasses and the dependencies between them

use ash::vk;

/// Index of a subpass within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubpassId(pub(crate) usize);

impl SubpassId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Attachment references for one subpass
#[derive(Debug, Clone, Default)]
pub struct Subpass {
    pub(crate) color: Vec<vk::AttachmentReference>,
    pub(crate) resolve: Vec<vk::AttachmentReference>,
    pub(crate) depth: Option<vk::AttachmentReference>,
    pub(crate) preserve: Vec<u32>,
}

impl Subpass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color(mut self, attachment: u32, layout: vk::ImageLayout) -> Self {
        self.color.push(vk::AttachmentReference { attachment, layout });
        self
    }

    /// One resolve target per color attachment, in the same order
    pub fn resolve(mut self, attachment: u32, layout: vk::ImageLayout) -> Self {
        self.resolve.push(vk::AttachmentReference { attachment, layout });
        self
    }

    pub fn depth(mut self, attachment: u32, layout: vk::ImageLayout) -> Self {
        self.depth = Some(vk::AttachmentReference { attachment, layout });
        self
    }

    pub fn preserve(mut self, attachment: u32) -> Self {
        self.preserve.push(attachment);
        self
    }

    pub fn color_count(&self) -> u32 {
        self.color.len() as u32
    }

    /// Every attachment index this subpass touches, skipping unused slots
    pub fn referenced(&self) -> impl Iterator<Item = u32> + '_ {
        self.color
            .iter()
            .chain(self.resolve.iter())
            .chain(self.depth.iter())
            .map(|r| r.attachment)
            .chain(self.preserve.iter().copied())
            .filter(|&a| a != vk::ATTACHMENT_UNUSED)
    }

    /// Vulkan description borrowing this subpass's reference arrays
    pub fn describe(&self) -> vk::SubpassDescription {
        let mut desc = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&self.color)
            .preserve_attachments(&self.preserve);
        if !self.resolve.is_empty() {
            desc = desc.resolve_attachments(&self.resolve);
        }
        if let Some(depth) = self.depth.as_ref() {
            desc = desc.depth_stencil_attachment(depth);
        }
        desc.build()
    }
}

/// Either side of a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpassTarget {
    /// Work outside the render pass
    External,
    Subpass(SubpassId),
}

impl SubpassTarget {
    pub(crate) fn raw(self) -> u32 {
        match self {
            SubpassTarget::External => vk::SUBPASS_EXTERNAL,
            SubpassTarget::Subpass(id) => id.0 as u32,
        }
    }
}

impl From<SubpassId> for SubpassTarget {
    fn from(id: SubpassId) -> Self {
        SubpassTarget::Subpass(id)
    }
}

/// Execution and memory dependency between two subpasses
#[derive(Debug, Clone, Copy)]
pub struct Dependency {
    pub src: SubpassTarget,
    pub dst: SubpassTarget,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub flags: vk::DependencyFlags,
}

impl Dependency {
    pub fn new(src: impl Into<SubpassTarget>, dst: impl Into<SubpassTarget>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            src_stage: vk::PipelineStageFlags::empty(),
            dst_stage: vk::PipelineStageFlags::empty(),
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::empty(),
            flags: vk::DependencyFlags::empty(),
        }
    }

    pub fn stages(mut self, src: vk::PipelineStageFlags, dst: vk::PipelineStageFlags) -> Self {
        self.src_stage = src;
        self.dst_stage = dst;
        self
    }

    pub fn access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access = src;
        self.dst_access = dst;
        self
    }

    pub fn by_region(mut self) -> Self {
        self.flags |= vk::DependencyFlags::BY_REGION;
        self
    }

    pub fn to_vk(&self) -> vk::SubpassDependency {
        vk::SubpassDependency {
            src_subpass: self.src.raw(),
            dst_subpass: self.dst.raw(),
            src_stage_mask: self.src_stage,
            dst_stage_mask: self.dst_stage,
            src_access_mask: self.src_access,
            dst_access_mask: self.dst_access,
            dependency_flags: self.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referenced_skips_unused() {
        let subpass = Subpass::new()
            .color(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .color(vk::ATTACHMENT_UNUSED, vk::ImageLayout::UNDEFINED)
            .depth(2, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .preserve(3);
        let referenced: Vec<u32> = subpass.referenced().collect();
        assert_eq!(referenced, vec![0, 2, 3]);
        assert_eq!(subpass.color_count(), 2);
    }

    #[test]
    fn test_describe() {
        let subpass = Subpass::new()
            .color(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .depth(1, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        let desc = subpass.describe();
        assert_eq!(desc.pipeline_bind_point, vk::PipelineBindPoint::GRAPHICS);
        assert_eq!(desc.color_attachment_count, 1);
        assert!(desc.p_resolve_attachments.is_null());
        assert!(!desc.p_depth_stencil_attachment.is_null());
    }

    #[test]
    fn test_dependency_to_vk() {
        let dep = Dependency::new(SubpassTarget::External, SubpassId(0))
            .stages(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )
            .access(vk::AccessFlags::empty(), vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .by_region()
            .to_vk();

        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_subpass, 0);
        assert_eq!(dep.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(dep.dependency_flags, vk::DependencyFlags::BY_REGION);
    }
}
