// GPU object creation for render graphs
//
// The graph decides what to build and when; `GraphBackend` does the Vulkan
// calls. `Device` is the real implementation.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::ffi::CString;

use super::pipeline::PipelineState;
use crate::backend::Device;

/// Graph-owned image backing a transient attachment
pub struct TransientImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransientImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub samples: vk::SampleCountFlags,
}

/// Where a pipeline is being compiled
#[derive(Debug, Clone, Copy)]
pub struct PipelineTarget {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub color_attachments: u32,
    pub extent: vk::Extent2D,
}

pub trait GraphBackend {
    fn create_render_pass(
        &self,
        attachments: &[vk::AttachmentDescription],
        subpasses: &[vk::SubpassDescription],
        dependencies: &[vk::SubpassDependency],
    ) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_transient_image(&self, desc: &TransientImageDesc) -> Result<TransientImage>;
    fn destroy_transient_image(&self, image: TransientImage);

    fn create_pipeline(
        &self,
        state: &PipelineState,
        target: &PipelineTarget,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout);
}

impl GraphBackend for Device {
    fn create_render_pass(
        &self,
        attachments: &[vk::AttachmentDescription],
        subpasses: &[vk::SubpassDescription],
        dependencies: &[vk::SubpassDependency],
    ) -> Result<vk::RenderPass> {
        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        unsafe { self.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        unsafe { self.device.create_framebuffer(&framebuffer_info, None) }
            .context("Failed to create framebuffer")
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_transient_image(&self, desc: &TransientImageDesc) -> Result<TransientImage> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .context("Failed to create attachment image")?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocator().allocate(&AllocationCreateDesc {
            name: "transient attachment",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(anyhow::Error::new(e).context("Failed to allocate attachment memory"));
            }
        };

        let mut transient = TransientImage {
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
        };

        let bound = match transient.allocation.as_ref() {
            Some(a) => unsafe { self.device.bind_image_memory(image, a.memory(), a.offset()) },
            None => Ok(()),
        };
        if let Err(e) = bound {
            self.destroy_transient_image(transient);
            return Err(anyhow::Error::new(e).context("Failed to bind attachment memory"));
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => {
                transient.view = view;
                Ok(transient)
            }
            Err(e) => {
                self.destroy_transient_image(transient);
                Err(anyhow::Error::new(e).context("Failed to create attachment view"))
            }
        }
    }

    fn destroy_transient_image(&self, mut image: TransientImage) {
        unsafe {
            if image.view != vk::ImageView::null() {
                self.device.destroy_image_view(image.view, None);
            }
            self.device.destroy_image(image.image, None);
        }
        if let Some(allocation) = image.allocation.take() {
            if let Err(e) = self.allocator().free(allocation) {
                log::error!("Failed to free attachment memory: {}", e);
            }
        }
    }

    fn create_pipeline(
        &self,
        state: &PipelineState,
        target: &PipelineTarget,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        // Shader stages
        let entry_points = state
            .stages
            .iter()
            .map(|s| CString::new(s.entry.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("Shader entry point contains a NUL byte")?;

        let shader_stages: Vec<_> = state
            .stages
            .iter()
            .zip(&entry_points)
            .map(|(stage, entry)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(entry)
                    .build()
            })
            .collect();

        // Vertex input
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&state.vertex_bindings)
            .vertex_attribute_descriptions(&state.vertex_attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(state.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor (also dynamic, set per draw)
        let viewports = [state.viewport.viewport(target.extent)];
        let scissors = [super::pipeline::full_scissor(target.extent)];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        // Rasterization
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(state.polygon_mode)
            .line_width(state.line_width)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(state.samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(state.depth_test.is_some())
            .depth_write_enable(state.depth_test.is_some())
            .depth_compare_op(state.depth_test.unwrap_or(vk::CompareOp::ALWAYS))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Color blending
        let color_blend_attachments = state.blend_for(target.color_attachments);
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        // Pipeline layout
        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&state.push_constants);
        let pipeline_layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(target.render_pass)
            .subpass(target.subpass)
            .build();

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match pipelines {
            Ok(pipelines) => Ok((pipelines[0], pipeline_layout)),
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(pipeline_layout, None) };
                Err(anyhow::Error::new(e).context("Failed to create graphics pipeline"))
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
        unsafe {
            self.device.destroy_pipeline(pipeline, None);
            self.device.destroy_pipeline_layout(layout, None);
        }
    }
}
