// Command recording seam
//
// Render graphs and tasks record through `CommandRecorder` rather than
// calling ash directly, which keeps their ordering logic testable.

use ash::vk;

pub trait CommandRecorder {
    /// Underlying command buffer, for commands this trait does not cover.
    /// Null when recording into something that is not a real command buffer.
    fn command_buffer(&self) -> vk::CommandBuffer;

    fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    );
    fn next_subpass(&mut self);
    fn end_render_pass(&mut self);

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);
    fn set_viewport(&mut self, viewport: vk::Viewport);
    fn set_scissor(&mut self, scissor: vk::Rect2D);

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize);
    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType);
    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
}

/// Records straight into a Vulkan command buffer
pub struct DeviceRecorder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
}

impl<'a> DeviceRecorder<'a> {
    pub fn new(device: &'a ash::Device, cmd: vk::CommandBuffer) -> Self {
        Self { device, cmd }
    }
}

impl CommandRecorder for DeviceRecorder<'_> {
    fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(self.cmd, &begin_info, vk::SubpassContents::INLINE)
        };
    }

    fn next_subpass(&mut self) {
        unsafe { self.device.cmd_next_subpass(self.cmd, vk::SubpassContents::INLINE) };
    }

    fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.cmd) };
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(self.cmd, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(self.cmd, 0, &[scissor]) };
    }

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.cmd, binding, &[buffer], &[offset])
        };
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd, buffer, offset, index_type)
        };
    }

    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(self.cmd, layout, stages, offset, data)
        };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw(
                self.cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }
}
