// Built-in meshes for the demo and quick tests
//
// 2D positions with a per-vertex color, uploaded to device-local buffers.

use anyhow::Result;
use ash::vk;
use glam::{Vec2, Vec3};
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use crate::backend::{Buffer, CommandRecorder, Device};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub pos: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(pos: [f32; 2], color: [f32; 3]) -> Self {
        Self {
            pos: Vec2::new(pos[0], pos[1]),
            color: Vec3::new(color[0], color[1], color[2]),
        }
    }

    /// Vertex input description: binding 0, position at location 0,
    /// color at location 1
    pub fn layout() -> (
        Vec<vk::VertexInputBindingDescription>,
        Vec<vk::VertexInputAttributeDescription>,
    ) {
        let binding = vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        };

        let position = vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(Vertex, pos) as u32,
        };

        let color = vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, color) as u32,
        };

        (vec![binding], vec![position, color])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshKind {
    Triangle,
    Quad,
}

/// CPU-side geometry
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    /// Empty for non-indexed meshes
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn new(kind: MeshKind) -> Self {
        match kind {
            MeshKind::Triangle => Self {
                vertices: vec![
                    Vertex::new([0.0, -0.5], [1.0, 0.0, 0.0]),
                    Vertex::new([0.5, 0.5], [0.0, 1.0, 0.0]),
                    Vertex::new([-0.5, 0.5], [0.0, 0.0, 1.0]),
                ],
                indices: Vec::new(),
            },
            MeshKind::Quad => Self {
                vertices: vec![
                    Vertex::new([-0.5, -0.5], [1.0, 0.0, 0.0]),
                    Vertex::new([0.5, -0.5], [0.0, 1.0, 0.0]),
                    Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0]),
                    Vertex::new([-0.5, 0.5], [1.0, 1.0, 1.0]),
                ],
                indices: vec![0, 1, 2, 2, 3, 0],
            },
        }
    }
}

/// Geometry resident on the GPU
pub struct Mesh {
    vertices: Buffer,
    indices: Option<Buffer>,
    vertex_count: u32,
    index_count: u32,
}

impl Mesh {
    pub fn upload(device: Arc<Device>, data: &MeshData) -> Result<Self> {
        let vertices = Buffer::device_local(
            device.clone(),
            "mesh vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &data.vertices,
        )?;
        let indices = if data.indices.is_empty() {
            None
        } else {
            Some(Buffer::device_local(
                device,
                "mesh indices",
                vk::BufferUsageFlags::INDEX_BUFFER,
                &data.indices,
            )?)
        };

        log::debug!(
            "Uploaded mesh: {} vertices, {} indices",
            data.vertices.len(),
            data.indices.len()
        );

        Ok(Self {
            vertices,
            indices,
            vertex_count: data.vertices.len() as u32,
            index_count: data.indices.len() as u32,
        })
    }

    pub fn draw(&self, recorder: &mut dyn CommandRecorder) {
        recorder.bind_vertex_buffer(0, self.vertices.buffer, 0);
        match &self.indices {
            Some(indices) => {
                recorder.bind_index_buffer(indices.buffer, 0, vk::IndexType::UINT32);
                recorder.draw_indexed(self.index_count, 1, 0, 0, 0);
            }
            None => recorder.draw(self.vertex_count, 1, 0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_matches_struct() {
        assert_eq!(size_of::<Vertex>(), 20);

        let (bindings, attributes) = Vertex::layout();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].offset, 8);
        assert_eq!(attributes[1].format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn test_triangle_is_not_indexed() {
        let data = MeshData::new(MeshKind::Triangle);
        assert_eq!(data.vertices.len(), 3);
        assert!(data.indices.is_empty());
    }

    #[test]
    fn test_quad_indices_stay_in_range() {
        let data = MeshData::new(MeshKind::Quad);
        assert_eq!(data.vertices.len(), 4);
        assert_eq!(data.indices.len(), 6);
        assert!(data.indices.iter().all(|&i| (i as usize) < data.vertices.len()));
    }
}
