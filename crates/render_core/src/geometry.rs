//! Triangle geometry, its GPU buffers, and the constant blocks the ray
//! tracing programs read.

use crate::assets::AssetError;
use crate::buffer::{BufferUsage, GpuBuffer, ResourceState};
use crate::command::CommandRecorder;
use crate::device::TriangleGeometry;
use crate::device_context::DeviceContext;
use crate::error::GpuResult;
use crate::upload::UploadPipeline;
use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Point3, Vector3};

/// Position and texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Texture coordinate
    pub uv: [f32; 2],
}

impl Vertex {
    /// Create a vertex
    pub const fn new(position: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, uv }
    }

    /// Byte stride in a vertex buffer
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Indexed triangle list. Every index is below the vertex count.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
}

impl Geometry {
    /// Validate and wrap vertex and index data
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self, AssetError> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(AssetError::InvalidGeometry("geometry has no triangles".to_string()));
        }
        if indices.len() % 3 != 0 {
            return Err(AssetError::InvalidGeometry(format!(
                "{} indices do not form whole triangles",
                indices.len()
            )));
        }
        let vertex_count = vertices.len();
        if let Some(position) = indices.iter().position(|&index| index as usize >= vertex_count) {
            return Err(AssetError::InvalidGeometry(format!(
                "index {} at position {position} out of range for {vertex_count} vertices",
                indices[position]
            )));
        }
        Ok(Self { vertices, indices })
    }

    /// Vertices
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Indices
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Number of triangles
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Axis-aligned cube with extent ±0.5 and per-face texture coordinates
    pub fn unit_cube() -> Self {
        const FACES: [[[f32; 3]; 4]; 6] = [
            // front
            [[-0.5, 0.5, -0.5], [0.5, -0.5, -0.5], [-0.5, -0.5, -0.5], [0.5, 0.5, -0.5]],
            // right
            [[0.5, -0.5, -0.5], [0.5, 0.5, 0.5], [0.5, -0.5, 0.5], [0.5, 0.5, -0.5]],
            // left
            [[-0.5, 0.5, 0.5], [-0.5, -0.5, -0.5], [-0.5, -0.5, 0.5], [-0.5, 0.5, -0.5]],
            // back
            [[0.5, 0.5, 0.5], [-0.5, -0.5, 0.5], [0.5, -0.5, 0.5], [-0.5, 0.5, 0.5]],
            // top
            [[-0.5, 0.5, -0.5], [0.5, 0.5, 0.5], [0.5, 0.5, -0.5], [-0.5, 0.5, 0.5]],
            // bottom
            [[0.5, -0.5, 0.5], [-0.5, -0.5, -0.5], [0.5, -0.5, -0.5], [-0.5, -0.5, 0.5]],
        ];
        const UVS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 1.0], [0.0, 1.0], [1.0, 0.0]];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (face, corners) in FACES.iter().enumerate() {
            let base = (face * 4) as u32;
            vertices.extend(corners.iter().zip(UVS).map(|(position, uv)| Vertex::new(*position, uv)));
            indices.extend([base, base + 1, base + 2, base, base + 3, base + 1]);
        }

        Self { vertices, indices }
    }
}

/// Vertex and index buffers resident on the GPU
pub struct MeshBuffers {
    /// Vertex data in `VERTEX_AND_CONSTANT_BUFFER`
    pub vertices: GpuBuffer,
    /// Index data in `INDEX_BUFFER`
    pub indices: GpuBuffer,
    /// Number of vertices
    pub vertex_count: u32,
    /// Number of indices
    pub index_count: u32,
}

impl MeshBuffers {
    /// Record uploads of both buffers
    pub fn upload(
        ctx: &DeviceContext,
        upload: &mut UploadPipeline,
        recorder: &mut CommandRecorder,
        geometry: &Geometry,
    ) -> GpuResult<Self> {
        let vertices = upload.create_resident_pod(
            ctx,
            recorder,
            geometry.vertices(),
            BufferUsage::VERTEX | BufferUsage::BUILD_INPUT | BufferUsage::STORAGE,
            ResourceState::VERTEX_AND_CONSTANT_BUFFER,
            "vertex buffer",
        )?;
        let indices = upload.create_resident_pod(
            ctx,
            recorder,
            geometry.indices(),
            BufferUsage::INDEX | BufferUsage::BUILD_INPUT | BufferUsage::STORAGE,
            ResourceState::INDEX_BUFFER,
            "index buffer",
        )?;
        log::info!(
            "Uploaded mesh: {} vertices, {} triangles",
            geometry.vertices().len(),
            geometry.triangle_count()
        );

        Ok(Self {
            vertices,
            indices,
            vertex_count: u32::try_from(geometry.vertices().len()).unwrap_or(u32::MAX),
            index_count: u32::try_from(geometry.indices().len()).unwrap_or(u32::MAX),
        })
    }

    /// Build input description for a bottom-level structure
    pub const fn triangles(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertices: self.vertices.range(),
            vertex_count: self.vertex_count,
            vertex_stride: Vertex::STRIDE,
            indices: self.indices.range(),
            index_count: self.index_count,
            opaque: true,
        }
    }
}

/// Per-frame camera constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ViewConstants {
    /// World-to-view matrix, column-major
    pub view: [[f32; 4]; 4],
    /// Camera position in xyz, tan(fov_y / 2) in w
    pub view_origin_and_tan_half_fov_y: [f32; 4],
    /// Output width and height in pixels
    pub resolution: [f32; 2],
    /// Keeps the block a multiple of 16 bytes
    pub padding: [f32; 2],
}

impl ViewConstants {
    /// Camera orbiting the origin at `radius`, `angle` radians around the y axis
    pub fn orbit(angle: f32, radius: f32, fov_y: f32, width: u32, height: u32) -> Self {
        let eye = Point3::new(radius * angle.sin(), radius * 0.5, -radius * angle.cos());
        let view = Matrix4::look_at_rh(&eye, &Point3::origin(), &Vector3::y());
        Self {
            view: view.into(),
            view_origin_and_tan_half_fov_y: [eye.x, eye.y, eye.z, (fov_y * 0.5).tan()],
            resolution: [width as f32, height as f32],
            padding: [0.0; 2],
        }
    }
}

/// Material constants read by the hit program
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialConstants {
    /// Texture width and height in xy
    pub resolution: [f32; 4],
}

impl MaterialConstants {
    /// Constants for a texture of the given size
    pub fn for_texture(width: u32, height: u32) -> Self {
        Self {
            resolution: [width as f32, height as f32, 0.0, 0.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unit_cube_shape() {
        let cube = Geometry::unit_cube();
        assert_eq!(cube.vertices().len(), 24);
        assert_eq!(cube.indices().len(), 36);
        assert_eq!(cube.triangle_count(), 12);
        assert!(cube.indices().iter().all(|&i| i < 24));
        for vertex in cube.vertices() {
            for coordinate in vertex.position {
                assert_relative_eq!(coordinate.abs(), 0.5);
            }
        }
        assert_eq!(&cube.indices()[..6], &[0, 1, 2, 0, 3, 1]);
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let vertices = vec![Vertex::new([0.0; 3], [0.0; 2]); 3];
        assert!(Geometry::new(vertices.clone(), vec![0, 1, 2]).is_ok());
        assert!(Geometry::new(vertices.clone(), vec![0, 1, 3]).is_err());
        assert!(Geometry::new(vertices, vec![0, 1]).is_err());
    }

    #[test]
    fn test_vertex_layout() {
        assert_eq!(Vertex::STRIDE, 20);
        assert_eq!(std::mem::size_of::<ViewConstants>(), 96);
        assert_eq!(std::mem::size_of::<MaterialConstants>(), 16);
    }

    #[test]
    fn test_orbit_camera() {
        let constants = ViewConstants::orbit(0.0, 4.0, std::f32::consts::FRAC_PI_2, 1280, 720);
        assert_relative_eq!(constants.view_origin_and_tan_half_fov_y[0], 0.0);
        assert_relative_eq!(constants.view_origin_and_tan_half_fov_y[2], -4.0);
        assert_relative_eq!(constants.view_origin_and_tan_half_fov_y[3], 1.0, epsilon = 1e-6);
        assert_relative_eq!(constants.resolution[0], 1280.0);
    }
}
