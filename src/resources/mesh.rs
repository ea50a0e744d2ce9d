//! Mesh data structures and generation

use crate::backend::types::Vertex;
use crate::resources::texture::TextureRef;
use glam::{Vec2, Vec3};

/// Semantic role of a texture bound to a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureRole {
    Diffuse,
    Specular,
    Normal,
    Height,
}

/// A texture attached to a mesh under a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshTexture {
    pub role: TextureRole,
    pub texture: TextureRef,
}

/// CPU-side mesh: vertices, triangle indices and role-tagged textures
#[derive(Debug, Clone)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub textures: Vec<MeshTexture>,
}

impl MeshData {
    pub fn new(name: &str, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            name: name.to_string(),
            vertices,
            indices,
            textures: Vec::new(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Get vertex data as bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Get index data as bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// First texture attached under `role`
    pub fn texture(&self, role: TextureRole) -> Option<TextureRef> {
        self.textures
            .iter()
            .find(|t| t.role == role)
            .map(|t| t.texture)
    }
}

/// Area-weighted per-vertex normals from indexed triangles.
///
/// Vertices touched by no triangle, or only by degenerate ones, get +Y.
pub fn generate_smooth_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];

    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        if a >= positions.len() || b >= positions.len() || c >= positions.len() {
            continue;
        }
        // Unnormalized cross product weights by triangle area
        let face = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
        normals[a] += face;
        normals[b] += face;
        normals[c] += face;
    }

    normals
        .into_iter()
        .map(|n| n.try_normalize().unwrap_or(Vec3::Y))
        .collect()
}

/// Fill in per-vertex tangent and bitangent from positions and UVs.
///
/// Tangents are accumulated per triangle, then Gram-Schmidt orthogonalized
/// against the vertex normal. Vertices whose UVs are degenerate get an
/// arbitrary frame perpendicular to the normal.
pub fn compute_tangents(vertices: &mut [Vertex], indices: &[u32]) {
    let mut tangents = vec![Vec3::ZERO; vertices.len()];
    let mut bitangents = vec![Vec3::ZERO; vertices.len()];

    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        if a >= vertices.len() || b >= vertices.len() || c >= vertices.len() {
            continue;
        }

        let e1 = vertices[b].position - vertices[a].position;
        let e2 = vertices[c].position - vertices[a].position;
        let d1 = vertices[b].uv - vertices[a].uv;
        let d2 = vertices[c].uv - vertices[a].uv;

        let det = d1.x * d2.y - d2.x * d1.y;
        if det.abs() <= f32::EPSILON {
            continue;
        }
        let r = 1.0 / det;
        let t = (e1 * d2.y - e2 * d1.y) * r;
        let bt = (e2 * d1.x - e1 * d2.x) * r;

        for i in [a, b, c] {
            tangents[i] += t;
            bitangents[i] += bt;
        }
    }

    for (i, vertex) in vertices.iter_mut().enumerate() {
        let n = vertex.normal;
        let t = (tangents[i] - n * n.dot(tangents[i]))
            .try_normalize()
            .unwrap_or_else(|| n.any_orthonormal_vector());
        let mut b = n.cross(t);
        if b.dot(bitangents[i]) < 0.0 {
            b = -b;
        }
        vertex.tangent = t;
        vertex.bitangent = b;
    }
}

/// Unit cube around the origin, 36 positions, for the skybox
pub const SKYBOX_VERTICES: [[f32; 3]; 36] = [
    // -Z
    [-1.0, 1.0, -1.0],
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
    // -X
    [-1.0, -1.0, 1.0],
    [-1.0, -1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [-1.0, 1.0, 1.0],
    [-1.0, -1.0, 1.0],
    // +X
    [1.0, -1.0, -1.0],
    [1.0, -1.0, 1.0],
    [1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0],
    [1.0, 1.0, -1.0],
    [1.0, -1.0, -1.0],
    // +Z
    [-1.0, -1.0, 1.0],
    [-1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0],
    [1.0, -1.0, 1.0],
    [-1.0, -1.0, 1.0],
    // +Y
    [-1.0, 1.0, -1.0],
    [1.0, 1.0, -1.0],
    [1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
    [-1.0, 1.0, -1.0],
    // -Y
    [-1.0, -1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
];

/// Fullscreen quad as two triangles: clip-space xy, then texture uv.
/// Texture v grows downward, so the top edge samples v = 0.
pub const SCREEN_QUAD_VERTICES: [[f32; 4]; 6] = [
    [-1.0, 1.0, 0.0, 0.0],
    [-1.0, -1.0, 0.0, 1.0],
    [1.0, -1.0, 1.0, 1.0],
    [-1.0, 1.0, 0.0, 0.0],
    [1.0, -1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0, 0.0],
];

/// Flip a texture coordinate from bottom-left to top-left origin
pub fn flip_v(uv: Vec2) -> Vec2 {
    Vec2::new(uv.x, 1.0 - uv.y)
}
