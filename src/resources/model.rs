//! Model import from Wavefront OBJ
//!
//! Meshes are triangulated and re-indexed to a single index stream by `tobj`.
//! The importer then flips texture V to the top-left origin the GPU samples
//! with, generates smooth normals where the file has none, and builds a
//! tangent frame for every vertex.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use glam::{Vec2, Vec3};

use crate::backend::traits::GraphicsBackend;
use crate::backend::types::Vertex;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::GeometryBuffer;
use crate::resources::mesh::*;
use crate::resources::texture::{FileImageSource, ImageSource, TextureCache};

/// CPU mesh as imported, with material texture paths still unresolved to handles
#[derive(Debug, Clone)]
pub struct ImportedMesh {
    pub mesh: MeshData,
    pub texture_paths: Vec<(TextureRole, PathBuf)>,
}

/// Import every mesh of an OBJ file
pub fn import_obj(path: &Path) -> RenderResult<Vec<ImportedMesh>> {
    let file = File::open(path).map_err(|e| RenderError::ImporterFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    import_obj_reader(&mut BufReader::new(file), path, base_dir)
}

/// Import from an OBJ stream. `base_dir` resolves material libraries and
/// texture paths; `path` only names the source in diagnostics.
pub fn import_obj_reader<R: BufRead>(
    reader: &mut R,
    path: &Path,
    base_dir: &Path,
) -> RenderResult<Vec<ImportedMesh>> {
    let options = tobj::LoadOptions {
        triangulate: true,
        single_index: true,
        ..Default::default()
    };
    let (models, materials) = tobj::load_obj_buf(reader, &options, |mtl| {
        tobj::load_mtl(base_dir.join(mtl))
    })
    .map_err(|e| RenderError::ImporterFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let materials = materials.unwrap_or_else(|e| {
        log::warn!("Materials for {:?} unavailable: {}", path, e);
        Vec::new()
    });

    if models.is_empty() {
        return Err(RenderError::ImporterFailure {
            path: path.to_path_buf(),
            reason: "file contains no meshes".into(),
        });
    }

    Ok(models
        .into_iter()
        .map(|model| {
            let texture_paths = model
                .mesh
                .material_id
                .and_then(|id| materials.get(id))
                .map(|material| material_textures(material, base_dir))
                .unwrap_or_default();
            ImportedMesh {
                mesh: convert_mesh(&model.name, &model.mesh),
                texture_paths,
            }
        })
        .collect())
}

/// Texture maps of a material by role. Bump maps feed the normal role and
/// ambient maps the height role.
fn material_textures(material: &tobj::Material, base_dir: &Path) -> Vec<(TextureRole, PathBuf)> {
    [
        (TextureRole::Diffuse, &material.diffuse_texture),
        (TextureRole::Specular, &material.specular_texture),
        (TextureRole::Normal, &material.normal_texture),
        (TextureRole::Height, &material.ambient_texture),
    ]
    .into_iter()
    .filter_map(|(role, texture)| {
        texture
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| (role, base_dir.join(t)))
    })
    .collect()
}

fn convert_mesh(name: &str, mesh: &tobj::Mesh) -> MeshData {
    let positions: Vec<Vec3> = mesh
        .positions
        .chunks_exact(3)
        .map(|p| Vec3::new(p[0], p[1], p[2]))
        .collect();

    let normals: Vec<Vec3> = if mesh.normals.len() == mesh.positions.len() {
        mesh.normals
            .chunks_exact(3)
            .map(|n| Vec3::new(n[0], n[1], n[2]).try_normalize().unwrap_or(Vec3::Y))
            .collect()
    } else {
        generate_smooth_normals(&positions, &mesh.indices)
    };

    let uvs: Vec<Vec2> = if mesh.texcoords.len() / 2 == positions.len() {
        mesh.texcoords
            .chunks_exact(2)
            .map(|t| flip_v(Vec2::new(t[0], t[1])))
            .collect()
    } else {
        vec![Vec2::ZERO; positions.len()]
    };

    let mut vertices: Vec<Vertex> = positions
        .iter()
        .zip(normals)
        .zip(uvs)
        .map(|((&p, n), uv)| Vertex::new(p, n, uv))
        .collect();
    compute_tangents(&mut vertices, &mesh.indices);

    MeshData::new(name, vertices, mesh.indices.clone())
}

/// Mesh of a loaded model with its GPU buffers
#[derive(Debug)]
pub struct ModelMesh {
    pub data: MeshData,
    pub geometry: GeometryBuffer,
}

/// Ordered meshes sharing one texture cache. The cache lives and dies with
/// the model.
pub struct Model<S: ImageSource = FileImageSource> {
    name: String,
    meshes: Vec<ModelMesh>,
    textures: TextureCache<S>,
}

impl<S: ImageSource> Model<S> {
    /// Model with no meshes
    pub fn empty(name: &str, source: S) -> Self {
        Self {
            name: name.to_string(),
            meshes: Vec::new(),
            textures: TextureCache::new(source),
        }
    }

    /// Import `path` and upload its meshes and textures.
    ///
    /// A texture that fails to load is left off its mesh with a warning.
    pub fn load<B: GraphicsBackend>(backend: &mut B, path: &Path, source: S) -> RenderResult<Self> {
        let imported = import_obj(path)?;
        Self::from_imported(backend, &path.to_string_lossy(), imported, source)
    }

    /// Like [`Model::load`], but an importer failure yields an empty model
    /// after a warning. Backend failures still propagate.
    pub fn load_or_empty<B: GraphicsBackend>(backend: &mut B, path: &Path, source: S) -> RenderResult<Self> {
        match import_obj(path) {
            Ok(imported) => Self::from_imported(backend, &path.to_string_lossy(), imported, source),
            Err(e) => {
                log::warn!("{}; continuing with an empty model", e);
                Ok(Self::empty(&path.to_string_lossy(), source))
            }
        }
    }

    /// Upload already imported meshes. If an upload fails, the meshes and
    /// textures created so far are released before the error is returned.
    pub fn from_imported<B: GraphicsBackend>(
        backend: &mut B,
        name: &str,
        imported: Vec<ImportedMesh>,
        source: S,
    ) -> RenderResult<Self> {
        let mut model = Self::empty(name, source);
        if let Err(e) = model.upload_meshes(backend, imported) {
            model.destroy(backend);
            return Err(e);
        }

        log::info!(
            "Loaded model {} ({} meshes, {} textures)",
            name,
            model.meshes.len(),
            model.textures.len()
        );
        Ok(model)
    }

    fn upload_meshes<B: GraphicsBackend>(&mut self, backend: &mut B, imported: Vec<ImportedMesh>) -> RenderResult<()> {
        for ImportedMesh {
            mut mesh,
            texture_paths,
        } in imported
        {
            if mesh.index_count() == 0 || mesh.vertex_count() == 0 {
                log::warn!("Skipping empty mesh '{}' in {}", mesh.name, self.name);
                continue;
            }
            for (role, path) in texture_paths {
                match self.textures.load(backend, &path, role) {
                    Ok(texture) => mesh.textures.push(MeshTexture { role, texture }),
                    Err(e) if !e.is_fatal() => log::warn!("{}", e),
                    Err(e) => return Err(e),
                }
            }
            let geometry = GeometryBuffer::upload(backend, &mesh)?;
            self.meshes.push(ModelMesh {
                data: mesh,
                geometry,
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meshes(&self) -> &[ModelMesh] {
        &self.meshes
    }

    pub fn meshes_mut(&mut self) -> &mut [ModelMesh] {
        &mut self.meshes
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    pub fn textures(&self) -> &TextureCache<S> {
        &self.textures
    }

    pub fn textures_mut(&mut self) -> &mut TextureCache<S> {
        &mut self.textures
    }

    pub fn destroy<B: GraphicsBackend>(mut self, backend: &mut B) {
        for mesh in self.meshes.drain(..) {
            mesh.geometry.destroy(backend);
        }
        self.textures.destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RecordingBackend, ResourceKind};
    use crate::resources::texture::tests::MemorySource;
    use crate::resources::texture::DecodedImage;
    use std::io::Cursor;

    const QUAD_OBJ: &str = "\
o quad
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
f 1/1 2/2 3/3 4/4
";

    fn import(src: &str) -> Vec<ImportedMesh> {
        import_obj_reader(&mut Cursor::new(src), Path::new("quad.obj"), Path::new("assets")).unwrap()
    }

    #[test]
    fn quads_are_triangulated_with_generated_normals() {
        let meshes = import(QUAD_OBJ);
        assert_eq!(meshes.len(), 1);
        let mesh = &meshes[0].mesh;
        assert_eq!(mesh.triangle_count(), 2);
        for v in &mesh.vertices {
            assert!(v.normal.abs_diff_eq(Vec3::Z, 1e-5));
        }
    }

    #[test]
    fn texture_v_is_flipped() {
        let meshes = import(QUAD_OBJ);
        let first = meshes[0]
            .mesh
            .vertices
            .iter()
            .find(|v| v.position == Vec3::ZERO)
            .unwrap();
        assert_eq!(first.uv, Vec2::new(0.0, 1.0));
    }

    #[test]
    fn missing_file_is_an_importer_failure() {
        let err = import_obj(Path::new("does/not/exist.obj")).unwrap_err();
        assert!(matches!(err, RenderError::ImporterFailure { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn load_or_empty_degrades_to_empty_model() {
        let mut backend = RecordingBackend::new(4, 4);
        let model =
            Model::load_or_empty(&mut backend, Path::new("does/not/exist.obj"), MemorySource::default()).unwrap();
        assert!(model.is_empty());
        assert!(backend.live_resources().is_empty());
    }

    #[test]
    fn shared_texture_paths_upload_once() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut meshes = import(QUAD_OBJ);
        let path = PathBuf::from("assets/rock.png");
        meshes[0].texture_paths.push((TextureRole::Diffuse, path.clone()));
        let mut second = meshes[0].clone();
        second.mesh.name = "quad2".into();
        meshes.push(second);

        let source = MemorySource::default().with("assets/rock.png", DecodedImage::solid(2, 2, [1; 4]));
        let model = Model::from_imported(&mut backend, "rocks", meshes, source).unwrap();

        assert_eq!(model.meshes().len(), 2);
        assert_eq!(model.textures().len(), 1);
        assert_eq!(model.textures().source().decode_calls, 1);
        let a = model.meshes()[0].data.texture(TextureRole::Diffuse);
        let b = model.meshes()[1].data.texture(TextureRole::Diffuse);
        assert!(a.is_some());
        assert_eq!(a, b);

        model.destroy(&mut backend);
        assert_eq!(backend.live_count(ResourceKind::Buffer), 0);
        assert!(backend.live_resources().is_empty());
    }

    #[test]
    fn failed_upload_releases_earlier_meshes_and_textures() {
        let mut meshes = import(QUAD_OBJ);
        meshes[0]
            .texture_paths
            .push((TextureRole::Diffuse, PathBuf::from("assets/rock.png")));
        let mut second = meshes[0].clone();
        second.mesh.name = "quad2".into();
        meshes.push(second);
        let source = MemorySource::default().with("assets/rock.png", DecodedImage::solid(2, 2, [1; 4]));

        // The first mesh uploads a vertex and an index buffer; the second
        // mesh's vertex buffer fails
        let mut backend = RecordingBackend::new(4, 4).fail_nth(ResourceKind::Buffer, 2);
        let result = Model::from_imported(&mut backend, "rocks", meshes, source);

        assert!(matches!(result, Err(RenderError::Backend(_))));
        assert!(backend.live_resources().is_empty(), "leaked: {:?}", backend.live_resources());
        assert!(backend.double_destroys().is_empty());
    }

    #[test]
    fn missing_texture_leaves_mesh_untextured() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut meshes = import(QUAD_OBJ);
        meshes[0]
            .texture_paths
            .push((TextureRole::Specular, PathBuf::from("assets/missing.png")));
        let model = Model::from_imported(&mut backend, "rock", meshes, MemorySource::default()).unwrap();
        assert_eq!(model.meshes().len(), 1);
        assert!(model.meshes()[0].data.textures.is_empty());
    }
}
