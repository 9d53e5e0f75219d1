// src/mesh_import.rs
//! OBJ import and vertex packing.
//!
//! tobj triangulates faces and unifies the position/normal/uv indices, so every
//! imported mesh is a flat vertex list plus a `u32` triangle index list. Missing
//! normals are generated from face normals; tangents and bitangents are always
//! generated from the UV layout.

use std::path::Path;

use glam::{Vec2, Vec3};
use log::{debug, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::vertex_layout::{Semantic, StreamLayout, VertexElement};

/// A mesh in CPU memory, attributes indexed by vertex.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportedMesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tex_coords: Vec<Vec2>,
    pub tangents: Vec<Vec3>,
    pub bitangents: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl ImportedMesh {
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Parse OBJ text. All objects in the file are merged into one mesh.
    pub fn from_obj_bytes(bytes: &[u8]) -> Result<Self> {
        let options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };
        // materials come from the engine's own material table, never from .mtl files
        let (models, _materials) = tobj::load_obj_buf(&mut std::io::Cursor::new(bytes), &options, |_| {
            Err(tobj::LoadError::OpenFileFailed)
        })?;
        if models.is_empty() {
            return Err(Error::MeshImport("no objects in OBJ data".into()));
        }

        let mut mesh = ImportedMesh::default();
        let mut has_normals = true;
        let mut has_uvs = true;
        for model in &models {
            let m = &model.mesh;
            let base = mesh.positions.len() as u32;
            let count = m.positions.len() / 3;
            mesh.positions
                .extend(m.positions.chunks_exact(3).map(|v| Vec3::new(v[0], v[1], v[2])));
            has_normals &= m.normals.len() == count * 3;
            has_uvs &= m.texcoords.len() == count * 2;
            if has_normals {
                mesh.normals
                    .extend(m.normals.chunks_exact(3).map(|n| Vec3::new(n[0], n[1], n[2])));
            }
            if has_uvs {
                mesh.tex_coords
                    .extend(m.texcoords.chunks_exact(2).map(|t| Vec2::new(t[0], t[1])));
            }
            mesh.indices.extend(m.indices.iter().map(|i| i + base));
        }

        if !has_normals {
            mesh.normals = face_normals(&mesh.positions, &mesh.indices);
        }
        if !has_uvs {
            mesh.tex_coords = vec![Vec2::ZERO; mesh.positions.len()];
        }
        let (tangents, bitangents) = tangent_frames(&mesh.positions, &mesh.normals, &mesh.tex_coords, &mesh.indices);
        mesh.tangents = tangents;
        mesh.bitangents = bitangents;
        Ok(mesh)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading mesh {}", path.display()))?;
        let mesh = Self::from_obj_bytes(&bytes).with_context(|| format!("importing mesh {}", path.display()))?;
        debug!(
            "Imported {} ({} vertices, {} indices)",
            path.display(),
            mesh.vertex_count(),
            mesh.indices.len()
        );
        Ok(mesh)
    }

    /// Interleave the attributes `layout` asks for into one vertex buffer.
    ///
    /// Each element gets its first `components` floats; a 4-component position
    /// gets `w = 1`. Semantics the mesh cannot supply are zero-filled and
    /// reported once.
    pub fn pack_vertices(&self, layout: &StreamLayout) -> Vec<u8> {
        let stride = layout.byte_size as usize;
        let mut out = vec![0u8; stride * self.vertex_count()];
        let mut unsupplied: Vec<&str> = Vec::new();

        for element in &layout.elements {
            if !self.supplies(element) {
                unsupplied.push(&element.semantic_name);
                continue;
            }
            let range = element.offset as usize..(element.offset + element.byte_size()) as usize;
            let components = element.components as usize;
            for (i, vertex) in out.chunks_exact_mut(stride).enumerate() {
                let value = self.attribute(&element.semantic, i);
                vertex[range.clone()].copy_from_slice(bytemuck::cast_slice(&value[..components]));
            }
        }

        if !unsupplied.is_empty() {
            warn!("Mesh has no data for {unsupplied:?}; packed as zeros");
        }
        out
    }
}

impl ImportedMesh {
    fn supplies(&self, element: &VertexElement) -> bool {
        match element.semantic {
            Semantic::TexCoord => element.semantic_index == 0,
            Semantic::Position | Semantic::Normal | Semantic::Tangent | Semantic::Bitangent | Semantic::Color => true,
            Semantic::Instance(_) | Semantic::Other(_) => false,
        }
    }

    fn attribute(&self, semantic: &Semantic, i: usize) -> [f32; 4] {
        match semantic {
            Semantic::Position => self.positions[i].extend(1.0).to_array(),
            Semantic::Normal => self.normals[i].extend(0.0).to_array(),
            Semantic::TexCoord => [self.tex_coords[i].x, self.tex_coords[i].y, 0.0, 0.0],
            Semantic::Tangent => self.tangents[i].extend(0.0).to_array(),
            Semantic::Bitangent => self.bitangents[i].extend(0.0).to_array(),
            Semantic::Color => [1.0; 4],
            Semantic::Instance(_) | Semantic::Other(_) => [0.0; 4],
        }
    }
}

/// Smooth normals: area-weighted sum of adjacent face normals.
fn face_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let n = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
        normals[a] += n;
        normals[b] += n;
        normals[c] += n;
    }
    normals.iter().map(|n| n.normalize_or_zero()).collect()
}

/// Per-vertex tangent and bitangent from UV gradients, Gram-Schmidt orthogonalised against the normal.
fn tangent_frames(positions: &[Vec3], normals: &[Vec3], uvs: &[Vec2], indices: &[u32]) -> (Vec<Vec3>, Vec<Vec3>) {
    let mut tan = vec![Vec3::ZERO; positions.len()];
    let mut bitan = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let e1 = positions[b] - positions[a];
        let e2 = positions[c] - positions[a];
        let d1 = uvs[b] - uvs[a];
        let d2 = uvs[c] - uvs[a];
        let det = d1.x * d2.y - d2.x * d1.y;
        if det.abs() < f32::EPSILON {
            continue;
        }
        let r = 1.0 / det;
        let t = (e1 * d2.y - e2 * d1.y) * r;
        let bt = (e2 * d1.x - e1 * d2.x) * r;
        for v in [a, b, c] {
            tan[v] += t;
            bitan[v] += bt;
        }
    }

    let mut tangents = Vec::with_capacity(positions.len());
    let mut bitangents = Vec::with_capacity(positions.len());
    for i in 0..positions.len() {
        let n = normals[i];
        let mut t = (tan[i] - n * n.dot(tan[i])).normalize_or_zero();
        if t == Vec3::ZERO {
            t = n.any_orthonormal_vector();
        }
        let mut b = n.cross(t);
        if b.dot(bitan[i]) < 0.0 {
            b = -b;
        }
        tangents.push(t);
        bitangents.push(b);
    }
    (tangents, bitangents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex_layout::{ReflectedInput, VertexBufferDescription};

    const QUAD: &str = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1 4/4/1
";

    fn layout(inputs: &[(&str, u8)]) -> StreamLayout {
        let reflected: Vec<ReflectedInput> = inputs
            .iter()
            .enumerate()
            .map(|(loc, (name, mask))| ReflectedInput::from_raw_name(name, loc as u32, *mask))
            .collect();
        VertexBufferDescription::from_reflection(&reflected).unwrap().per_vertex
    }

    #[test]
    fn test_quad_is_triangulated() {
        let mesh = ImportedMesh::from_obj_bytes(QUAD.as_bytes()).unwrap();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert!(mesh.normals.iter().all(|n| *n == Vec3::Z));
        assert_eq!(mesh.tangents.len(), 4);
        assert!((mesh.tangents[0] - Vec3::X).length() < 1e-5);
        assert!((mesh.bitangents[0] - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_normals_generated_when_missing() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n";
        let mesh = ImportedMesh::from_obj_bytes(obj.as_bytes()).unwrap();
        assert!(mesh.normals.iter().all(|n| (*n - Vec3::Z).length() < 1e-6));
        assert_eq!(mesh.tex_coords, vec![Vec2::ZERO; 3]);
    }

    #[test]
    fn test_pack_matches_layout_stride() {
        let mesh = ImportedMesh::from_obj_bytes(QUAD.as_bytes()).unwrap();
        let stream = layout(&[("position", 0b0111), ("normal", 0b0111), ("texcoord", 0b0011)]);
        let bytes = mesh.pack_vertices(&stream);
        assert_eq!(stream.byte_size, 32);
        assert_eq!(bytes.len(), 4 * 32);

        let floats: &[f32] = bytemuck::cast_slice(&bytes);
        // vertex 2: position (1,1,0), normal (0,0,1), uv (1,1)
        assert_eq!(&floats[16..24], &[1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_pack_zero_fills_unknown_semantics() {
        let mesh = ImportedMesh::from_obj_bytes(QUAD.as_bytes()).unwrap();
        let stream = layout(&[("position", 0b1111), ("blendweight", 0b0001)]);
        let bytes = mesh.pack_vertices(&stream);
        let floats: &[f32] = bytemuck::cast_slice(&bytes);
        assert_eq!(&floats[0..5], &[0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_empty_obj_is_an_error() {
        assert!(ImportedMesh::from_obj_bytes(b"# no geometry\n").is_err());
    }
}
