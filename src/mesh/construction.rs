//! Construction and validation of [`TriSurface`]s:
//! connectivity checks, quad splitting, adjacency, nodal normals, bounds.

use super::TriSurface;
use crate::Vec3;

/// Error in building or updating a [`TriSurface`].
#[derive(Debug, thiserror::Error)]
pub enum MeshBuildError {
    /// A flat connectivity array's length was not a multiple of its element size.
    #[error("connectivity length {len} is not a multiple of {unit}")]
    RaggedConnectivity {
        /// Vertex count per element (3 for triangles, 4 for quads).
        unit: usize,
        /// Length of the offending array.
        len: usize,
    },
    /// A connectivity entry referenced a nonexistent vertex.
    #[error("vertex index {index} out of bounds for {vertex_count} vertices")]
    VertexIndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Number of vertices in the surface.
        vertex_count: usize,
    },
    /// The surface had no vertices or no faces.
    #[error("surface has no vertices or no faces")]
    EmptySurface,
    /// An update supplied a coordinate array of the wrong length.
    #[error("expected {expected} vertices, got {got}")]
    VertexCountMismatch {
        /// Vertex count the surface was built with.
        expected: usize,
        /// Vertex count supplied.
        got: usize,
    },
}

pub(super) fn build(
    name: String,
    vertices: Vec<Vec3>,
    tris: Vec<usize>,
    quads: Vec<usize>,
) -> Result<TriSurface, MeshBuildError> {
    if tris.len() % 3 != 0 {
        return Err(MeshBuildError::RaggedConnectivity { unit: 3, len: tris.len() });
    }
    if quads.len() % 4 != 0 {
        return Err(MeshBuildError::RaggedConnectivity { unit: 4, len: quads.len() });
    }
    if vertices.is_empty() || (tris.is_empty() && quads.is_empty()) {
        return Err(MeshBuildError::EmptySurface);
    }
    for &idx in tris.iter().chain(&quads) {
        if idx >= vertices.len() {
            return Err(MeshBuildError::VertexIndexOutOfBounds {
                index: idx,
                vertex_count: vertices.len(),
            });
        }
    }

    // quads become triangle pairs sharing the 0-2 diagonal
    let mut all_tris = tris;
    all_tris.reserve(quads.len() / 2 * 3);
    for q in quads.chunks_exact(4) {
        all_tris.extend_from_slice(&[q[0], q[1], q[2]]);
        all_tris.extend_from_slice(&[q[0], q[2], q[3]]);
    }

    let (vertex_face_offsets, vertex_faces) = vertex_face_adjacency(vertices.len(), &all_tris);
    let node_normals = node_normals(&vertices, &all_tris, &vertex_face_offsets, &vertex_faces);
    let bounds = bounds(&vertices);
    let vertex_count = vertices.len();

    Ok(TriSurface {
        name,
        vertices,
        tris: all_tris,
        node_normals,
        vertex_face_offsets,
        vertex_faces,
        bounds,
        tree: std::cell::OnceCell::new(),
        seeds_d: vec![Vec3::zeros(); vertex_count],
        seeds_b: vec![Vec3::zeros(); vertex_count],
    })
}

/// CSR-style vertex-to-face adjacency built with a counting sort.
fn vertex_face_adjacency(vertex_count: usize, tris: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let mut offsets = vec![0_usize; vertex_count + 1];
    for &v in tris {
        offsets[v + 1] += 1;
    }
    for i in 0..vertex_count {
        offsets[i + 1] += offsets[i];
    }
    let mut faces = vec![0_usize; tris.len()];
    let mut cursor = offsets.clone();
    for (f, tri) in tris.chunks_exact(3).enumerate() {
        for &v in tri {
            faces[cursor[v]] = f;
            cursor[v] += 1;
        }
    }
    (offsets, faces)
}

/// Area-weighted nodal normals.
///
/// Each incident face contributes its (unnormalized) cross product,
/// whose magnitude is twice the face area,
/// so large faces dominate and degenerate faces contribute nothing.
pub(super) fn node_normals(
    vertices: &[Vec3],
    tris: &[usize],
    vertex_face_offsets: &[usize],
    vertex_faces: &[usize],
) -> Vec<Vec3> {
    (0..vertices.len())
        .map(|v| {
            let mut sum = Vec3::zeros();
            for &f in &vertex_faces[vertex_face_offsets[v]..vertex_face_offsets[v + 1]] {
                let t = &tris[3 * f..3 * f + 3];
                sum += (vertices[t[1]] - vertices[t[0]]).cross(&(vertices[t[2]] - vertices[t[0]]));
            }
            sum.try_normalize(f64::EPSILON).unwrap_or_else(Vec3::zeros)
        })
        .collect()
}

pub(super) fn bounds(vertices: &[Vec3]) -> [Vec3; 2] {
    let mut min = vertices[0];
    let mut max = vertices[0];
    for v in vertices {
        min = min.inf(v);
        max = max.sup(v);
    }
    [min, max]
}

//
// fixtures
//

/// A small flat square plate on the z = 0 plane for testing,
/// a 3x3 vertex grid spanning [-1, 1] in x and y:
/// ```text
///  6--7--8
///  |\ |\ |
///  | \| \|
///  3--4--5
///  |\ |\ |
///  | \| \|
///  0--1--2
/// ```
///
/// This is public for visibility in doctests, which frequently need a surface.
/// It is not meant to be used by users and thus hidden from docs.
#[doc(hidden)]
pub fn tiny_plate() -> TriSurface {
    let vertices = (0..3)
        .flat_map(|i| (0..3).map(move |j| Vec3::new(-1.0 + j as f64, -1.0 + i as f64, 0.0)))
        .collect();
    #[rustfmt::skip]
    let tris = vec![
        0, 1, 4,  0, 4, 3,
        1, 2, 5,  1, 5, 4,
        3, 4, 7,  3, 7, 6,
        4, 5, 8,  4, 8, 7,
    ];
    TriSurface::build("plate", vertices, tris, Vec::new())
        .unwrap_or_else(|e| panic!("fixture construction failed: {e}"))
}

/// [`tiny_plate`] sheared onto the plane z = 0.3 x + 0.2 y,
/// so its normals are not axis-aligned.
///
/// This is public for visibility in doctests;
/// not meant to be used by users and thus hidden from docs.
#[doc(hidden)]
pub fn tilted_plate() -> TriSurface {
    let mut plate = tiny_plate();
    let tilted: Vec<Vec3> = plate
        .vertices()
        .iter()
        .map(|v| Vec3::new(v.x, v.y, 0.3 * v.x + 0.2 * v.y))
        .collect();
    plate
        .update(tilted)
        .unwrap_or_else(|e| panic!("fixture construction failed: {e}"));
    plate
}

/// An axis-aligned cube with side 1 centered on the origin,
/// built from six quad faces (split into triangles at build time).
/// Vertices 0-3 run counterclockwise around the bottom face,
/// 4-7 around the top.
///
/// This is public for visibility in doctests;
/// not meant to be used by users and thus hidden from docs.
#[doc(hidden)]
pub fn unit_cube() -> TriSurface {
    let vertices = vec![
        Vec3::new(-0.5, -0.5, -0.5),
        Vec3::new(0.5, -0.5, -0.5),
        Vec3::new(0.5, 0.5, -0.5),
        Vec3::new(-0.5, 0.5, -0.5),
        Vec3::new(-0.5, -0.5, 0.5),
        Vec3::new(0.5, -0.5, 0.5),
        Vec3::new(0.5, 0.5, 0.5),
        Vec3::new(-0.5, 0.5, 0.5),
    ];
    #[rustfmt::skip]
    let quads = vec![
        0, 3, 2, 1, // bottom
        4, 5, 6, 7, // top
        0, 1, 5, 4, // front
        1, 2, 6, 5, // right
        2, 3, 7, 6, // back
        3, 0, 4, 7, // left
    ];
    TriSurface::build("cube", vertices, Vec::new(), quads)
        .unwrap_or_else(|e| panic!("fixture construction failed: {e}"))
}
