//! Triangulated surface components:
//! vertex and connectivity storage, nodal normals, rigid transforms,
//! and minimum-distance projection with derivative-seed propagation.

use std::cell::OnceCell;

use nalgebra as na;

use crate::{adt::Adt, Vec3};

mod construction;
pub use construction::MeshBuildError;
#[doc(hidden)]
pub use construction::{tilted_plate, tiny_plate, unit_cube};

/// A coordinate axis, used for rigid rotations and symmetry planes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    /// The x axis.
    X,
    /// The y axis.
    Y,
    /// The z axis.
    Z,
}

impl Axis {
    /// Index of the axis in a coordinate triple.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// A named triangulated surface component.
///
/// Stores vertex positions and flat triangle connectivity,
/// plus everything derived from them:
/// area-weighted nodal normals, vertex-to-face adjacency,
/// an axis-aligned bounding box,
/// and a lazily built [`Adt`] for minimum-distance queries.
/// Quadrilateral faces given at build time are split into triangle pairs.
///
/// Each surface also carries forward and reverse derivative-seed arrays
/// parallel to its vertices.
/// These are plumbing for [`Manager`][crate::Manager]'s tape replay
/// but can be driven by hand through the `*_seeds` methods.
#[derive(Clone, Debug)]
pub struct TriSurface {
    name: String,
    vertices: Vec<Vec3>,
    /// flat connectivity, three vertex indices per face
    tris: Vec<usize>,
    node_normals: Vec<Vec3>,
    /// CSR-style vertex-to-face adjacency
    vertex_face_offsets: Vec<usize>,
    vertex_faces: Vec<usize>,
    bounds: [Vec3; 2],
    tree: OnceCell<Adt>,
    seeds_d: Vec<Vec3>,
    seeds_b: Vec<Vec3>,
}

/// Result of projecting a point onto a [`TriSurface`].
#[derive(Clone, Copy, Debug)]
pub struct Projection {
    /// The projected point (closest point on the surface).
    pub point: Vec3,
    /// Index of the face the projection landed on.
    pub face: usize,
    /// Barycentric coordinates of the projected point on that face.
    pub bary: [f64; 3],
    /// Unit normal of the face at the projected point.
    pub normal: Vec3,
    /// Distance from the query point to the projected point.
    pub distance: f64,
}

impl TriSurface {
    /// Build a surface from vertices and flat connectivity.
    ///
    /// `tris` holds three vertex indices per triangle and `quads`
    /// four per quadrilateral; quads are split into two triangles.
    /// Fails if a connectivity array has a ragged length,
    /// an index is out of bounds, or the surface is empty.
    pub fn build(
        name: impl Into<String>,
        vertices: Vec<Vec3>,
        tris: Vec<usize>,
        quads: Vec<usize>,
    ) -> Result<Self, MeshBuildError> {
        construction::build(name.into(), vertices, tris, quads)
    }

    /// The component's name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of vertices in the surface.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of triangle faces in the surface.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.tris.len() / 3
    }

    /// All vertex positions.
    #[inline]
    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    /// Position of a single vertex.
    #[inline]
    pub fn vertex(&self, idx: usize) -> Vec3 {
        self.vertices[idx]
    }

    /// Vertex indices of one face.
    #[inline]
    pub fn face(&self, face: usize) -> [usize; 3] {
        let f = &self.tris[3 * face..3 * face + 3];
        [f[0], f[1], f[2]]
    }

    /// Iterator over all faces as vertex-index triples.
    pub fn faces(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        self.tris.chunks_exact(3).map(|f| [f[0], f[1], f[2]])
    }

    /// Flat triangle connectivity, three indices per face.
    #[inline]
    pub fn tri_indices(&self) -> &[usize] {
        &self.tris
    }

    /// Area-weighted unit normal at a vertex
    /// (zero for vertices with no non-degenerate faces).
    #[inline]
    pub fn node_normal(&self, idx: usize) -> Vec3 {
        self.node_normals[idx]
    }

    /// All nodal normals.
    #[inline]
    pub fn node_normals(&self) -> &[Vec3] {
        &self.node_normals
    }

    /// Faces incident to a vertex.
    #[inline]
    pub fn vertex_faces(&self, idx: usize) -> &[usize] {
        &self.vertex_faces[self.vertex_face_offsets[idx]..self.vertex_face_offsets[idx + 1]]
    }

    /// Axis-aligned bounding box as `[min, max]` corners.
    #[inline]
    pub fn bounds(&self) -> [Vec3; 2] {
        self.bounds
    }

    /// Unit normal of a face, or zero if the face is degenerate.
    pub fn face_normal(&self, face: usize) -> Vec3 {
        let [a, b, c] = self.face(face);
        let n = (self.vertices[b] - self.vertices[a]).cross(&(self.vertices[c] - self.vertices[a]));
        n.try_normalize(f64::EPSILON).unwrap_or_else(Vec3::zeros)
    }

    /// Area of a face.
    pub fn face_area(&self, face: usize) -> f64 {
        let [a, b, c] = self.face(face);
        0.5 * (self.vertices[b] - self.vertices[a])
            .cross(&(self.vertices[c] - self.vertices[a]))
            .norm()
    }

    /// The search tree over this surface's faces, built on first use.
    pub fn tree(&self) -> &Adt {
        self.tree.get_or_init(|| Adt::build(&self.vertices, &self.tris))
    }

    /// Replace the vertex coordinates, keeping connectivity.
    ///
    /// Normals, bounds and the search tree are recomputed;
    /// derivative seeds are left as they are.
    /// Fails if the new coordinate count differs from the old one.
    pub fn update(&mut self, vertices: Vec<Vec3>) -> Result<(), MeshBuildError> {
        if vertices.len() != self.vertices.len() {
            return Err(MeshBuildError::VertexCountMismatch {
                expected: self.vertices.len(),
                got: vertices.len(),
            });
        }
        self.vertices = vertices;
        self.refresh_derived();
        Ok(())
    }

    /// Translate the whole surface by a vector.
    pub fn translate(&mut self, offset: Vec3) {
        for v in &mut self.vertices {
            *v += offset;
        }
        self.refresh_derived();
    }

    /// Scale the whole surface about the origin.
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.vertices {
            *v *= factor;
        }
        self.refresh_derived();
    }

    /// Rotate the whole surface about a coordinate axis through the origin.
    pub fn rotate_deg(&mut self, angle_deg: f64, axis: Axis) {
        let angle = angle_deg.to_radians();
        let rot = match axis {
            Axis::X => na::Rotation3::from_axis_angle(&Vec3::x_axis(), angle),
            Axis::Y => na::Rotation3::from_axis_angle(&Vec3::y_axis(), angle),
            Axis::Z => na::Rotation3::from_axis_angle(&Vec3::z_axis(), angle),
        };
        for v in &mut self.vertices {
            *v = rot * *v;
        }
        self.refresh_derived();
    }

    fn refresh_derived(&mut self) {
        self.node_normals = construction::node_normals(
            &self.vertices,
            &self.tris,
            &self.vertex_face_offsets,
            &self.vertex_faces,
        );
        self.bounds = construction::bounds(&self.vertices);
        self.tree = OnceCell::new();
    }

    //
    // projection
    //

    /// Project query points onto the surface by minimum distance.
    pub fn project(&self, points: &[Vec3]) -> Vec<Projection> {
        let tree = self.tree();
        points.iter().map(|p| tree.nearest(*p)).collect()
    }

    /// Forward derivative propagation through earlier projections.
    ///
    /// The foot face and barycentric weights stay frozen:
    /// the query's seed acts through the tangent plane
    /// and the surface's own forward seeds act through the normal.
    pub fn project_d(&self, hits: &[Projection], query_seeds: &[Vec3]) -> Vec<Vec3> {
        assert_eq!(hits.len(), query_seeds.len());
        hits.iter()
            .zip(query_seeds)
            .map(|(hit, xd)| {
                let n = hit.normal;
                let [a, b, c] = self.face(hit.face);
                let vd = hit.bary[0] * self.seeds_d[a]
                    + hit.bary[1] * self.seeds_d[b]
                    + hit.bary[2] * self.seeds_d[c];
                // y_d = (I - nnᵀ) x_d + nnᵀ v_d
                xd - n * n.dot(xd) + n * n.dot(&vd)
            })
            .collect()
    }

    /// Reverse derivative propagation through earlier projections.
    ///
    /// Adjoint of [`project_d`][Self::project_d]:
    /// accumulates into the surface's reverse seeds
    /// and into the query points' reverse seeds.
    pub fn project_b(&mut self, hits: &[Projection], proj_seeds: &[Vec3], query_seeds: &mut [Vec3]) {
        assert_eq!(hits.len(), proj_seeds.len());
        assert_eq!(hits.len(), query_seeds.len());
        for (hit, (yb, xb)) in hits.iter().zip(proj_seeds.iter().zip(query_seeds.iter_mut())) {
            let n = hit.normal;
            let normal_part = n * n.dot(yb);
            *xb += yb - normal_part;
            let [a, b, c] = self.face(hit.face);
            self.seeds_b[a] += hit.bary[0] * normal_part;
            self.seeds_b[b] += hit.bary[1] * normal_part;
            self.seeds_b[c] += hit.bary[2] * normal_part;
        }
    }

    //
    // derivative seeds
    //

    /// Forward derivative seeds, one per vertex.
    #[inline]
    pub fn forward_seeds(&self) -> &[Vec3] {
        &self.seeds_d
    }

    /// Overwrite the forward seeds.
    pub fn set_forward_seeds(&mut self, seeds: &[Vec3]) {
        assert_eq!(seeds.len(), self.vertices.len());
        self.seeds_d.copy_from_slice(seeds);
    }

    /// Reverse derivative seeds, one per vertex.
    #[inline]
    pub fn reverse_seeds(&self) -> &[Vec3] {
        &self.seeds_b
    }

    /// Overwrite the reverse seeds.
    pub fn set_reverse_seeds(&mut self, seeds: &[Vec3]) {
        assert_eq!(seeds.len(), self.vertices.len());
        self.seeds_b.copy_from_slice(seeds);
    }

    /// Add into the reverse seeds.
    pub fn add_reverse_seeds(&mut self, seeds: &[Vec3]) {
        assert_eq!(seeds.len(), self.vertices.len());
        for (acc, s) in self.seeds_b.iter_mut().zip(seeds) {
            *acc += s;
        }
    }

    /// Add into the reverse seed of a single vertex.
    #[inline]
    pub fn accumulate_reverse_seed(&mut self, idx: usize, seed: Vec3) {
        self.seeds_b[idx] += seed;
    }

    /// Zero both seed arrays.
    pub fn clear_seeds(&mut self) {
        self.seeds_d.fill(Vec3::zeros());
        self.seeds_b.fill(Vec3::zeros());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Nodal normals of a flat plate all point straight up
    /// and stay unit length after rigid transforms.
    #[test]
    fn plate_normals_point_up() {
        let mut plate = tiny_plate();
        for i in 0..plate.vertex_count() {
            assert_abs_diff_eq!(plate.node_normal(i).dot(&Vec3::z()).abs(), 1.0, epsilon = 1e-12);
        }
        plate.rotate_deg(90.0, Axis::X);
        for i in 0..plate.vertex_count() {
            assert_abs_diff_eq!(plate.node_normal(i).dot(&Vec3::y()).abs(), 1.0, epsilon = 1e-12);
        }
    }

    /// Projection of points hovering above the plate lands straight below.
    #[test]
    fn plate_projection_drops_straight_down() {
        let plate = tiny_plate();
        let queries = [
            Vec3::new(0.3, 0.4, 0.5),
            Vec3::new(-0.7, 0.1, 1.0),
            Vec3::new(0.0, 0.0, 0.25),
        ];
        let hits = plate.project(&queries);
        for (q, hit) in queries.iter().zip(&hits) {
            assert_abs_diff_eq!(hit.point.x, q.x, epsilon = 1e-12);
            assert_abs_diff_eq!(hit.point.y, q.y, epsilon = 1e-12);
            assert_abs_diff_eq!(hit.point.z, 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(hit.distance, q.z, epsilon = 1e-12);
        }
    }

    /// Projection outside the plate clamps to the boundary edge.
    #[test]
    fn plate_projection_clamps_to_edge() {
        let plate = tiny_plate();
        let hit = &plate.project(&[Vec3::new(2.0, 0.0, 1.0)])[0];
        assert_abs_diff_eq!(hit.point.x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(hit.point.y, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(hit.point.z, 0.0, epsilon = 1e-12);
    }

    /// Forward and reverse projection derivatives satisfy
    /// the dot-product identity for arbitrary seeds.
    #[test]
    fn projection_derivatives_are_adjoint() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(123);
        let mut rv = || Vec3::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5);

        let mut plate = tilted_plate();
        let queries = [Vec3::new(0.2, 0.3, 0.8), Vec3::new(-0.4, 0.5, 0.2)];
        let hits = plate.project(&queries);

        let surf_d: Vec<Vec3> = (0..plate.vertex_count()).map(|_| rv()).collect();
        let query_d: Vec<Vec3> = queries.iter().map(|_| rv()).collect();
        let proj_b: Vec<Vec3> = queries.iter().map(|_| rv()).collect();

        plate.set_forward_seeds(&surf_d);
        let proj_d = plate.project_d(&hits, &query_d);

        let mut query_b = vec![Vec3::zeros(); queries.len()];
        plate.project_b(&hits, &proj_b, &mut query_b);

        let lhs: f64 = proj_d.iter().zip(&proj_b).map(|(d, b)| d.dot(b)).sum();
        let rhs: f64 = plate
            .reverse_seeds()
            .iter()
            .zip(&surf_d)
            .map(|(b, d)| b.dot(d))
            .sum::<f64>()
            + query_b.iter().zip(&query_d).map(|(b, d)| b.dot(d)).sum::<f64>();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
    }
}
