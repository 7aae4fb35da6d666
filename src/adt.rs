//! Alternating digital tree (ADT) over surface elements,
//! used for minimum-distance projections
//! and for pruning element pairs in surface-surface intersection.
//!
//! The tree is a binary partition of element bounding boxes
//! whose split axis alternates with depth (x, y, z, x, ...);
//! leaves own contiguous runs of a reordered element array.

use crate::{mesh::Projection, Vec3};

const LEAF_SIZE: usize = 4;

/// A search tree over the triangles of one surface.
///
/// The tree keeps its own copy of the coordinates and connectivity
/// it was built from, so it stays valid on its own;
/// [`TriSurface`][crate::TriSurface] rebuilds its tree
/// whenever its coordinates change.
#[derive(Clone, Debug)]
pub struct Adt {
    nodes: Vec<Node>,
    root: usize,
    /// element ids reordered so every leaf owns a contiguous slice
    order: Vec<usize>,
    /// inflated bounding box per element, indexed by element id
    boxes: Vec<[Vec3; 2]>,
    vertices: Vec<Vec3>,
    tris: Vec<usize>,
}

#[derive(Clone, Copy, Debug)]
struct Node {
    bounds: [Vec3; 2],
    kind: NodeKind,
}

#[derive(Clone, Copy, Debug)]
enum NodeKind {
    Branch { left: usize, right: usize },
    Leaf { start: usize, end: usize },
}

impl Adt {
    /// Build a tree over flat triangle connectivity.
    ///
    /// Element boxes are inflated by a sliver of the global diagonal
    /// so that exactly touching elements stay candidates in overlap queries.
    pub fn build(vertices: &[Vec3], tris: &[usize]) -> Self {
        let element_count = tris.len() / 3;
        assert!(element_count > 0, "cannot build a tree over zero elements");

        let mut global = [vertices[tris[0]], vertices[tris[0]]];
        for &v in tris {
            global[0] = global[0].inf(&vertices[v]);
            global[1] = global[1].sup(&vertices[v]);
        }
        let pad = 1e-10 * (global[1] - global[0]).norm().max(1.0);

        let mut boxes = Vec::with_capacity(element_count);
        let mut centroids = Vec::with_capacity(element_count);
        for t in tris.chunks_exact(3) {
            let (a, b, c) = (vertices[t[0]], vertices[t[1]], vertices[t[2]]);
            let lo = a.inf(&b).inf(&c) - Vec3::repeat(pad);
            let hi = a.sup(&b).sup(&c) + Vec3::repeat(pad);
            boxes.push([lo, hi]);
            centroids.push((a + b + c) / 3.0);
        }

        let mut order: Vec<usize> = (0..element_count).collect();
        let mut nodes = Vec::new();
        let root = build_range(&mut nodes, &mut order, 0, element_count, 0, &boxes, &centroids);

        Self {
            nodes,
            root,
            order,
            boxes,
            vertices: vertices.to_vec(),
            tris: tris.to_vec(),
        }
    }

    /// Number of elements in the tree.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.boxes.len()
    }

    /// Find the closest point on the surface to a query point.
    ///
    /// Returns exactly the brute-force minimizer;
    /// distance ties go to the lower element id.
    pub fn nearest(&self, point: Vec3) -> Projection {
        let mut best = Projection {
            point: Vec3::zeros(),
            face: usize::MAX,
            bary: [0.0; 3],
            normal: Vec3::zeros(),
            distance: f64::INFINITY,
        };
        self.nearest_in(self.root, point, &mut best);
        best.normal = self.face_normal(best.face);
        best
    }

    fn nearest_in(&self, node: usize, p: Vec3, best: &mut Projection) {
        let n = &self.nodes[node];
        if box_distance(&n.bounds, p) > best.distance {
            return;
        }
        match n.kind {
            NodeKind::Leaf { start, end } => {
                for &el in &self.order[start..end] {
                    let t = &self.tris[3 * el..3 * el + 3];
                    let (foot, bary) = closest_point_triangle(
                        p,
                        self.vertices[t[0]],
                        self.vertices[t[1]],
                        self.vertices[t[2]],
                    );
                    let dist = (p - foot).norm();
                    if dist < best.distance || (dist == best.distance && el < best.face) {
                        best.point = foot;
                        best.face = el;
                        best.bary = bary;
                        best.distance = dist;
                    }
                }
            }
            NodeKind::Branch { left, right } => {
                // descend the nearer child first to tighten the bound early
                let dl = box_distance(&self.nodes[left].bounds, p);
                let dr = box_distance(&self.nodes[right].bounds, p);
                let (first, second) = if dl <= dr { (left, right) } else { (right, left) };
                self.nearest_in(first, p, best);
                self.nearest_in(second, p, best);
            }
        }
    }

    /// All element-id pairs `(self, other)` whose boxes intersect,
    /// sorted for determinism.
    pub fn overlap_candidates(&self, other: &Adt) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        self.overlap_rec(self.root, other, other.root, &mut out);
        out.sort_unstable();
        out
    }

    fn overlap_rec(&self, a: usize, other: &Adt, b: usize, out: &mut Vec<(usize, usize)>) {
        let na = &self.nodes[a];
        let nb = &other.nodes[b];
        if !boxes_intersect(&na.bounds, &nb.bounds) {
            return;
        }
        match (na.kind, nb.kind) {
            (NodeKind::Leaf { start: sa, end: ea }, NodeKind::Leaf { start: sb, end: eb }) => {
                for &ia in &self.order[sa..ea] {
                    for &ib in &other.order[sb..eb] {
                        if boxes_intersect(&self.boxes[ia], &other.boxes[ib]) {
                            out.push((ia, ib));
                        }
                    }
                }
            }
            (NodeKind::Branch { left, right }, _) => {
                self.overlap_rec(left, other, b, out);
                self.overlap_rec(right, other, b, out);
            }
            (NodeKind::Leaf { .. }, NodeKind::Branch { left, right }) => {
                self.overlap_rec(a, other, left, out);
                self.overlap_rec(a, other, right, out);
            }
        }
    }

    fn face_normal(&self, el: usize) -> Vec3 {
        let t = &self.tris[3 * el..3 * el + 3];
        let n = (self.vertices[t[1]] - self.vertices[t[0]])
            .cross(&(self.vertices[t[2]] - self.vertices[t[0]]));
        n.try_normalize(f64::EPSILON).unwrap_or_else(Vec3::zeros)
    }
}

fn build_range(
    nodes: &mut Vec<Node>,
    order: &mut [usize],
    start: usize,
    end: usize,
    depth: usize,
    boxes: &[[Vec3; 2]],
    centroids: &[Vec3],
) -> usize {
    let mut bounds = boxes[order[start]];
    for &el in &order[start + 1..end] {
        bounds[0] = bounds[0].inf(&boxes[el][0]);
        bounds[1] = bounds[1].sup(&boxes[el][1]);
    }

    let kind = if end - start <= LEAF_SIZE {
        NodeKind::Leaf { start, end }
    } else {
        let axis = depth % 3;
        let mid = (end - start) / 2;
        order[start..end]
            .select_nth_unstable_by(mid, |&a, &b| centroids[a][axis].total_cmp(&centroids[b][axis]));
        let left = build_range(nodes, order, start, start + mid, depth + 1, boxes, centroids);
        let right = build_range(nodes, order, start + mid, end, depth + 1, boxes, centroids);
        NodeKind::Branch { left, right }
    };
    nodes.push(Node { bounds, kind });
    nodes.len() - 1
}

fn box_distance(b: &[Vec3; 2], p: Vec3) -> f64 {
    let mut d2 = 0.0;
    for i in 0..3 {
        let d = if p[i] < b[0][i] {
            b[0][i] - p[i]
        } else if p[i] > b[1][i] {
            p[i] - b[1][i]
        } else {
            0.0
        };
        d2 += d * d;
    }
    d2.sqrt()
}

fn boxes_intersect(a: &[Vec3; 2], b: &[Vec3; 2]) -> bool {
    (0..3).all(|i| a[0][i] <= b[1][i] && b[0][i] <= a[1][i])
}

/// Closest point on a triangle and its barycentric coordinates
/// (Voronoi-region case analysis).
pub(crate) fn closest_point_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> (Vec3, [f64; 3]) {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return (a, [1.0, 0.0, 0.0]);
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return (b, [0.0, 1.0, 0.0]);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return (a + v * ab, [1.0 - v, v, 0.0]);
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return (c, [0.0, 0.0, 1.0]);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return (a + w * ac, [1.0 - w, 0.0, w]);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return (b + w * (c - b), [0.0, 1.0 - w, w]);
    }

    let sum = va + vb + vc;
    if sum <= f64::MIN_POSITIVE {
        // degenerate triangle, every region test fell through
        return (a, [1.0, 0.0, 0.0]);
    }
    let v = vb / sum;
    let w = vc / sum;
    (a + ab * v + ac * w, [1.0 - v - w, v, w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{tilted_plate, unit_cube};
    use approx::assert_abs_diff_eq;

    fn brute_force_nearest(vertices: &[Vec3], tris: &[usize], p: Vec3) -> (usize, f64) {
        let mut best = (usize::MAX, f64::INFINITY);
        for (el, t) in tris.chunks_exact(3).enumerate() {
            let (foot, _) = closest_point_triangle(p, vertices[t[0]], vertices[t[1]], vertices[t[2]]);
            let dist = (p - foot).norm();
            if dist < best.1 {
                best = (el, dist);
            }
        }
        best
    }

    /// Tree search returns the brute-force minimizer
    /// for queries inside, outside, and on the surface.
    #[test]
    fn nearest_matches_brute_force() {
        for surf in [unit_cube(), tilted_plate()] {
            let tree = Adt::build(surf.vertices(), surf.tri_indices());
            for i in -3_i32..=3 {
                for j in -3_i32..=3 {
                    for k in -3_i32..=3 {
                        let p = Vec3::new(0.4 * i as f64, 0.4 * j as f64, 0.4 * k as f64);
                        let hit = tree.nearest(p);
                        let (el, dist) = brute_force_nearest(surf.vertices(), surf.tri_indices(), p);
                        assert_eq!(hit.face, el);
                        assert_abs_diff_eq!(hit.distance, dist, epsilon = 1e-13);
                    }
                }
            }
        }
    }

    /// The barycentric weights of a hit reproduce the projected point.
    #[test]
    fn nearest_bary_reconstructs_foot() {
        let surf = tilted_plate();
        let tree = Adt::build(surf.vertices(), surf.tri_indices());
        let hit = tree.nearest(Vec3::new(0.3, -0.2, 1.0));
        let [a, b, c] = surf.face(hit.face);
        let foot = hit.bary[0] * surf.vertex(a) + hit.bary[1] * surf.vertex(b) + hit.bary[2] * surf.vertex(c);
        assert_abs_diff_eq!(foot, hit.point, epsilon = 1e-12);
        assert!(hit.bary.iter().all(|&w| (-1e-12..=1.0 + 1e-12).contains(&w)));
    }

    /// Dual-tree overlap search finds exactly the box-intersecting pairs.
    #[test]
    fn overlap_candidates_match_brute_force() {
        let cube = unit_cube();
        let mut plate = tilted_plate();
        plate.translate(Vec3::new(0.0, 0.0, 0.2));

        let ta = Adt::build(cube.vertices(), cube.tri_indices());
        let tb = Adt::build(plate.vertices(), plate.tri_indices());
        let pairs = ta.overlap_candidates(&tb);

        let mut expected = Vec::new();
        for ia in 0..ta.element_count() {
            for ib in 0..tb.element_count() {
                if boxes_intersect(&ta.boxes[ia], &tb.boxes[ib]) {
                    expected.push((ia, ib));
                }
            }
        }
        assert_eq!(pairs, expected);
        assert!(!pairs.is_empty());
    }
}
