//! Surface-surface intersection:
//! Möller-style triangle-pair segment computation
//! over tree-pruned candidate pairs,
//! node merging, chaining of segments into ordered curves,
//! and derivative propagation through the closed-form
//! edge-plane crossings that generate every intersection node.

use std::collections::HashSet;

use crate::{
    curve::{chain_bars, Curve, CurveError},
    mesh::TriSurface,
    Vec3,
};

/// Provenance of one intersection node:
/// the crossing of one triangle's edge with the other triangle's plane.
///
/// Vertex ids are global indices into the owning surfaces,
/// so derivative propagation can address the parent coordinates directly.
#[derive(Clone, Copy, Debug)]
pub struct CrossingRecord {
    /// True when the crossing edge belongs to the first surface
    /// (and the plane triangle to the second).
    pub edge_on_first: bool,
    /// Global vertex ids of the crossing edge's endpoints.
    pub edge: [usize; 2],
    /// Global vertex ids of the plane triangle.
    pub plane: [usize; 3],
    /// Parameter of the crossing along the edge, in (0, 1).
    pub t: f64,
}

/// Intersect two surfaces into ordered polyline curves.
///
/// Candidate triangle pairs come from the surfaces' search trees;
/// each properly crossing pair contributes one line segment,
/// segment endpoints within `dist_tol` of each other merge into one node,
/// and the surviving segments chain into curves named
/// `int_<first>_<second>` (suffixed when several come out).
/// Every produced curve records both parents in its metadata.
pub fn intersect_surfaces(
    first: &TriSurface,
    second: &TriSurface,
    dist_tol: f64,
) -> Result<Vec<Curve>, CurveError> {
    Ok(intersect_with_provenance(first, second, dist_tol)?
        .into_iter()
        .map(|(curve, _)| curve)
        .collect())
}

/// Like [`intersect_surfaces`], returning for each curve
/// the per-node [`CrossingRecord`]s that derivative propagation needs.
pub fn intersect_with_provenance(
    first: &TriSurface,
    second: &TriSurface,
    dist_tol: f64,
) -> Result<Vec<(Curve, Vec<CrossingRecord>)>, CurveError> {
    let candidates = first.tree().overlap_candidates(second.tree());
    log::debug!(
        "intersecting '{}' with '{}': {} candidate pairs",
        first.name(),
        second.name(),
        candidates.len()
    );

    let mut node_points: Vec<Vec3> = Vec::new();
    let mut node_prov: Vec<CrossingRecord> = Vec::new();
    let mut bars: Vec<usize> = Vec::new();
    let mut seen_bars: HashSet<(usize, usize)> = HashSet::new();

    let mut merge_node = |point: Vec3, prov: CrossingRecord| -> usize {
        // first accepted node within tolerance wins; its provenance is kept
        for (i, p) in node_points.iter().enumerate() {
            if (p - point).norm() <= dist_tol {
                return i;
            }
        }
        node_points.push(point);
        node_prov.push(prov);
        node_points.len() - 1
    };

    for (ea, eb) in candidates {
        let ta = first.face(ea);
        let tb = second.face(eb);
        let seg = tri_tri_segment(
            [first.vertex(ta[0]), first.vertex(ta[1]), first.vertex(ta[2])],
            [second.vertex(tb[0]), second.vertex(tb[1]), second.vertex(tb[2])],
            ta,
            tb,
        );
        if let Some((lo, hi)) = seg {
            let a = merge_node(lo.0, lo.1);
            let b = merge_node(hi.0, hi.1);
            if a == b {
                // collapsed below the tolerance
                continue;
            }
            let key = (a.min(b), a.max(b));
            if seen_bars.insert(key) {
                bars.push(a);
                bars.push(b);
            }
        }
    }

    if bars.is_empty() {
        log::debug!("'{}' and '{}' do not intersect", first.name(), second.name());
        return Ok(Vec::new());
    }

    let name = format!("int_{}_{}", first.name(), second.name());
    let chains = chain_bars(&bars);
    let many = chains.len() > 1;
    chains
        .into_iter()
        .enumerate()
        .map(|(i, (node_ids, closed))| {
            let points: Vec<Vec3> = node_ids.iter().map(|&id| node_points[id]).collect();
            let prov: Vec<CrossingRecord> = node_ids.iter().map(|&id| node_prov[id]).collect();
            let chain_name = if many { format!("{name}_{i:02}") } else { name.clone() };
            let mut curve = Curve::new(chain_name, points, closed)?;
            curve.meta_mut().parents =
                Some([first.name().to_string(), second.name().to_string()]);
            Ok((curve, prov))
        })
        .collect()
}

/// Forward derivative propagation:
/// map the parents' forward seeds to per-node seeds
/// of an intersection curve via its crossing records.
pub fn intersection_seeds_d(
    prov: &[CrossingRecord],
    first: &TriSurface,
    second: &TriSurface,
) -> Vec<Vec3> {
    prov.iter()
        .map(|rec| {
            let (edge_surf, plane_surf) =
                if rec.edge_on_first { (first, second) } else { (second, first) };
            let e0 = edge_surf.vertex(rec.edge[0]);
            let e1 = edge_surf.vertex(rec.edge[1]);
            let v0 = plane_surf.vertex(rec.plane[0]);
            let v1 = plane_surf.vertex(rec.plane[1]);
            let v2 = plane_surf.vertex(rec.plane[2]);

            let de0 = edge_surf.forward_seeds()[rec.edge[0]];
            let de1 = edge_surf.forward_seeds()[rec.edge[1]];
            let dv0 = plane_surf.forward_seeds()[rec.plane[0]];
            let dv1 = plane_surf.forward_seeds()[rec.plane[1]];
            let dv2 = plane_surf.forward_seeds()[rec.plane[2]];

            let u = e1 - e0;
            let w = v0 - e0;
            let n = (v1 - v0).cross(&(v2 - v0));
            let denom = n.dot(&u);

            // p = e0 + t u,  t = n.w / n.u
            let dn = (dv1 - dv0).cross(&(v2 - v0)) + (v1 - v0).cross(&(dv2 - dv0));
            let du = de1 - de0;
            let dw = dv0 - de0;
            let dt = ((dn.dot(&w) + n.dot(&dw)) - rec.t * (dn.dot(&u) + n.dot(&du))) / denom;

            de0 + rec.t * du + dt * u
        })
        .collect()
}

/// Reverse counterpart of [`intersection_seeds_d`]:
/// accumulate per-node reverse seeds of an intersection curve
/// back into both parents' reverse seeds.
pub fn intersection_seeds_b(
    prov: &[CrossingRecord],
    first: &mut TriSurface,
    second: &mut TriSurface,
    node_seeds: &[Vec3],
) {
    assert_eq!(prov.len(), node_seeds.len());
    for (rec, pbar) in prov.iter().zip(node_seeds) {
        let (edge_surf, plane_surf) = if rec.edge_on_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };
        let e0 = edge_surf.vertex(rec.edge[0]);
        let e1 = edge_surf.vertex(rec.edge[1]);
        let v0 = plane_surf.vertex(rec.plane[0]);
        let v1 = plane_surf.vertex(rec.plane[1]);
        let v2 = plane_surf.vertex(rec.plane[2]);

        let u = e1 - e0;
        let w = v0 - e0;
        let leg_a = v1 - v0;
        let leg_b = v2 - v0;
        let n = leg_a.cross(&leg_b);
        let denom = n.dot(&u);

        // adjoint of: p = e0 + t u,  t = n.w / n.u
        let tbar = u.dot(pbar);
        let mut ubar = rec.t * pbar;
        let mut e0bar = *pbar;
        let s = tbar / denom;
        let nbar = s * (w - rec.t * u);
        let wbar = s * n;
        ubar -= s * rec.t * n;

        // w = v0 - e0,  u = e1 - e0
        let mut v0bar = wbar;
        e0bar -= wbar;
        let e1bar = ubar;
        e0bar -= ubar;

        // n = leg_a x leg_b
        let leg_a_bar = leg_b.cross(&nbar);
        let leg_b_bar = nbar.cross(&leg_a);
        let v1bar = leg_a_bar;
        let v2bar = leg_b_bar;
        v0bar -= leg_a_bar + leg_b_bar;

        edge_surf.accumulate_reverse_seed(rec.edge[0], e0bar);
        edge_surf.accumulate_reverse_seed(rec.edge[1], e1bar);
        plane_surf.accumulate_reverse_seed(rec.plane[0], v0bar);
        plane_surf.accumulate_reverse_seed(rec.plane[1], v1bar);
        plane_surf.accumulate_reverse_seed(rec.plane[2], v2bar);
    }
}

type SegmentEnd = (Vec3, CrossingRecord);

/// Intersection segment of two triangles, or `None` when they do not
/// properly cross (disjoint, merely touching, or coplanar).
fn tri_tri_segment(
    a: [Vec3; 3],
    b: [Vec3; 3],
    a_ids: [usize; 3],
    b_ids: [usize; 3],
) -> Option<(SegmentEnd, SegmentEnd)> {
    let n_a = (a[1] - a[0]).cross(&(a[2] - a[0]));
    let n_b = (b[1] - b[0]).cross(&(b[2] - b[0]));

    let scale = n_a.norm().max(n_b.norm());
    if scale <= f64::MIN_POSITIVE {
        return None;
    }
    let eps = 1e-13 * scale;

    // signed distances to the other triangle's plane
    let da: Vec<f64> = a.iter().map(|p| n_b.dot(&(p - b[0]))).collect();
    let db: Vec<f64> = b.iter().map(|p| n_a.dot(&(p - a[0]))).collect();
    if da.iter().any(|d| d.abs() <= eps) || db.iter().any(|d| d.abs() <= eps) {
        // touching and coplanar configurations yield no proper segment
        return None;
    }
    if da.iter().all(|&d| d > 0.0) || da.iter().all(|&d| d < 0.0) {
        return None;
    }
    if db.iter().all(|&d| d > 0.0) || db.iter().all(|&d| d < 0.0) {
        return None;
    }

    let cross_a = edge_crossings(&a, a_ids, &da, &b, b_ids, true);
    let cross_b = edge_crossings(&b, b_ids, &db, &a, a_ids, false);
    if cross_a.len() != 2 || cross_b.len() != 2 {
        return None;
    }

    // order both chords along the intersection line and take the overlap
    let dir = n_a.cross(&n_b);
    let sort2 = |mut pair: Vec<SegmentEnd>| -> Vec<SegmentEnd> {
        if dir.dot(&pair[0].0) > dir.dot(&pair[1].0) {
            pair.swap(0, 1);
        }
        pair
    };
    let ca = sort2(cross_a);
    let cb = sort2(cross_b);

    let lo = if dir.dot(&ca[0].0) >= dir.dot(&cb[0].0) { ca[0] } else { cb[0] };
    let hi = if dir.dot(&ca[1].0) <= dir.dot(&cb[1].0) { ca[1] } else { cb[1] };
    if dir.dot(&lo.0) >= dir.dot(&hi.0) {
        return None;
    }
    Some((lo, hi))
}

/// Crossings of `tri`'s edges through the plane of `plane`,
/// recorded with [`CrossingRecord`] provenance.
/// `dists` holds the precomputed signed plane distances of `tri`'s vertices.
fn edge_crossings(
    tri: &[Vec3; 3],
    ids: [usize; 3],
    dists: &[f64],
    plane: &[Vec3; 3],
    plane_ids: [usize; 3],
    edge_on_first: bool,
) -> Vec<SegmentEnd> {
    let n = (plane[1] - plane[0]).cross(&(plane[2] - plane[0]));
    let mut out = Vec::with_capacity(2);
    for (i, j) in [(0_usize, 1_usize), (1, 2), (2, 0)] {
        if dists[i] * dists[j] < 0.0 {
            let (p, q) = (tri[i], tri[j]);
            let t = n.dot(&(plane[0] - p)) / n.dot(&(q - p));
            out.push((
                p + t * (q - p),
                CrossingRecord {
                    edge_on_first,
                    edge: [ids[i], ids[j]],
                    plane: plane_ids,
                    t,
                },
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{tiny_plate, unit_cube};
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// A plate big enough to pass clean through the cube, at height z.
    fn cutting_plate(z: f64) -> TriSurface {
        let mut plate = tiny_plate();
        plate.scale(2.0);
        plate.translate(Vec3::new(0.0, 0.0, z));
        plate
    }

    /// Two triangles crossing in an X give the hand-computed segment.
    #[test]
    fn tri_pair_segment_is_correct() {
        // a: in the z = 0 plane, b: vertical, crossing along y = 0.25
        let a = [Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
        let b = [
            Vec3::new(0.1, 0.25, -1.0),
            Vec3::new(0.6, 0.25, -1.0),
            Vec3::new(0.35, 0.25, 1.0),
        ];
        let (lo, hi) =
            tri_tri_segment(a, b, [0, 1, 2], [3, 4, 5]).expect("triangles should cross");
        for end in [&lo, &hi] {
            assert_abs_diff_eq!(end.0.z, 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(end.0.y, 0.25, epsilon = 1e-12);
        }
        // the chord of b at z = 0 runs from x = 0.225 to x = 0.475
        let (xlo, xhi) = (lo.0.x.min(hi.0.x), lo.0.x.max(hi.0.x));
        assert_abs_diff_eq!(xlo, 0.225, epsilon = 1e-12);
        assert_abs_diff_eq!(xhi, 0.475, epsilon = 1e-12);
    }

    /// Separated triangles and merely touching ones yield nothing.
    #[test]
    fn disjoint_triangles_do_not_cross() {
        let a = [Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
        let away = [
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 1.0, 2.0),
        ];
        assert!(tri_tri_segment(a, away, [0, 1, 2], [3, 4, 5]).is_none());
        // a vertex exactly on the plane counts as touching
        let touch = [
            Vec3::new(0.2, 0.2, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 1.0, 1.0),
        ];
        assert!(tri_tri_segment(a, touch, [0, 1, 2], [3, 4, 5]).is_none());
    }

    /// A plate through the middle of the cube produces one closed
    /// square curve of the right size, lying on both surfaces.
    #[test]
    fn cube_plate_intersection_is_closed_square() {
        let cube = unit_cube();
        let plate = cutting_plate(0.2);
        let curves = intersect_surfaces(&cube, &plate, 1e-7).unwrap();
        assert_eq!(curves.len(), 1);
        let c = &curves[0];
        assert!(c.is_closed());
        assert_abs_diff_eq!(c.arc_length(), 4.0, epsilon = 1e-9);
        for p in c.points() {
            assert_abs_diff_eq!(p.z, 0.2, epsilon = 1e-10);
            assert_abs_diff_eq!(p.x.abs().max(p.y.abs()), 0.5, epsilon = 1e-10);
        }
        assert_eq!(
            c.meta().parents.as_ref().map(|p| [p[0].as_str(), p[1].as_str()]),
            Some(["cube", "plate"])
        );
    }

    /// Surfaces that do not touch produce no curves.
    #[test]
    fn separated_surfaces_yield_no_curves() {
        let cube = unit_cube();
        let plate = cutting_plate(3.0);
        assert!(intersect_surfaces(&cube, &plate, 1e-7).unwrap().is_empty());
    }

    /// A piece shorter than the merge tolerance collapses to a single
    /// node and its bar is dropped, leaving the rest of the curve.
    #[test]
    fn segments_below_tolerance_collapse() {
        // the panel's diagonal splits its crossing with the floor into
        // a 0.9 piece and a 0.1 piece along the x axis
        let panel = TriSurface::build(
            "panel",
            vec![
                Vec3::new(0.0, 0.0, -0.1),
                Vec3::new(1.0, 0.0, -0.1),
                Vec3::new(1.0, 0.0, 0.9),
                Vec3::new(0.0, 0.0, 0.9),
            ],
            vec![0, 1, 2, 0, 2, 3],
            vec![],
        )
        .unwrap();
        let floor = TriSurface::build(
            "floor",
            vec![
                Vec3::new(-1.0, -1.0, 0.0),
                Vec3::new(3.0, -1.0, 0.0),
                Vec3::new(-1.0, 3.0, 0.0),
            ],
            vec![0, 1, 2],
            vec![],
        )
        .unwrap();

        let fine = intersect_surfaces(&panel, &floor, 1e-7).unwrap();
        assert_eq!(fine.len(), 1);
        assert!(!fine[0].is_closed());
        assert_eq!(fine[0].node_count(), 3);
        assert_abs_diff_eq!(fine[0].arc_length(), 1.0, epsilon = 1e-9);

        // a tolerance above 0.1 merges the short piece's endpoints
        let coarse = intersect_surfaces(&panel, &floor, 0.2).unwrap();
        assert_eq!(coarse.len(), 1);
        assert!(!coarse[0].is_closed());
        assert_eq!(coarse[0].node_count(), 2);
        assert!(coarse[0].arc_length() >= 0.9 - 1e-9);
    }

    /// Forward intersection derivatives match central finite differences
    /// when the plate sinks vertically.
    #[test]
    fn intersection_forward_matches_finite_differences() {
        let cube = unit_cube();
        let plate = cutting_plate(0.2);
        let pairs = intersect_with_provenance(&cube, &plate, 1e-7).unwrap();
        let (_, prov) = &pairs[0];

        // seed: the plate translates down in z, the cube stays put
        let dz = Vec3::new(0.0, 0.0, -1.0);
        let mut plate_d = plate.clone();
        plate_d.set_forward_seeds(&vec![dz; plate.vertex_count()]);
        let seeds = intersection_seeds_d(prov, &cube, &plate_d);

        let h = 1e-6;
        let shifted = |sign: f64| {
            let mut p = plate.clone();
            p.translate(sign * h * dz);
            intersect_with_provenance(&cube, &p, 1e-7).unwrap()
        };
        let (plus, minus) = (shifted(1.0), shifted(-1.0));
        assert_eq!(plus.len(), 1);
        assert_eq!(minus.len(), 1);
        for (k, ds) in seeds.iter().enumerate() {
            let fd = (plus[0].0.point(k) - minus[0].0.point(k)) / (2.0 * h);
            assert_abs_diff_eq!(ds, &fd, epsilon = 1e-6);
        }
        // every node rides the plane down, whichever edge generated it
        for ds in &seeds {
            assert_abs_diff_eq!(ds.z, -1.0, epsilon = 1e-9);
        }
    }

    /// Forward and reverse intersection derivatives are adjoint.
    #[test]
    fn intersection_derivatives_are_adjoint() {
        let mut cube = unit_cube();
        let mut plate = cutting_plate(0.2);
        let pairs = intersect_with_provenance(&cube, &plate, 1e-7).unwrap();
        let (curve, prov) = &pairs[0];

        let mut rng = StdRng::seed_from_u64(123);
        let mut rv =
            || Vec3::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5);
        let cube_d: Vec<Vec3> = (0..cube.vertex_count()).map(|_| rv()).collect();
        let plate_d: Vec<Vec3> = (0..plate.vertex_count()).map(|_| rv()).collect();
        let node_b: Vec<Vec3> = (0..curve.node_count()).map(|_| rv()).collect();

        cube.set_forward_seeds(&cube_d);
        plate.set_forward_seeds(&plate_d);
        let node_d = intersection_seeds_d(prov, &cube, &plate);
        intersection_seeds_b(prov, &mut cube, &mut plate, &node_b);

        let lhs: f64 = node_d.iter().zip(&node_b).map(|(d, b)| d.dot(b)).sum();
        let rhs: f64 = cube
            .reverse_seeds()
            .iter()
            .zip(&cube_d)
            .map(|(b, d)| b.dot(d))
            .sum::<f64>()
            + plate
                .reverse_seeds()
                .iter()
                .zip(&plate_d)
                .map(|(b, d)| b.dot(d))
                .sum::<f64>();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
    }
}
