//! Polyline curves: chaining of bar elements into ordered polylines,
//! orientation and projection queries,
//! and the remesh/split/merge surgery that collar generation needs.
//! Every operation that moves coordinates
//! has exact forward and reverse derivative-propagation counterparts.

use std::collections::VecDeque;

use fixedbitset as fb;
use nalgebra as na;

use crate::{mesh::Axis, Vec3};

/// Error in constructing or operating on a [`Curve`].
#[derive(Debug, thiserror::Error)]
pub enum CurveError {
    /// The curve would have too few points to be well formed.
    #[error("curve needs at least {needed} points, got {got}")]
    TooFewPoints {
        /// Minimum point count for the operation.
        needed: usize,
        /// Point count actually available.
        got: usize,
    },
    /// A flat bar-connectivity array had odd length.
    #[error("bar connectivity length {len} is not a multiple of 2")]
    RaggedConnectivity {
        /// Length of the offending array.
        len: usize,
    },
    /// A bar element referenced a nonexistent point.
    #[error("point index {index} out of bounds for {point_count} points")]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Number of points available.
        point_count: usize,
    },
    /// An operation that needs a closed curve was given an open one.
    #[error("curve '{0}' is not closed")]
    NotClosed(String),
    /// The curve's total arc length vanished.
    #[error("curve '{0}' has zero arc length")]
    ZeroLength(String),
    /// Curves given to a merge do not form a single connected chain.
    #[error("{unplaced} of {total} curves could not be connected into the merged chain")]
    MergeDisconnected {
        /// Curves left over after chaining.
        unplaced: usize,
        /// Total number of curves given.
        total: usize,
    },
    /// An operation was given no input curves or elements.
    #[error("no input curves or elements given")]
    EmptyInput,
}

/// How to distribute new nodes along a remeshed curve's arc length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Spacing {
    /// Uniform arc-length spacing.
    #[default]
    Linear,
    /// Cosine clustering towards both ends.
    Cosine,
}

impl Spacing {
    /// Normalized arc-length position of node `k` out of `n` samples in [0, 1].
    fn fraction(self, k: usize, n: usize) -> f64 {
        let u = k as f64 / n as f64;
        match self {
            Spacing::Linear => u,
            Spacing::Cosine => 0.5 * (1.0 - (std::f64::consts::PI * u).cos()),
        }
    }
}

/// Options for [`Curve::split`].
#[derive(Clone, Debug)]
pub struct SplitOptions {
    /// Split wherever the turning angle between consecutive segments
    /// exceeds this many degrees. `None` disables sharpness detection.
    pub angle_deg: Option<f64>,
    /// Additionally split at the node nearest each of these points.
    pub at_points: Vec<Vec3>,
}

impl Default for SplitOptions {
    fn default() -> Self {
        // the sharpness default the curve-surgery workflow uses
        Self { angle_deg: Some(60.0), at_points: Vec::new() }
    }
}

/// Provenance bookkeeping attached to a curve,
/// filled in by the operations that created it.
#[derive(Clone, Debug, Default)]
pub struct CurveMeta {
    /// Names of the two surface components whose intersection produced this curve.
    pub parents: Option<[String; 2]>,
    /// Name of the curve this one was split or remeshed from.
    pub parent_curve: Option<String>,
    /// Names of structured meshes marched from this curve.
    pub child_meshes: Vec<String>,
}

/// Result of projecting a point onto a [`Curve`].
#[derive(Clone, Copy, Debug)]
pub struct CurveProjection {
    /// The projected point (closest point on the polyline).
    pub point: Vec3,
    /// Index of the segment the projection landed on.
    pub segment: usize,
    /// Parameter along that segment in [0, 1].
    pub t: f64,
    /// Unit tangent of that segment.
    pub tangent: Vec3,
    /// Distance from the query point to the projected point.
    pub distance: f64,
}

/// A named ordered polyline, open or closed.
///
/// Closed curves do not repeat their first point;
/// the wrap-around segment is implicit.
/// Like [`TriSurface`][crate::TriSurface], every curve carries
/// forward and reverse derivative-seed arrays parallel to its points.
#[derive(Clone, Debug)]
pub struct Curve {
    name: String,
    points: Vec<Vec3>,
    closed: bool,
    seeds_d: Vec<Vec3>,
    seeds_b: Vec<Vec3>,
    meta: CurveMeta,
}

impl Curve {
    /// Create a curve from ordered points.
    ///
    /// Open curves need at least 2 points, closed ones at least 3.
    pub fn new(name: impl Into<String>, points: Vec<Vec3>, closed: bool) -> Result<Self, CurveError> {
        let needed = if closed { 3 } else { 2 };
        if points.len() < needed {
            return Err(CurveError::TooFewPoints { needed, got: points.len() });
        }
        let n = points.len();
        Ok(Self {
            name: name.into(),
            points,
            closed,
            seeds_d: vec![Vec3::zeros(); n],
            seeds_b: vec![Vec3::zeros(); n],
            meta: CurveMeta::default(),
        })
    }

    /// Chain a soup of 2-node bar elements into one or more ordered curves.
    ///
    /// Bars are linked end-to-end regardless of their stored orientation
    /// (four matching cases per step: append or prepend, flipped or not).
    /// A chain whose ends meet becomes a closed curve.
    /// Chains get the given name, suffixed with a two-digit index
    /// when more than one comes out.
    pub fn from_bars(
        name: impl Into<String>,
        points: &[Vec3],
        bars: &[usize],
    ) -> Result<Vec<Self>, CurveError> {
        if bars.len() % 2 != 0 {
            return Err(CurveError::RaggedConnectivity { len: bars.len() });
        }
        if bars.is_empty() {
            return Err(CurveError::EmptyInput);
        }
        for &idx in bars {
            if idx >= points.len() {
                return Err(CurveError::IndexOutOfBounds { index: idx, point_count: points.len() });
            }
        }

        let name = name.into();
        let chains = chain_bars(bars);
        let many = chains.len() > 1;
        chains
            .into_iter()
            .enumerate()
            .map(|(i, (node_ids, closed))| {
                let chain_points = node_ids.iter().map(|&id| points[id]).collect();
                let chain_name =
                    if many { format!("{name}_{i:02}") } else { name.clone() };
                Self::new(chain_name, chain_points, closed)
            })
            .collect()
    }

    /// The curve's name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the curve.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Whether the curve closes back on itself.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of points.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.points.len()
    }

    /// Number of segments (one less than the node count for open curves,
    /// equal to it for closed ones).
    #[inline]
    pub fn segment_count(&self) -> usize {
        if self.closed {
            self.points.len()
        } else {
            self.points.len() - 1
        }
    }

    /// All points in order.
    #[inline]
    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    /// One point.
    #[inline]
    pub fn point(&self, idx: usize) -> Vec3 {
        self.points[idx]
    }

    /// Endpoint node indices of a segment (wraps on closed curves).
    #[inline]
    pub fn segment(&self, seg: usize) -> (usize, usize) {
        (seg, (seg + 1) % self.points.len())
    }

    /// Provenance bookkeeping.
    #[inline]
    pub fn meta(&self) -> &CurveMeta {
        &self.meta
    }

    /// Mutable provenance bookkeeping.
    #[inline]
    pub fn meta_mut(&mut self) -> &mut CurveMeta {
        &mut self.meta
    }

    /// Total arc length (including the wrap segment when closed).
    pub fn arc_length(&self) -> f64 {
        (0..self.segment_count())
            .map(|s| {
                let (i, j) = self.segment(s);
                (self.points[j] - self.points[i]).norm()
            })
            .sum()
    }

    /// Cumulative arc length at each segment boundary;
    /// has `segment_count() + 1` entries starting at 0.
    pub fn cumulative_lengths(&self) -> Vec<f64> {
        let mut cum = Vec::with_capacity(self.segment_count() + 1);
        cum.push(0.0);
        for s in 0..self.segment_count() {
            let (i, j) = self.segment(s);
            cum.push(cum[s] + (self.points[j] - self.points[i]).norm());
        }
        cum
    }

    /// Reverse the curve's orientation in place (seeds flip along).
    pub fn flip(&mut self) {
        self.points.reverse();
        self.seeds_d.reverse();
        self.seeds_b.reverse();
    }

    /// Rotate a closed curve's node ordering
    /// so it starts at the node nearest `start_point`.
    /// Returns the offset old ordering was rotated left by.
    pub fn shift_end_nodes(&mut self, start_point: Vec3) -> Result<usize, CurveError> {
        if !self.closed {
            return Err(CurveError::NotClosed(self.name.clone()));
        }
        let nearest = self
            .points
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - start_point).norm().total_cmp(&(*b - start_point).norm())
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.points.rotate_left(nearest);
        self.seeds_d.rotate_left(nearest);
        self.seeds_b.rotate_left(nearest);
        Ok(nearest)
    }

    /// Translate every point by a vector.
    pub fn translate(&mut self, offset: Vec3) {
        for p in &mut self.points {
            *p += offset;
        }
    }

    /// Scale every point about the origin.
    pub fn scale(&mut self, factor: f64) {
        for p in &mut self.points {
            *p *= factor;
        }
    }

    /// Rotate every point about a coordinate axis through the origin.
    pub fn rotate_deg(&mut self, angle_deg: f64, axis: Axis) {
        let angle = angle_deg.to_radians();
        let rot = match axis {
            Axis::X => na::Rotation3::from_axis_angle(&Vec3::x_axis(), angle),
            Axis::Y => na::Rotation3::from_axis_angle(&Vec3::y_axis(), angle),
            Axis::Z => na::Rotation3::from_axis_angle(&Vec3::z_axis(), angle),
        };
        for p in &mut self.points {
            *p = rot * *p;
        }
    }

    //
    // projection
    //

    /// Closest point on the polyline to a query point.
    /// Distance ties go to the lower segment index.
    pub fn project(&self, p: Vec3) -> CurveProjection {
        let mut best = CurveProjection {
            point: self.points[0],
            segment: 0,
            t: 0.0,
            tangent: Vec3::zeros(),
            distance: f64::INFINITY,
        };
        for s in 0..self.segment_count() {
            let (i, j) = self.segment(s);
            let (a, b) = (self.points[i], self.points[j]);
            let e = b - a;
            let len2 = e.norm_squared();
            let t = if len2 > 0.0 { ((p - a).dot(&e) / len2).clamp(0.0, 1.0) } else { 0.0 };
            let foot = a + t * e;
            let dist = (p - foot).norm();
            if dist < best.distance {
                best = CurveProjection {
                    point: foot,
                    segment: s,
                    t,
                    tangent: e.try_normalize(f64::EPSILON).unwrap_or_else(Vec3::zeros),
                    distance: dist,
                };
            }
        }
        best
    }

    /// Forward derivative of a projection
    /// with the foot segment and parameter frozen:
    /// the query seed acts along the tangent,
    /// the curve's own seeds through the normal plane.
    pub fn project_d(&self, hit: &CurveProjection, query_seed: Vec3) -> Vec3 {
        let (i, j) = self.segment(hit.segment);
        let u = hit.tangent;
        let cd = (1.0 - hit.t) * self.seeds_d[i] + hit.t * self.seeds_d[j];
        u * u.dot(&query_seed) + (cd - u * u.dot(&cd))
    }

    /// Reverse counterpart of [`project_d`][Self::project_d]:
    /// accumulates into the curve's reverse seeds and the query's seed.
    pub fn project_b(&mut self, hit: &CurveProjection, proj_seed: Vec3, query_seed: &mut Vec3) {
        let (i, j) = self.segment(hit.segment);
        let u = hit.tangent;
        *query_seed += u * u.dot(&proj_seed);
        let lateral = proj_seed - u * u.dot(&proj_seed);
        self.seeds_b[i] += (1.0 - hit.t) * lateral;
        self.seeds_b[j] += hit.t * lateral;
    }

    //
    // remesh
    //

    /// Redistribute `n_new_nodes` along the curve's arc length.
    ///
    /// Open curves keep both endpoints exactly;
    /// closed curves keep node 0 and place nodes around the full loop.
    /// The result is named `<name>_remeshed` and records this curve
    /// as its parent.
    pub fn remesh(&self, n_new_nodes: usize, spacing: Spacing) -> Result<Curve, CurveError> {
        let map = self.remesh_map(n_new_nodes, spacing)?;
        let points = map
            .samples
            .iter()
            .map(|s| {
                let (i, j) = self.segment(s.segment);
                self.points[i] + s.alpha * (self.points[j] - self.points[i])
            })
            .collect();
        let mut out = Curve::new(format!("{}_remeshed", self.name), points, self.closed)?;
        out.meta.parent_curve = Some(self.name.clone());
        out.meta.parents = self.meta.parents.clone();
        Ok(out)
    }

    /// Forward derivative of [`remesh`][Self::remesh]:
    /// maps this curve's forward seeds to the remeshed node seeds,
    /// including the dependence of the arc-length parametrization
    /// on the coordinates.
    pub fn remesh_d(&self, n_new_nodes: usize, spacing: Spacing) -> Result<Vec<Vec3>, CurveError> {
        let map = self.remesh_map(n_new_nodes, spacing)?;
        let nseg = self.segment_count();

        // segment length and cumulative-length differentials
        let mut dl = vec![0.0; nseg];
        let mut ds = vec![0.0; nseg + 1];
        for s in 0..nseg {
            let (i, j) = self.segment(s);
            let e = self.points[j] - self.points[i];
            let len = e.norm();
            dl[s] = if len > 0.0 {
                e.dot(&(self.seeds_d[j] - self.seeds_d[i])) / len
            } else {
                0.0
            };
            ds[s + 1] = ds[s] + dl[s];
        }
        let dtotal = ds[nseg];

        Ok(map
            .samples
            .iter()
            .map(|smp| {
                let (i, j) = self.segment(smp.segment);
                let e = self.points[j] - self.points[i];
                let len = map.lengths[smp.segment];
                let dalpha = if len > 0.0 {
                    (smp.fraction * dtotal - ds[smp.segment] - smp.alpha * dl[smp.segment]) / len
                } else {
                    0.0
                };
                self.seeds_d[i]
                    + smp.alpha * (self.seeds_d[j] - self.seeds_d[i])
                    + dalpha * e
            })
            .collect())
    }

    /// Reverse counterpart of [`remesh_d`][Self::remesh_d]:
    /// accumulates remeshed-node reverse seeds into this curve's seeds.
    pub fn remesh_b(
        &mut self,
        n_new_nodes: usize,
        spacing: Spacing,
        out_seeds: &[Vec3],
    ) -> Result<(), CurveError> {
        let map = self.remesh_map(n_new_nodes, spacing)?;
        assert_eq!(out_seeds.len(), map.samples.len());
        let nseg = self.segment_count();

        let mut lbar = vec![0.0; nseg];
        let mut sbar = vec![0.0; nseg + 1];
        let mut total_bar = 0.0;

        for (smp, yb) in map.samples.iter().zip(out_seeds) {
            let (i, j) = self.segment(smp.segment);
            let e = self.points[j] - self.points[i];
            // direct interpolation terms
            self.seeds_b[i] += (1.0 - smp.alpha) * yb;
            self.seeds_b[j] += smp.alpha * yb;
            // alpha term
            let len = map.lengths[smp.segment];
            if len > 0.0 {
                let abar = yb.dot(&e);
                total_bar += abar * smp.fraction / len;
                sbar[smp.segment] -= abar / len;
                lbar[smp.segment] -= abar * smp.alpha / len;
            }
        }

        // d(total) = sum of all dl; d(s_k) = sum of dl below k
        let mut suffix = 0.0;
        for s in (0..nseg).rev() {
            suffix += sbar[s + 1];
            lbar[s] += suffix + total_bar;
        }

        for s in 0..nseg {
            let (i, j) = self.segment(s);
            let e = self.points[j] - self.points[i];
            let len = map.lengths[s];
            if len > 0.0 {
                let g = (lbar[s] / len) * e;
                self.seeds_b[j] += g;
                self.seeds_b[i] -= g;
            }
        }
        Ok(())
    }

    fn remesh_map(&self, n_new_nodes: usize, spacing: Spacing) -> Result<RemeshMap, CurveError> {
        let needed = if self.closed { 3 } else { 2 };
        if n_new_nodes < needed {
            return Err(CurveError::TooFewPoints { needed, got: n_new_nodes });
        }
        let cum = self.cumulative_lengths();
        let nseg = self.segment_count();
        let total = cum[nseg];
        if total <= 0.0 {
            return Err(CurveError::ZeroLength(self.name.clone()));
        }
        let lengths: Vec<f64> = (0..nseg).map(|s| cum[s + 1] - cum[s]).collect();

        // closed curves sample the half-open loop, open ones include both ends
        let denom = if self.closed { n_new_nodes } else { n_new_nodes - 1 };
        let samples = (0..n_new_nodes)
            .map(|k| {
                let fraction = spacing.fraction(k, denom);
                let target = fraction * total;
                // last segment with cum <= target
                let mut segment = match cum.binary_search_by(|c| c.total_cmp(&target)) {
                    Ok(idx) => idx,
                    Err(idx) => idx - 1,
                };
                segment = segment.min(nseg - 1);
                let alpha = if lengths[segment] > 0.0 {
                    ((target - cum[segment]) / lengths[segment]).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                RemeshSample { fraction, segment, alpha }
            })
            .collect();
        Ok(RemeshMap { samples, lengths })
    }

    //
    // split
    //

    /// Node indices where the curve should break:
    /// sharp kinks past the angle threshold plus nodes nearest
    /// the explicitly supplied points, sorted and deduplicated.
    pub fn split_nodes(&self, opts: &SplitOptions) -> Vec<usize> {
        let n = self.points.len();
        let mut breaks = Vec::new();

        if let Some(angle_deg) = opts.angle_deg {
            let cos_limit = angle_deg.to_radians().cos();
            let interior: Box<dyn Iterator<Item = usize>> = if self.closed {
                Box::new(0..n)
            } else {
                Box::new(1..n - 1)
            };
            for i in interior {
                let prev = self.points[(i + n - 1) % n];
                let next = self.points[(i + 1) % n];
                let e0 = (self.points[i] - prev).try_normalize(f64::EPSILON);
                let e1 = (next - self.points[i]).try_normalize(f64::EPSILON);
                if let (Some(e0), Some(e1)) = (e0, e1) {
                    if e0.dot(&e1) < cos_limit {
                        breaks.push(i);
                    }
                }
            }
        }

        for p in &opts.at_points {
            let nearest = (0..n)
                .min_by(|&a, &b| {
                    (self.points[a] - p).norm().total_cmp(&(self.points[b] - p).norm())
                })
                .unwrap_or(0);
            breaks.push(nearest);
        }

        breaks.sort_unstable();
        breaks.dedup();
        breaks
    }

    /// Per-child node-index maps for a split (shared break nodes appear
    /// in both neighbors). An empty break set maps the whole curve to
    /// a single child.
    pub fn split_index_maps(&self, opts: &SplitOptions) -> Vec<Vec<usize>> {
        let n = self.points.len();
        let mut breaks = self.split_nodes(opts);
        if self.closed {
            match breaks.len() {
                0 => vec![(0..n).collect()],
                1 => {
                    // one break opens the loop into a single open child
                    // whose endpoints both sit on the break node
                    let b = breaks[0];
                    vec![(0..=n).map(|k| (b + k) % n).collect()]
                }
                _ => breaks
                    .iter()
                    .zip(breaks.iter().cycle().skip(1))
                    .map(|(&from, &to)| {
                        let span = (to + n - from) % n;
                        (0..=span).map(|k| (from + k) % n).collect()
                    })
                    .collect(),
            }
        } else {
            breaks.retain(|&b| b != 0 && b != n - 1);
            let bounds: Vec<usize> =
                std::iter::once(0).chain(breaks).chain(std::iter::once(n - 1)).collect();
            bounds
                .windows(2)
                .map(|w| (w[0]..=w[1]).collect())
                .collect()
        }
    }

    /// Split the curve at sharp kinks and requested points.
    ///
    /// Children are open curves named `<name>_<index>`,
    /// each recording this curve as its parent.
    /// With no break points the single child is a copy.
    pub fn split(&self, opts: &SplitOptions) -> Result<Vec<Curve>, CurveError> {
        let maps = self.split_index_maps(opts);
        let single_whole = maps.len() == 1 && maps[0].len() == self.points.len();
        maps.iter()
            .enumerate()
            .map(|(c, map)| {
                let points = map.iter().map(|&i| self.points[i]).collect();
                let closed = single_whole && self.closed;
                let mut child = Curve::new(format!("{}_{c:02}", self.name), points, closed)?;
                child.meta.parent_curve = Some(self.name.clone());
                child.meta.parents = self.meta.parents.clone();
                Ok(child)
            })
            .collect()
    }

    //
    // seeds
    //

    /// Forward derivative seeds, one per point.
    #[inline]
    pub fn forward_seeds(&self) -> &[Vec3] {
        &self.seeds_d
    }

    /// Overwrite the forward seeds.
    pub fn set_forward_seeds(&mut self, seeds: &[Vec3]) {
        assert_eq!(seeds.len(), self.points.len());
        self.seeds_d.copy_from_slice(seeds);
    }

    /// Reverse derivative seeds, one per point.
    #[inline]
    pub fn reverse_seeds(&self) -> &[Vec3] {
        &self.seeds_b
    }

    /// Overwrite the reverse seeds.
    pub fn set_reverse_seeds(&mut self, seeds: &[Vec3]) {
        assert_eq!(seeds.len(), self.points.len());
        self.seeds_b.copy_from_slice(seeds);
    }

    /// Add into the reverse seeds.
    pub fn add_reverse_seeds(&mut self, seeds: &[Vec3]) {
        assert_eq!(seeds.len(), self.points.len());
        for (acc, s) in self.seeds_b.iter_mut().zip(seeds) {
            *acc += s;
        }
    }

    /// Zero both seed arrays.
    pub fn clear_seeds(&mut self) {
        self.seeds_d.fill(Vec3::zeros());
        self.seeds_b.fill(Vec3::zeros());
    }
}

struct RemeshSample {
    fraction: f64,
    segment: usize,
    alpha: f64,
}

struct RemeshMap {
    samples: Vec<RemeshSample>,
    lengths: Vec<f64>,
}

pub(crate) fn chain_bars(bars: &[usize]) -> Vec<(Vec<usize>, bool)> {
    let bar_count = bars.len() / 2;
    let mut used = fb::FixedBitSet::with_capacity(bar_count);
    let mut chains = Vec::new();

    for seed in 0..bar_count {
        if used.contains(seed) {
            continue;
        }
        used.insert(seed);
        let mut chain: VecDeque<usize> = VecDeque::new();
        chain.push_back(bars[2 * seed]);
        chain.push_back(bars[2 * seed + 1]);
        let mut closed = false;

        let mut progress = true;
        while progress && !closed {
            progress = false;
            for e in 0..bar_count {
                if used.contains(e) {
                    continue;
                }
                let (u, v) = (bars[2 * e], bars[2 * e + 1]);
                let first = *chain.front().unwrap();
                let last = *chain.back().unwrap();
                // four linking cases: append/prepend, flipped or not
                if u == last {
                    chain.push_back(v);
                } else if v == last {
                    chain.push_back(u);
                } else if v == first {
                    chain.push_front(u);
                } else if u == first {
                    chain.push_front(v);
                } else {
                    continue;
                }
                used.insert(e);
                progress = true;
                if chain.len() > 2 && chain.front() == chain.back() {
                    chain.pop_back();
                    closed = true;
                }
                break;
            }
        }
        chains.push((chain.into_iter().collect(), closed));
    }
    chains
}

/// A plan for assembling several curves into one chain:
/// which curve comes in which position, whether it is flipped,
/// and whether the assembled chain closes on itself.
#[derive(Clone, Debug)]
pub struct MergePlan {
    /// (curve index, flipped) in assembly order.
    pub pieces: Vec<(usize, bool)>,
    /// Whether the assembled chain is closed.
    pub closed: bool,
}

/// Work out how `curves` connect end-to-end within `tol`.
///
/// The first curve anchors the chain; the rest attach greedily at either
/// end, flipped as needed. Fails if any curve stays unattached.
pub fn merge_plan(curves: &[&Curve], tol: f64) -> Result<MergePlan, CurveError> {
    if curves.is_empty() {
        return Err(CurveError::EmptyInput);
    }
    let ends: Vec<(Vec3, Vec3)> = curves
        .iter()
        .map(|c| (c.points[0], c.points[c.points.len() - 1]))
        .collect();

    let mut placed = fb::FixedBitSet::with_capacity(curves.len());
    placed.insert(0);
    let mut pieces: VecDeque<(usize, bool)> = VecDeque::new();
    pieces.push_back((0, false));
    let mut chain_first = ends[0].0;
    let mut chain_last = ends[0].1;

    let mut progress = true;
    while progress {
        progress = false;
        for (i, &(first, last)) in ends.iter().enumerate() {
            if placed.contains(i) {
                continue;
            }
            if (first - chain_last).norm() <= tol {
                pieces.push_back((i, false));
                chain_last = last;
            } else if (last - chain_last).norm() <= tol {
                pieces.push_back((i, true));
                chain_last = first;
            } else if (last - chain_first).norm() <= tol {
                pieces.push_front((i, false));
                chain_first = first;
            } else if (first - chain_first).norm() <= tol {
                pieces.push_front((i, true));
                chain_first = last;
            } else {
                continue;
            }
            placed.insert(i);
            progress = true;
            break;
        }
    }

    let unplaced = curves.len() - placed.count_ones(..);
    if unplaced > 0 {
        return Err(CurveError::MergeDisconnected { unplaced, total: curves.len() });
    }
    let closed = curves.len() > 1 && (chain_first - chain_last).norm() <= tol;
    Ok(MergePlan { pieces: pieces.into_iter().collect(), closed })
}

/// Concatenate end-matching curves into a single curve named `name`.
///
/// Junction nodes are kept once (the earlier piece's copy wins),
/// and a chain whose outer ends also meet becomes a closed curve.
pub fn merge(curves: &[&Curve], name: impl Into<String>, tol: f64) -> Result<Curve, CurveError> {
    let plan = merge_plan(curves, tol)?;
    let point_arrays: Vec<&[Vec3]> = curves.iter().map(|c| c.points()).collect();
    let points = gather_merged(&plan, &point_arrays);
    let mut out = Curve::new(name, points, plan.closed)?;
    // parents survive a merge when every piece agrees on them
    let first_parents = curves[0].meta.parents.clone();
    if curves.iter().all(|c| c.meta.parents == first_parents) {
        out.meta.parents = first_parents;
    }
    Ok(out)
}

/// Assemble per-node values (points or seeds) for a merged curve.
pub fn gather_merged(plan: &MergePlan, arrays: &[&[Vec3]]) -> Vec<Vec3> {
    let mut out = Vec::new();
    for (pos, &(ci, flipped)) in plan.pieces.iter().enumerate() {
        let arr = arrays[ci];
        let iter: Box<dyn Iterator<Item = &Vec3>> =
            if flipped { Box::new(arr.iter().rev()) } else { Box::new(arr.iter()) };
        // drop the junction node duplicated from the previous piece
        let skip = usize::from(pos > 0);
        out.extend(iter.skip(skip).copied());
    }
    if plan.closed {
        out.pop();
    }
    out
}

/// Adjoint of [`gather_merged`]: scatter merged-node values back
/// onto per-curve arrays, accumulating.
///
/// Junction nodes dropped during assembly (and the final node
/// of a closed chain) were never sources, so they receive nothing.
pub fn scatter_merged(plan: &MergePlan, merged: &[Vec3], arrays: &mut [Vec<Vec3>]) {
    let mut cursor = 0;
    let total = plan.pieces.len();
    for (pos, &(ci, flipped)) in plan.pieces.iter().enumerate() {
        let n = arrays[ci].len();
        let skip = usize::from(pos > 0);
        let drop_last = usize::from(plan.closed && pos == total - 1);
        for k in skip..n - drop_last {
            let node = if flipped { n - 1 - k } else { k };
            arrays[ci][node] += merged[cursor + k - skip];
        }
        cursor += n - skip - drop_last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn rv(rng: &mut StdRng) -> Vec3 {
        Vec3::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5)
    }

    /// A wiggly open polyline with uneven segment lengths.
    fn wiggle() -> Curve {
        let points = (0..7)
            .map(|i| {
                let x = 0.37 * i as f64 + 0.05 * (i as f64).sin();
                Vec3::new(x, (1.3 * x).sin() * 0.4, (0.7 * x).cos() * 0.2)
            })
            .collect();
        Curve::new("wiggle", points, false).unwrap()
    }

    /// A closed unit square in the z = 0 plane with 3 nodes per side.
    fn square() -> Curve {
        let mut points = Vec::new();
        for k in 0..3 {
            points.push(Vec3::new(k as f64 / 3.0, 0.0, 0.0));
        }
        for k in 0..3 {
            points.push(Vec3::new(1.0, k as f64 / 3.0, 0.0));
        }
        for k in 0..3 {
            points.push(Vec3::new(1.0 - k as f64 / 3.0, 1.0, 0.0));
        }
        for k in 0..3 {
            points.push(Vec3::new(0.0, 1.0 - k as f64 / 3.0, 0.0));
        }
        Curve::new("square", points, true).unwrap()
    }

    /// Scrambled bars with mixed orientations chain into one closed loop.
    #[test]
    fn chaining_links_scrambled_bars() {
        let points = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        // loop 0-1-2-3, given out of order and partly flipped
        let bars = vec![2, 1, 0, 1, 3, 0, 2, 3];
        let curves = Curve::from_bars("loop", &points, &bars).unwrap();
        assert_eq!(curves.len(), 1);
        let c = &curves[0];
        assert!(c.is_closed());
        assert_eq!(c.node_count(), 4);
        assert_abs_diff_eq!(c.arc_length(), 4.0, epsilon = 1e-12);
    }

    /// Disjoint bar groups come out as separately named open curves.
    #[test]
    fn chaining_separates_disjoint_groups() {
        let points: Vec<Vec3> = (0..6).map(|i| Vec3::new(i as f64, 0.0, 0.0)).collect();
        let bars = vec![0, 1, 1, 2, 4, 3, 4, 5];
        let curves = Curve::from_bars("seg", &points, &bars).unwrap();
        assert_eq!(curves.len(), 2);
        assert_eq!(curves[0].name(), "seg_00");
        assert_eq!(curves[1].name(), "seg_01");
        assert!(!curves[0].is_closed());
        assert_eq!(curves[0].node_count(), 3);
        assert_eq!(curves[1].node_count(), 3);
    }

    /// Points no bar references are dropped and the rest remap.
    #[test]
    fn chaining_drops_unreferenced_points() {
        let points = vec![
            Vec3::new(9.0, 9.0, 9.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(5.0, 5.0, 5.0),
            Vec3::new(2.0, 0.5, 0.0),
        ];
        // only points 1, 2, and 4 are named by a bar
        let bars = vec![2, 4, 1, 2];
        let curves = Curve::from_bars("trimmed", &points, &bars).unwrap();
        assert_eq!(curves.len(), 1);
        let c = &curves[0];
        assert_eq!(c.name(), "trimmed");
        assert!(!c.is_closed());
        assert_eq!(c.node_count(), 3);
        for (p, q) in c.points().iter().zip([points[1], points[2], points[4]].iter()) {
            assert_abs_diff_eq!(p, q, epsilon = 1e-15);
        }
    }

    /// Flipping twice restores the original ordering, seeds included.
    #[test]
    fn flip_is_involutive() {
        let mut c = wiggle();
        let mut rng = StdRng::seed_from_u64(7);
        let seeds: Vec<Vec3> = (0..c.node_count()).map(|_| rv(&mut rng)).collect();
        c.set_forward_seeds(&seeds);
        let orig = c.points().to_vec();
        c.flip();
        assert_abs_diff_eq!(c.point(0), orig[orig.len() - 1], epsilon = 1e-15);
        c.flip();
        for (p, q) in c.points().iter().zip(&orig) {
            assert_abs_diff_eq!(p, q, epsilon = 1e-15);
        }
        for (s, t) in c.forward_seeds().iter().zip(&seeds) {
            assert_abs_diff_eq!(s, t, epsilon = 1e-15);
        }
    }

    /// Linear remesh yields uniform arc-length spacing and exact endpoints.
    #[test]
    fn remesh_linear_is_uniform() {
        let c = wiggle();
        let r = c.remesh(11, Spacing::Linear).unwrap();
        assert_eq!(r.node_count(), 11);
        assert_abs_diff_eq!(r.point(0), c.point(0), epsilon = 1e-12);
        assert_abs_diff_eq!(r.point(10), c.point(c.node_count() - 1), epsilon = 1e-12);
        let cum = r.cumulative_lengths();
        let step = cum[cum.len() - 1] / 10.0;
        for w in cum.windows(2) {
            // chord lengths of a uniform arc-length sampling agree closely
            // on a gently curved polyline
            assert_abs_diff_eq!(w[1] - w[0], step, epsilon = step * 0.05);
        }
    }

    /// Cosine remesh clusters nodes towards both endpoints.
    #[test]
    fn remesh_cosine_clusters_at_ends() {
        let c = wiggle();
        let r = c.remesh(15, Spacing::Cosine).unwrap();
        let cum = r.cumulative_lengths();
        let first = cum[1] - cum[0];
        let mid = cum[7] - cum[6];
        let last = cum[14] - cum[13];
        assert!(first < 0.5 * mid);
        assert!(last < 0.5 * mid);
    }

    /// Closed remesh keeps the loop closed and node 0 in place.
    #[test]
    fn remesh_closed_keeps_loop() {
        let c = square();
        let r = c.remesh(16, Spacing::Linear).unwrap();
        assert!(r.is_closed());
        assert_eq!(r.node_count(), 16);
        assert_abs_diff_eq!(r.point(0), c.point(0), epsilon = 1e-12);
        assert_abs_diff_eq!(r.arc_length(), 4.0, epsilon = 1e-9);
    }

    /// Forward remesh derivatives match central finite differences.
    #[test]
    fn remesh_forward_matches_finite_differences() {
        let c = wiggle();
        let mut rng = StdRng::seed_from_u64(11);
        let dir: Vec<Vec3> = (0..c.node_count()).map(|_| rv(&mut rng)).collect();

        let mut cd = c.clone();
        cd.set_forward_seeds(&dir);
        let analytic = cd.remesh_d(10, Spacing::Cosine).unwrap();

        let h = 1e-6;
        let shift = |sign: f64| {
            let pts = c
                .points()
                .iter()
                .zip(&dir)
                .map(|(p, d)| p + sign * h * d)
                .collect();
            Curve::new("w", pts, false).unwrap().remesh(10, Spacing::Cosine).unwrap()
        };
        let (plus, minus) = (shift(1.0), shift(-1.0));
        for (k, a) in analytic.iter().enumerate() {
            let fd = (plus.point(k) - minus.point(k)) / (2.0 * h);
            assert_abs_diff_eq!(a, &fd, epsilon = 1e-5);
        }
    }

    /// Remesh forward and reverse maps are adjoint.
    #[test]
    fn remesh_derivatives_are_adjoint() {
        for curve in [wiggle(), square()] {
            let n_new = 10;
            let mut rng = StdRng::seed_from_u64(5);
            let xd: Vec<Vec3> = (0..curve.node_count()).map(|_| rv(&mut rng)).collect();
            let yb: Vec<Vec3> = (0..n_new).map(|_| rv(&mut rng)).collect();

            let mut c = curve;
            c.set_forward_seeds(&xd);
            let yd = c.remesh_d(n_new, Spacing::Linear).unwrap();
            c.remesh_b(n_new, Spacing::Linear, &yb).unwrap();

            let lhs: f64 = yd.iter().zip(&yb).map(|(d, b)| d.dot(b)).sum();
            let rhs: f64 = c.reverse_seeds().iter().zip(&xd).map(|(b, d)| b.dot(d)).sum();
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
        }
    }

    /// A closed square splits at its four corners.
    #[test]
    fn split_finds_square_corners() {
        let c = square();
        let children = c.split(&SplitOptions::default()).unwrap();
        assert_eq!(children.len(), 4);
        for child in &children {
            assert!(!child.is_closed());
            assert_eq!(child.node_count(), 4);
            assert_abs_diff_eq!(child.arc_length(), 1.0, epsilon = 1e-12);
            assert_eq!(child.meta().parent_curve.as_deref(), Some("square"));
        }
    }

    /// Splitting at an explicit point breaks an open curve there.
    #[test]
    fn split_at_point_breaks_open_curve() {
        let c = wiggle();
        let target = c.point(3);
        let opts = SplitOptions { angle_deg: None, at_points: vec![target] };
        let children = c.split(&opts).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].node_count(), 4);
        assert_eq!(children[1].node_count(), 4);
        assert_abs_diff_eq!(children[0].point(3), target, epsilon = 1e-15);
        assert_abs_diff_eq!(children[1].point(0), target, epsilon = 1e-15);
    }

    /// Merging the split children restores the closed square.
    #[test]
    fn merge_restores_split_square() {
        let c = square();
        let children = c.split(&SplitOptions::default()).unwrap();
        let refs: Vec<&Curve> = children.iter().collect();
        let merged = merge(&refs, "rebuilt", 1e-9).unwrap();
        assert!(merged.is_closed());
        assert_eq!(merged.node_count(), c.node_count());
        assert_abs_diff_eq!(merged.arc_length(), 4.0, epsilon = 1e-12);
    }

    /// Merge gather and scatter are adjoint index maps.
    #[test]
    fn merge_maps_are_adjoint() {
        let c = square();
        let children = c.split(&SplitOptions::default()).unwrap();
        let refs: Vec<&Curve> = children.iter().collect();
        let plan = merge_plan(&refs, 1e-9).unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        let xd: Vec<Vec<Vec3>> = children
            .iter()
            .map(|ch| (0..ch.node_count()).map(|_| rv(&mut rng)).collect())
            .collect();
        let xd_refs: Vec<&[Vec3]> = xd.iter().map(|v| v.as_slice()).collect();
        let yd = gather_merged(&plan, &xd_refs);
        let yb: Vec<Vec3> = (0..yd.len()).map(|_| rv(&mut rng)).collect();

        let mut xb: Vec<Vec<Vec3>> =
            children.iter().map(|ch| vec![Vec3::zeros(); ch.node_count()]).collect();
        scatter_merged(&plan, &yb, &mut xb);

        let lhs: f64 = yd.iter().zip(&yb).map(|(d, b)| d.dot(b)).sum();
        let rhs: f64 = xd
            .iter()
            .zip(&xb)
            .flat_map(|(ds, bs)| ds.iter().zip(bs))
            .map(|(d, b)| d.dot(b))
            .sum();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
    }

    /// Disconnected curves fail to merge with a clear error.
    #[test]
    fn merge_rejects_disconnected() {
        let a = Curve::new("a", vec![Vec3::zeros(), Vec3::x()], false).unwrap();
        let b = Curve::new("b", vec![Vec3::new(5.0, 5.0, 5.0), Vec3::new(6.0, 5.0, 5.0)], false)
            .unwrap();
        assert!(matches!(
            merge(&[&a, &b], "m", 1e-9),
            Err(CurveError::MergeDisconnected { unplaced: 1, total: 2 })
        ));
    }

    /// Projection lands on the right segment with a sensible tangent,
    /// and its derivative maps are adjoint.
    #[test]
    fn projection_and_derivatives() {
        let c = square();
        let hit = c.project(Vec3::new(0.5, -0.3, 0.4));
        assert_abs_diff_eq!(hit.point, Vec3::new(0.5, 0.0, 0.0), epsilon = 1e-12);
        assert_abs_diff_eq!(hit.tangent, Vec3::x(), epsilon = 1e-12);

        let mut rng = StdRng::seed_from_u64(17);
        let xd: Vec<Vec3> = (0..c.node_count()).map(|_| rv(&mut rng)).collect();
        let qd = rv(&mut rng);
        let pb = rv(&mut rng);

        let mut c2 = c.clone();
        c2.set_forward_seeds(&xd);
        let pd = c2.project_d(&hit, qd);

        let mut qb = Vec3::zeros();
        c2.project_b(&hit, pb, &mut qb);

        let lhs = pd.dot(&pb);
        let rhs = qb.dot(&qd)
            + c2.reverse_seeds().iter().zip(&xd).map(|(b, d)| b.dot(d)).sum::<f64>();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
    }

    /// Shifting a closed curve's start node rotates the ordering only.
    #[test]
    fn shift_end_nodes_rotates() {
        let mut c = square();
        c.shift_end_nodes(Vec3::new(1.05, 1.02, 0.0)).unwrap();
        assert_abs_diff_eq!(c.point(0), Vec3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
        assert_eq!(c.node_count(), 12);
        assert_abs_diff_eq!(c.arc_length(), 4.0, epsilon = 1e-12);

        let mut open = wiggle();
        assert!(matches!(
            open.shift_end_nodes(Vec3::zeros()),
            Err(CurveError::NotClosed(_))
        ));
    }
}
