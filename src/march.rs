//! Marching of structured surface meshes outward from a seed curve
//! across a triangulated surface, in the manner of hyperbolic grid
//! generators: geometric step growth, curvature-scaled dissipation,
//! per-layer re-projection, and configurable end conditions.
//!
//! Marching records a [`MarchTape`] of frozen linearization state
//! (projection feet, smoothing weights, end-condition records)
//! so derivative seeds can be replayed forward and reverse
//! without recomputing any topology.

use itertools::izip;

use crate::{
    curve::{Curve, CurveProjection},
    mesh::{Axis, Projection, TriSurface},
    Vec3,
};

/// Error in marching or mesh merging.
#[derive(Debug, thiserror::Error)]
pub enum MarchError {
    /// Fewer than two mesh layers were requested.
    #[error("marching needs at least 2 layers, got {got}")]
    TooFewLayers {
        /// Requested layer count.
        got: usize,
    },
    /// A marching option had an unusable value.
    #[error("march option '{name}' must be {requirement}, got {got}")]
    InvalidOption {
        /// Option name.
        name: &'static str,
        /// What the option must satisfy.
        requirement: &'static str,
        /// The offending value.
        got: f64,
    },
    /// A continuous end condition was given with an open seed curve.
    #[error("periodic marching requires a closed seed curve ('{0}' is open)")]
    PeriodicNeedsClosedCurve(String),
    /// A closed seed curve was given non-continuous end conditions.
    #[error("closed seed curve '{0}' requires continuous end conditions")]
    ClosedCurveNeedsContinuous(String),
    /// An end condition or guide option referenced a curve
    /// that was not supplied.
    #[error("guide curve '{0}' was not supplied")]
    GuideCurveMissing(String),
    /// A structured mesh's point count did not fill whole layers.
    #[error("point count {len} is not a multiple of {nodes} nodes per layer")]
    RaggedMesh {
        /// Number of points given.
        len: usize,
        /// Nodes per layer.
        nodes: usize,
    },
    /// No meshes were given to merge.
    #[error("no meshes given to merge")]
    MergeEmpty,
    /// The flip list does not line up with the mesh list.
    #[error("{meshes} meshes to merge but {flips} flip flags")]
    MergeFlipCount {
        /// Number of meshes.
        meshes: usize,
        /// Number of flip flags.
        flips: usize,
    },
    /// Meshes to merge disagree on nodes per layer.
    #[error("meshes to merge need {expected} nodes per layer, got {got}")]
    MergeNodeCountMismatch {
        /// Nodes per layer of the first mesh.
        expected: usize,
        /// Nodes per layer of the offending mesh.
        got: usize,
    },
    /// Consecutive meshes do not share a junction row.
    #[error("meshes '{0}' and '{1}' do not share a junction row")]
    MergeJunctionMismatch(String, String),
}

/// End condition applied to one end of the seed curve during marching.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Boundary {
    /// Free end: the end node is pushed outward past its neighbor
    /// by `sigma_splay` each layer, letting the mesh open up.
    #[default]
    Splay,
    /// Periodic marching around a closed seed curve.
    Continuous,
    /// Freeze the end node's x coordinate (march within an x plane).
    ConstX,
    /// Freeze the end node's y coordinate.
    ConstY,
    /// Freeze the end node's z coordinate.
    ConstZ,
    /// March the end node along the named guide curve.
    Curve(String),
}

/// Options controlling [`march`].
#[derive(Clone, Debug)]
pub struct MarchOptions {
    /// Distance of the first marched layer from the seed curve.
    pub d_start: f64,
    /// Total number of mesh layers, the seed row included.
    pub num_layers: usize,
    /// Ratio between the marched extent and the seed curve's radius:
    /// the total marching distance is `radius * (extension - 1)`.
    pub extension: f64,
    /// Dissipation coefficient: smoothing strength scales with it
    /// and with the local turning angle of the front.
    pub eps_e0: f64,
    /// Dissipation bias in `[-0.5, 0]`; negative values weaken smoothing.
    pub theta: f64,
    /// Blending factor for averaging march directions with neighbors.
    pub alpha_p0: f64,
    /// Smoothing passes applied to each new layer.
    pub num_smoothing_passes: usize,
    /// Neighbor-averaging weight applied to the dissipation weights.
    pub nu_area: f64,
    /// Averaging passes applied to the dissipation weights.
    pub num_area_passes: usize,
    /// Outward push of splayed end nodes per layer.
    pub sigma_splay: f64,
    /// Allowed spread between the longest and shortest front segment
    /// before a grid-quality warning is logged.
    pub c_max: f64,
    /// Upper bound and bracket for the growth-ratio solve.
    pub ratio_guess: f64,
    /// End condition at the curve's first node.
    pub bc1: Boundary,
    /// End condition at the curve's last node.
    pub bc2: Boundary,
    /// Named curves that pin their nearest seed column:
    /// the column rides along the guide for every layer.
    pub guide_curves: Vec<String>,
}

impl Default for MarchOptions {
    fn default() -> Self {
        Self {
            d_start: 0.01,
            num_layers: 10,
            extension: 2.0,
            eps_e0: 1.0,
            theta: 0.0,
            alpha_p0: 0.25,
            num_smoothing_passes: 0,
            nu_area: 0.16,
            num_area_passes: 0,
            sigma_splay: 0.3,
            c_max: 3.0,
            ratio_guess: 20.0,
            bc1: Boundary::Splay,
            bc2: Boundary::Splay,
            guide_curves: Vec::new(),
        }
    }
}

/// A structured surface mesh of `layers x nodes` points, row-major,
/// with derivative-seed arrays parallel to the points.
/// Row 0 of a marched mesh is the seed curve.
#[derive(Clone, Debug)]
pub struct StructuredMesh {
    name: String,
    rows: usize,
    cols: usize,
    points: Vec<Vec3>,
    seeds_d: Vec<Vec3>,
    seeds_b: Vec<Vec3>,
}

impl StructuredMesh {
    /// Build a mesh from row-major points with `nodes_per_layer` columns.
    pub fn from_rows(
        name: impl Into<String>,
        nodes_per_layer: usize,
        points: Vec<Vec3>,
    ) -> Result<Self, MarchError> {
        if nodes_per_layer == 0 || points.is_empty() || points.len() % nodes_per_layer != 0 {
            return Err(MarchError::RaggedMesh { len: points.len(), nodes: nodes_per_layer });
        }
        let n = points.len();
        Ok(Self {
            name: name.into(),
            rows: n / nodes_per_layer,
            cols: nodes_per_layer,
            points,
            seeds_d: vec![Vec3::zeros(); n],
            seeds_b: vec![Vec3::zeros(); n],
        })
    }

    /// The mesh's name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of layers (rows).
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.rows
    }

    /// Number of nodes per layer (columns).
    #[inline]
    pub fn nodes_per_layer(&self) -> usize {
        self.cols
    }

    /// One point by layer and node index.
    #[inline]
    pub fn point(&self, layer: usize, node: usize) -> Vec3 {
        self.points[layer * self.cols + node]
    }

    /// All points, row-major.
    #[inline]
    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    /// The points of one layer.
    #[inline]
    pub fn row(&self, layer: usize) -> &[Vec3] {
        &self.points[layer * self.cols..(layer + 1) * self.cols]
    }

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

/// Splay blend applied to an end node before projection.
#[derive(Clone, Debug)]
struct SplayRecord {
    node: usize,
    neighbor: usize,
    sigma: f64,
}

/// Per-node constraint applied after projection.
#[derive(Clone, Debug)]
enum PostOverride {
    /// One coordinate reset to its seed value; its derivative is zero.
    Freeze { node: usize, axis: Axis },
    /// The node re-projected onto a guide curve with a frozen foot.
    Guide { node: usize, guide: usize, hit: CurveProjection },
}

/// One layer transition's frozen linearization state.
#[derive(Clone, Debug)]
struct LayerRecord {
    smooth_passes: Vec<Vec<f64>>,
    splays: Vec<SplayRecord>,
    hits: Vec<Projection>,
    post: Vec<PostOverride>,
}

/// Frozen linearization of one marching run, replayable in both
/// derivative directions. Satisfies the dot-product identity exactly.
#[derive(Clone, Debug)]
pub struct MarchTape {
    rows: usize,
    nodes: usize,
    periodic: bool,
    guide_names: Vec<String>,
    layers: Vec<LayerRecord>,
}

impl MarchTape {
    /// Number of mesh layers the tape produces.
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.rows
    }

    /// Number of nodes per layer.
    #[inline]
    pub fn nodes_per_layer(&self) -> usize {
        self.nodes
    }

    /// Names of the guide curves the replay needs, in slot order.
    #[inline]
    pub fn guide_names(&self) -> &[String] {
        &self.guide_names
    }

    /// Propagate forward seeds through the recorded march:
    /// seed-curve node seeds in, whole-mesh seeds out (row-major).
    ///
    /// The surface's own forward seeds act through the per-layer
    /// projections; `guides` must match [`guide_names`][Self::guide_names].
    pub fn forward(&self, surface: &TriSurface, guides: &[&Curve], seed_seeds: &[Vec3]) -> Vec<Vec3> {
        assert_eq!(seed_seeds.len(), self.nodes);
        assert_eq!(guides.len(), self.guide_names.len());
        let mut out = Vec::with_capacity(self.rows * self.nodes);
        let mut row_d = seed_seeds.to_vec();
        out.extend_from_slice(&row_d);
        for layer in &self.layers {
            for w in &layer.smooth_passes {
                apply_smoothing(&mut row_d, w, self.periodic);
            }
            for s in &layer.splays {
                row_d[s.node] = (1.0 + s.sigma) * row_d[s.node] - s.sigma * row_d[s.neighbor];
            }
            row_d = surface.project_d(&layer.hits, &row_d);
            for ov in &layer.post {
                match ov {
                    PostOverride::Freeze { node, axis } => row_d[*node][axis.index()] = 0.0,
                    PostOverride::Guide { node, guide, hit } => {
                        row_d[*node] = guides[*guide].project_d(hit, row_d[*node]);
                    }
                }
            }
            out.extend_from_slice(&row_d);
        }
        out
    }

    /// Propagate reverse seeds back through the recorded march:
    /// whole-mesh seeds in; returns the seed-curve node seeds and,
    /// per guide slot, the guide-curve node seeds. Surface
    /// contributions accumulate into the surface's reverse seeds.
    pub fn reverse(
        &self,
        surface: &mut TriSurface,
        guides: &[&Curve],
        mesh_seeds: &[Vec3],
    ) -> (Vec<Vec3>, Vec<Vec<Vec3>>) {
        assert_eq!(mesh_seeds.len(), self.rows * self.nodes);
        assert_eq!(guides.len(), self.guide_names.len());
        let mut guide_bars: Vec<Vec<Vec3>> =
            guides.iter().map(|g| vec![Vec3::zeros(); g.node_count()]).collect();
        let row = |r: usize| &mesh_seeds[r * self.nodes..(r + 1) * self.nodes];

        let mut carry = row(self.rows - 1).to_vec();
        for (r, layer) in self.layers.iter().enumerate().rev() {
            for ov in layer.post.iter().rev() {
                match ov {
                    PostOverride::Freeze { node, axis } => carry[*node][axis.index()] = 0.0,
                    PostOverride::Guide { node, guide, hit } => {
                        let g = guides[*guide];
                        let (i, j) = g.segment(hit.segment);
                        let u = hit.tangent;
                        let along = u * u.dot(&carry[*node]);
                        let lateral = carry[*node] - along;
                        guide_bars[*guide][i] += (1.0 - hit.t) * lateral;
                        guide_bars[*guide][j] += hit.t * lateral;
                        carry[*node] = along;
                    }
                }
            }
            let mut below = vec![Vec3::zeros(); self.nodes];
            surface.project_b(&layer.hits, &carry, &mut below);
            carry = below;
            for s in layer.splays.iter().rev() {
                let tmp = carry[s.node];
                carry[s.neighbor] -= s.sigma * tmp;
                carry[s.node] = (1.0 + s.sigma) * tmp;
            }
            for w in layer.smooth_passes.iter().rev() {
                carry = smoothing_adjoint(&carry, w, self.periodic);
            }
            for (c, b) in carry.iter_mut().zip(row(r)) {
                *c += b;
            }
        }
        (carry, guide_bars)
    }
}

/// March a structured mesh outward from `seed` across `surface`.
///
/// Each layer steps every node along the cross product of the local
/// front tangent and the surface normal, so the march side follows the
/// seed curve's orientation; flip the curve to march the other side.
/// Step sizes grow geometrically so the total marched distance is
/// `radius * (extension - 1)`, with the growth ratio solved under
/// `ratio_guess`. Every layer is re-projected onto the surface.
/// `guides` supplies the curves named by `Boundary::Curve` ends and
/// `guide_curves` entries.
///
/// Returns the mesh (row 0 is the seed curve) and the replayable
/// derivative tape.
pub fn march(
    seed: &Curve,
    surface: &TriSurface,
    options: &MarchOptions,
    guides: &[&Curve],
    name: impl Into<String>,
) -> Result<(StructuredMesh, MarchTape), MarchError> {
    if options.num_layers < 2 {
        return Err(MarchError::TooFewLayers { got: options.num_layers });
    }
    if options.d_start <= 0.0 {
        return Err(MarchError::InvalidOption {
            name: "d_start",
            requirement: "positive",
            got: options.d_start,
        });
    }
    let periodic = seed.is_closed();
    let continuous =
        options.bc1 == Boundary::Continuous || options.bc2 == Boundary::Continuous;
    if continuous && !periodic {
        return Err(MarchError::PeriodicNeedsClosedCurve(seed.name().to_string()));
    }
    if periodic
        && !(options.bc1 == Boundary::Continuous && options.bc2 == Boundary::Continuous)
    {
        return Err(MarchError::ClosedCurveNeedsContinuous(seed.name().to_string()));
    }

    let n = seed.node_count();
    let mut guide_names: Vec<String> = Vec::new();
    let mut guide_refs: Vec<&Curve> = Vec::new();

    // (column, guide slot) pairs pinned to a guide curve
    let mut guided: Vec<(usize, usize)> = Vec::new();
    if let Boundary::Curve(gname) = &options.bc1 {
        guided.push((0, resolve_guide(gname, guides, &mut guide_names, &mut guide_refs)?));
    }
    if let Boundary::Curve(gname) = &options.bc2 {
        guided.push((n - 1, resolve_guide(gname, guides, &mut guide_names, &mut guide_refs)?));
    }
    for gname in &options.guide_curves {
        let slot = resolve_guide(gname, guides, &mut guide_names, &mut guide_refs)?;
        let col = (0..n)
            .min_by(|&a, &b| {
                let da = guide_refs[slot].project(seed.point(a)).distance;
                let db = guide_refs[slot].project(seed.point(b)).distance;
                da.total_cmp(&db)
            })
            .unwrap_or(0);
        if !guided.iter().any(|&(c, _)| c == col) {
            guided.push((col, slot));
        }
    }

    // end columns with a frozen coordinate
    let mut frozen: Vec<(usize, Axis)> = Vec::new();
    for (node, bc) in [(0, &options.bc1), (n - 1, &options.bc2)] {
        match bc {
            Boundary::ConstX => frozen.push((node, Axis::X)),
            Boundary::ConstY => frozen.push((node, Axis::Y)),
            Boundary::ConstZ => frozen.push((node, Axis::Z)),
            _ => {}
        }
    }
    let frozen_values: Vec<f64> =
        frozen.iter().map(|&(node, axis)| seed.point(node)[axis.index()]).collect();

    // splayed end columns with their interior neighbors
    let mut splays: Vec<(usize, usize)> = Vec::new();
    if !periodic {
        if options.bc1 == Boundary::Splay {
            splays.push((0, 1));
        }
        if options.bc2 == Boundary::Splay {
            splays.push((n - 1, n - 2));
        }
    }

    let centroid = seed.points().iter().fold(Vec3::zeros(), |acc, p| acc + p) / n as f64;
    let radius = seed.points().iter().map(|p| (p - centroid).norm()).fold(0.0, f64::max);
    let d_max = radius * (options.extension - 1.0);
    if d_max <= options.d_start {
        return Err(MarchError::InvalidOption {
            name: "extension",
            requirement: "large enough for the marched distance to exceed d_start",
            got: options.extension,
        });
    }

    let m = options.num_layers - 1;
    let ratio = growth_ratio(d_max / options.d_start, m, options.ratio_guess);
    let steps: Vec<f64> = (0..m).map(|k| options.d_start * ratio.powi(k as i32)).collect();
    log::debug!(
        "marching '{}' on '{}': {} layers, growth ratio {:.4}",
        seed.name(),
        surface.name(),
        options.num_layers,
        ratio,
    );

    let mut points: Vec<Vec3> = Vec::with_capacity(options.num_layers * n);
    let mut row: Vec<Vec3> = seed.points().to_vec();
    let mut hits = surface.project(&row);
    points.extend_from_slice(&row);
    let mut layers = Vec::with_capacity(m);

    for (l, &step) in steps.iter().enumerate() {
        let dirs = march_directions(&row, &hits, periodic, options.alpha_p0);
        let mut next: Vec<Vec3> = izip!(&row, &dirs).map(|(x, d)| x + step * d).collect();

        let mut smooth_passes = Vec::with_capacity(options.num_smoothing_passes);
        for _ in 0..options.num_smoothing_passes {
            let w = smoothing_weights(&next, periodic, options);
            apply_smoothing(&mut next, &w, periodic);
            smooth_passes.push(w);
        }

        let mut splay_records = Vec::with_capacity(splays.len());
        for &(node, neighbor) in &splays {
            let sigma = options.sigma_splay;
            next[node] = (1.0 + sigma) * next[node] - sigma * next[neighbor];
            splay_records.push(SplayRecord { node, neighbor, sigma });
        }

        let new_hits = surface.project(&next);
        for (p, hit) in next.iter_mut().zip(&new_hits) {
            *p = hit.point;
        }

        let mut post = Vec::with_capacity(frozen.len() + guided.len());
        for (&(node, axis), &value) in frozen.iter().zip(&frozen_values) {
            next[node][axis.index()] = value;
            post.push(PostOverride::Freeze { node, axis });
        }
        for &(node, slot) in &guided {
            let hit = guide_refs[slot].project(next[node]);
            next[node] = hit.point;
            post.push(PostOverride::Guide { node, guide: slot, hit });
        }

        let spread = front_spread(&next, periodic);
        if spread > options.c_max {
            log::warn!(
                "front spacing spread {spread:.2} exceeds c_max {} at layer {}",
                options.c_max,
                l + 1,
            );
        }

        layers.push(LayerRecord {
            smooth_passes,
            splays: splay_records,
            hits: new_hits.clone(),
            post,
        });
        points.extend_from_slice(&next);
        row = next;
        hits = new_hits;
    }

    let mesh = StructuredMesh::from_rows(name, n, points)?;
    let tape = MarchTape {
        rows: options.num_layers,
        nodes: n,
        periodic,
        guide_names,
        layers,
    };
    Ok((mesh, tape))
}

fn resolve_guide<'g>(
    name: &str,
    guides: &[&'g Curve],
    names: &mut Vec<String>,
    refs: &mut Vec<&'g Curve>,
) -> Result<usize, MarchError> {
    if let Some(slot) = names.iter().position(|n| n == name) {
        return Ok(slot);
    }
    let curve = *guides
        .iter()
        .find(|g| g.name() == name)
        .ok_or_else(|| MarchError::GuideCurveMissing(name.to_string()))?;
    names.push(name.to_string());
    refs.push(curve);
    Ok(names.len() - 1)
}

/// Interior neighbor pair of a node, or `None` at open ends.
fn side_neighbors(j: usize, n: usize, periodic: bool) -> Option<(usize, usize)> {
    if periodic {
        Some(((j + n - 1) % n, (j + 1) % n))
    } else if j == 0 || j == n - 1 {
        None
    } else {
        Some((j - 1, j + 1))
    }
}

fn central_tangent(row: &[Vec3], j: usize, periodic: bool) -> Vec3 {
    let n = row.len();
    let (a, b) = match side_neighbors(j, n, periodic) {
        Some(pair) => pair,
        // one-sided differences at open ends
        None if j == 0 => (0, 1),
        None => (n - 2, n - 1),
    };
    (row[b] - row[a]).try_normalize(f64::EPSILON).unwrap_or_else(Vec3::zeros)
}

/// March direction per node: front tangent cross surface normal,
/// optionally blended with neighboring directions by `alpha_p0`.
fn march_directions(row: &[Vec3], hits: &[Projection], periodic: bool, alpha_p0: f64) -> Vec<Vec3> {
    let n = row.len();
    let mut dirs: Vec<Vec3> = (0..n)
        .map(|j| {
            let t = central_tangent(row, j, periodic);
            t.cross(&hits[j].normal)
                .try_normalize(f64::EPSILON)
                .unwrap_or_else(Vec3::zeros)
        })
        .collect();
    if alpha_p0 > 0.0 {
        let raw = dirs.clone();
        for j in 0..n {
            let Some((a, b)) = side_neighbors(j, n, periodic) else { continue };
            let blended = (1.0 - alpha_p0) * raw[j] + 0.5 * alpha_p0 * (raw[a] + raw[b]);
            dirs[j] = blended.try_normalize(f64::EPSILON).unwrap_or(raw[j]);
        }
    }
    dirs
}

/// Ratio of the longest to the shortest front segment,
/// infinite when a segment has collapsed.
fn front_spread(row: &[Vec3], periodic: bool) -> f64 {
    let n = row.len();
    let count = if periodic { n } else { n - 1 };
    let mut lo = f64::INFINITY;
    let mut hi: f64 = 0.0;
    for s in 0..count {
        let len = (row[(s + 1) % n] - row[s]).norm();
        lo = lo.min(len);
        hi = hi.max(len);
    }
    if lo > 0.0 {
        hi / lo
    } else {
        f64::INFINITY
    }
}

/// Smoothing weight per node: dissipation follows the turning angle
/// of the front, scaled by `eps_e0` and biased by `theta`,
/// then averaged across neighbors `num_area_passes` times.
fn smoothing_weights(row: &[Vec3], periodic: bool, options: &MarchOptions) -> Vec<f64> {
    let n = row.len();
    let scale = options.eps_e0 * (1.0 + options.theta);
    let mut w: Vec<f64> = (0..n)
        .map(|j| {
            let Some((a, b)) = side_neighbors(j, n, periodic) else { return 0.0 };
            let e0 = (row[j] - row[a]).try_normalize(f64::EPSILON);
            let e1 = (row[b] - row[j]).try_normalize(f64::EPSILON);
            match (e0, e1) {
                (Some(e0), Some(e1)) => (scale * 0.5 * (1.0 - e0.dot(&e1))).min(0.49),
                _ => 0.0,
            }
        })
        .collect();
    for _ in 0..options.num_area_passes {
        let prev = w.clone();
        for j in 0..n {
            let Some((a, b)) = side_neighbors(j, n, periodic) else { continue };
            w[j] = (1.0 - options.nu_area) * prev[j]
                + 0.5 * options.nu_area * (prev[a] + prev[b]);
        }
    }
    w
}

fn apply_smoothing(row: &mut [Vec3], weights: &[f64], periodic: bool) {
    let prev = row.to_vec();
    for j in 0..row.len() {
        let w = weights[j];
        if w == 0.0 {
            continue;
        }
        let Some((a, b)) = side_neighbors(j, row.len(), periodic) else { continue };
        row[j] = (1.0 - w) * prev[j] + 0.5 * w * (prev[a] + prev[b]);
    }
}

fn smoothing_adjoint(bar: &[Vec3], weights: &[f64], periodic: bool) -> Vec<Vec3> {
    let n = bar.len();
    let mut out = vec![Vec3::zeros(); n];
    for j in 0..n {
        let w = weights[j];
        match if w == 0.0 { None } else { side_neighbors(j, n, periodic) } {
            Some((a, b)) => {
                out[j] += (1.0 - w) * bar[j];
                out[a] += 0.5 * w * bar[j];
                out[b] += 0.5 * w * bar[j];
            }
            None => out[j] += bar[j],
        }
    }
    out
}

fn geometric_sum(ratio: f64, terms: usize) -> f64 {
    if (ratio - 1.0).abs() < 1e-12 {
        terms as f64
    } else {
        (ratio.powi(terms as i32) - 1.0) / (ratio - 1.0)
    }
}

/// Growth ratio whose geometric step sum (in units of the first step)
/// meets `target`, bisected within `(0, ratio_guess]`.
fn growth_ratio(target: f64, terms: usize, ratio_guess: f64) -> f64 {
    if terms <= 1 {
        return 1.0;
    }
    if geometric_sum(ratio_guess, terms) < target {
        log::warn!(
            "growth ratio clamped to {ratio_guess}: extension distance unreachable in {terms} steps"
        );
        return ratio_guess;
    }
    let (mut lo, mut hi) = (1e-6, ratio_guess);
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if geometric_sum(mid, terms) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// How several structured meshes stack into one block:
/// a frozen source index per merged node.
#[derive(Clone, Debug)]
pub struct MeshMergePlan {
    rows: usize,
    nodes: usize,
    /// merged flat index -> (mesh index, flat index in that mesh)
    sources: Vec<(usize, usize)>,
}

impl MeshMergePlan {
    /// Rows of the merged block.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Nodes per row of the merged block.
    #[inline]
    pub fn nodes(&self) -> usize {
        self.nodes
    }
}

/// Work out how `meshes` stack into one block along shared rows.
///
/// `flips[k]` reverses mesh k's layer order before stacking. Each mesh
/// after the first must start with the row the stack currently ends on
/// (directly or with its columns reversed; the match is detected within
/// `tol`); that duplicate junction row is dropped.
pub fn mesh_merge_plan(
    meshes: &[&StructuredMesh],
    flips: &[bool],
    tol: f64,
) -> Result<MeshMergePlan, MarchError> {
    if meshes.is_empty() {
        return Err(MarchError::MergeEmpty);
    }
    if flips.len() != meshes.len() {
        return Err(MarchError::MergeFlipCount { meshes: meshes.len(), flips: flips.len() });
    }
    let nodes = meshes[0].nodes_per_layer();
    for m in meshes {
        if m.nodes_per_layer() != nodes {
            return Err(MarchError::MergeNodeCountMismatch {
                expected: nodes,
                got: m.nodes_per_layer(),
            });
        }
    }

    let mut sources: Vec<(usize, usize)> = Vec::new();
    let mut rows = 0;
    for (k, (mesh, &flip)) in meshes.iter().zip(flips).enumerate() {
        let layer_order: Vec<usize> = if flip {
            (0..mesh.layer_count()).rev().collect()
        } else {
            (0..mesh.layer_count()).collect()
        };
        let col_rev = if k == 0 {
            false
        } else {
            let junction = &sources[sources.len() - nodes..];
            let first = layer_order[0];
            let matches = |rev: bool| {
                (0..nodes).all(|c| {
                    let (pm, pk) = junction[c];
                    let col = if rev { nodes - 1 - c } else { c };
                    (meshes[pm].points()[pk] - mesh.point(first, col)).norm() <= tol
                })
            };
            if matches(false) {
                false
            } else if matches(true) {
                true
            } else {
                return Err(MarchError::MergeJunctionMismatch(
                    meshes[k - 1].name().to_string(),
                    mesh.name().to_string(),
                ));
            }
        };
        let skip = usize::from(k > 0);
        for &layer in layer_order.iter().skip(skip) {
            for c in 0..nodes {
                let col = if col_rev { nodes - 1 - c } else { c };
                sources.push((k, layer * nodes + col));
            }
            rows += 1;
        }
    }
    Ok(MeshMergePlan { rows, nodes, sources })
}

/// Assemble per-node values (points or seeds) for a merged block.
pub fn gather_mesh(plan: &MeshMergePlan, arrays: &[&[Vec3]]) -> Vec<Vec3> {
    plan.sources.iter().map(|&(m, k)| arrays[m][k]).collect()
}

/// Adjoint of [`gather_mesh`]: scatter merged-node values back onto
/// per-mesh arrays, accumulating. Junction rows dropped during
/// assembly were never sources, so they receive nothing.
pub fn scatter_mesh(plan: &MeshMergePlan, merged: &[Vec3], arrays: &mut [Vec<Vec3>]) {
    assert_eq!(merged.len(), plan.sources.len());
    for (&(m, k), v) in plan.sources.iter().zip(merged) {
        arrays[m][k] += v;
    }
}

/// Stack end-sharing structured meshes into a single block named `name`.
pub fn merge_meshes(
    meshes: &[&StructuredMesh],
    flips: &[bool],
    name: impl Into<String>,
    tol: f64,
) -> Result<StructuredMesh, MarchError> {
    let plan = mesh_merge_plan(meshes, flips, tol)?;
    let arrays: Vec<&[Vec3]> = meshes.iter().map(|m| m.points()).collect();
    let points = gather_mesh(&plan, &arrays);
    StructuredMesh::from_rows(name, plan.nodes, points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{tiny_plate, unit_cube};
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn rv(rng: &mut StdRng) -> Vec3 {
        Vec3::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5)
    }

    /// A straight 11-node seed line lying on the plate.
    fn seed_line() -> Curve {
        let pts = (0..11).map(|i| Vec3::new(-0.5 + 0.1 * i as f64, -0.4, 0.0)).collect();
        Curve::new("seam", pts, false).unwrap()
    }

    fn line_options() -> MarchOptions {
        MarchOptions {
            d_start: 0.01,
            num_layers: 9,
            extension: 1.4,
            alpha_p0: 0.0,
            sigma_splay: 0.1,
            ..MarchOptions::default()
        }
    }

    /// The cube's cross-section ring at z = 0.2, three nodes per side,
    /// ordered counterclockwise seen from above.
    fn collar_ring() -> Curve {
        let side = [-0.5, -1.0 / 6.0, 1.0 / 6.0];
        let mut pts = Vec::new();
        for &x in &side {
            pts.push(Vec3::new(x, -0.5, 0.2));
        }
        for &y in &side {
            pts.push(Vec3::new(0.5, y, 0.2));
        }
        for &x in &side {
            pts.push(Vec3::new(-x, 0.5, 0.2));
        }
        for &y in &side {
            pts.push(Vec3::new(-0.5, -y, 0.2));
        }
        Curve::new("ring", pts, true).unwrap()
    }

    fn ring_options() -> MarchOptions {
        MarchOptions {
            d_start: 0.01,
            num_layers: 8,
            extension: 1.2,
            bc1: Boundary::Continuous,
            bc2: Boundary::Continuous,
            ..MarchOptions::default()
        }
    }

    /// A straight seed on a flat plate marches sideways in exact
    /// geometric steps, and splayed ends open outward.
    #[test]
    fn plate_march_is_exact() {
        let plate = tiny_plate();
        let seed = seed_line();
        let opts = line_options();
        let (mesh, _) = march(&seed, &plate, &opts, &[], "sheet").unwrap();
        assert_eq!(mesh.layer_count(), 9);
        assert_eq!(mesh.nodes_per_layer(), 11);

        // every layer stays on the plate at a single y
        let mut gaps = Vec::new();
        for r in 0..9 {
            let y = mesh.point(r, 0).y;
            for c in 0..11 {
                let p = mesh.point(r, c);
                assert_abs_diff_eq!(p.z, 0.0, epsilon = 1e-10);
                assert_abs_diff_eq!(p.y, y, epsilon = 1e-9);
            }
            gaps.push((y - -0.4).abs());
        }
        for w in gaps.windows(2) {
            assert!(w[1] > w[0]);
        }
        // total distance honors the extension: radius 0.5, d_max 0.2
        assert_abs_diff_eq!(gaps[8], 0.2, epsilon = 1e-6);

        // interior columns march straight; splayed ends drift outward
        for c in 1..10 {
            for r in 0..9 {
                assert_abs_diff_eq!(mesh.point(r, c).x, seed.point(c).x, epsilon = 1e-10);
            }
        }
        for r in 1..9 {
            assert!(mesh.point(r, 0).x < mesh.point(r - 1, 0).x);
            assert!(mesh.point(r, 10).x > mesh.point(r - 1, 10).x);
        }
        assert!(mesh.point(8, 0).x < -0.5 - 1e-3);
    }

    /// A closed ring on the cube's sides marches straight down the
    /// walls: horizontal tangents cross horizontal face normals give
    /// an exactly vertical direction at every node, corners included.
    #[test]
    fn cube_ring_march_is_exact() {
        let cube = unit_cube();
        let ring = collar_ring();
        let (mesh, _) = march(&ring, &cube, &ring_options(), &[], "side0").unwrap();
        assert_eq!(mesh.layer_count(), 8);
        assert_eq!(mesh.nodes_per_layer(), 12);

        let d_max = (0.5_f64.powi(2) * 2.0).sqrt() * 0.2;
        for c in 0..12 {
            let s = ring.point(c);
            for r in 0..8 {
                let p = mesh.point(r, c);
                assert_abs_diff_eq!(p.x, s.x, epsilon = 1e-9);
                assert_abs_diff_eq!(p.y, s.y, epsilon = 1e-9);
                assert_abs_diff_eq!(p.x.abs().max(p.y.abs()), 0.5, epsilon = 1e-9);
                assert_abs_diff_eq!(p.z, mesh.point(r, 0).z, epsilon = 1e-9);
                if r > 0 {
                    assert!(p.z < mesh.point(r - 1, c).z);
                }
            }
        }
        assert_abs_diff_eq!(mesh.point(7, 0).z, 0.2 - d_max, epsilon = 1e-6);
    }

    /// End-condition and option validation rejects bad setups.
    #[test]
    fn march_validation_errors() {
        let plate = tiny_plate();
        let cube = unit_cube();
        let open = seed_line();
        let ring = collar_ring();

        let continuous = MarchOptions {
            bc1: Boundary::Continuous,
            bc2: Boundary::Continuous,
            ..line_options()
        };
        assert!(matches!(
            march(&open, &plate, &continuous, &[], "m"),
            Err(MarchError::PeriodicNeedsClosedCurve(_))
        ));
        assert!(matches!(
            march(&ring, &cube, &line_options(), &[], "m"),
            Err(MarchError::ClosedCurveNeedsContinuous(_))
        ));
        let flat = MarchOptions { extension: 1.0, ..ring_options() };
        assert!(matches!(
            march(&ring, &cube, &flat, &[], "m"),
            Err(MarchError::InvalidOption { name: "extension", .. })
        ));
        let guided = MarchOptions {
            bc2: Boundary::Curve("missing".into()),
            ..line_options()
        };
        assert!(matches!(
            march(&open, &plate, &guided, &[], "m"),
            Err(MarchError::GuideCurveMissing(_))
        ));
    }

    /// Tape forward and reverse replays satisfy the dot-product
    /// identity across projection and smoothing.
    #[test]
    fn march_tape_derivatives_are_adjoint() {
        let ring = collar_ring();
        let mut cube = unit_cube();
        let opts = MarchOptions {
            num_smoothing_passes: 2,
            eps_e0: 5.0,
            num_area_passes: 2,
            ..ring_options()
        };
        let (mesh, tape) = march(&ring, &cube, &opts, &[], "side0").unwrap();

        let mut rng = StdRng::seed_from_u64(29);
        let surf_d: Vec<Vec3> = (0..cube.vertex_count()).map(|_| rv(&mut rng)).collect();
        let seed_d: Vec<Vec3> = (0..ring.node_count()).map(|_| rv(&mut rng)).collect();
        let mesh_b: Vec<Vec3> = (0..mesh.points().len()).map(|_| rv(&mut rng)).collect();

        cube.set_forward_seeds(&surf_d);
        let mesh_d = tape.forward(&cube, &[], &seed_d);
        let (seed_b, guide_b) = tape.reverse(&mut cube, &[], &mesh_b);
        assert!(guide_b.is_empty());

        let lhs: f64 = mesh_d.iter().zip(&mesh_b).map(|(d, b)| d.dot(b)).sum();
        let rhs: f64 = cube
            .reverse_seeds()
            .iter()
            .zip(&surf_d)
            .map(|(b, d)| b.dot(d))
            .sum::<f64>()
            + seed_b.iter().zip(&seed_d).map(|(b, d)| b.dot(d)).sum::<f64>();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-10);
    }

    /// A guided end column rides its rail, and the guide contribution
    /// closes the dot-product identity.
    #[test]
    fn guided_march_follows_rail_and_is_adjoint() {
        let mut plate = tiny_plate();
        let seed = seed_line();
        let mut rail = Curve::new(
            "rail",
            vec![Vec3::new(0.5, -1.0, 0.0), Vec3::new(0.5, 1.0, 0.0)],
            false,
        )
        .unwrap();
        let opts = MarchOptions {
            bc2: Boundary::Curve("rail".into()),
            num_smoothing_passes: 1,
            eps_e0: 2.0,
            ..line_options()
        };
        let (mesh, tape) = march(&seed, &plate, &opts, &[&rail], "sheet").unwrap();
        assert_eq!(tape.guide_names(), ["rail"]);
        for r in 0..mesh.layer_count() {
            let p = mesh.point(r, 10);
            assert_abs_diff_eq!(p.x, 0.5, epsilon = 1e-12);
            assert_abs_diff_eq!(p.z, 0.0, epsilon = 1e-12);
        }

        let mut rng = StdRng::seed_from_u64(31);
        let surf_d: Vec<Vec3> = (0..plate.vertex_count()).map(|_| rv(&mut rng)).collect();
        let seed_d: Vec<Vec3> = (0..seed.node_count()).map(|_| rv(&mut rng)).collect();
        let rail_d: Vec<Vec3> = (0..rail.node_count()).map(|_| rv(&mut rng)).collect();
        let mesh_b: Vec<Vec3> = (0..mesh.points().len()).map(|_| rv(&mut rng)).collect();

        plate.set_forward_seeds(&surf_d);
        rail.set_forward_seeds(&rail_d);
        let mesh_d = tape.forward(&plate, &[&rail], &seed_d);
        let (seed_b, guide_b) = tape.reverse(&mut plate, &[&rail], &mesh_b);

        let lhs: f64 = mesh_d.iter().zip(&mesh_b).map(|(d, b)| d.dot(b)).sum();
        let rhs: f64 = plate
            .reverse_seeds()
            .iter()
            .zip(&surf_d)
            .map(|(b, d)| b.dot(d))
            .sum::<f64>()
            + seed_b.iter().zip(&seed_d).map(|(b, d)| b.dot(d)).sum::<f64>()
            + guide_b[0].iter().zip(&rail_d).map(|(b, d)| b.dot(d)).sum::<f64>();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-10);
    }

    /// Two halves marched from the same ring stitch into one block
    /// whose columns stay put and whose layers run monotonically.
    #[test]
    fn collar_halves_merge_into_one_block() {
        let cube = unit_cube();
        let ring = collar_ring();
        let (down, _) = march(&ring, &cube, &ring_options(), &[], "side0").unwrap();
        let mut flipped = ring.clone();
        flipped.flip();
        let (up, _) = march(&flipped, &cube, &ring_options(), &[], "side1").unwrap();

        let merged = merge_meshes(&[&down, &up], &[true, false], "collar", 1e-9).unwrap();
        assert_eq!(merged.layer_count(), 15);
        assert_eq!(merged.nodes_per_layer(), 12);
        for c in 0..12 {
            let base = merged.point(0, c);
            for r in 1..15 {
                let p = merged.point(r, c);
                assert_abs_diff_eq!(p.x, base.x, epsilon = 1e-9);
                assert_abs_diff_eq!(p.y, base.y, epsilon = 1e-9);
                assert!(p.z > merged.point(r - 1, c).z);
            }
        }

        // meshes that share no row refuse to merge
        assert!(matches!(
            merge_meshes(&[&down, &down], &[false, false], "bad", 1e-9),
            Err(MarchError::MergeJunctionMismatch(_, _))
        ));
    }

    /// Mesh gather and scatter are adjoint index maps.
    #[test]
    fn merge_maps_are_adjoint() {
        let cube = unit_cube();
        let ring = collar_ring();
        let (down, _) = march(&ring, &cube, &ring_options(), &[], "side0").unwrap();
        let mut flipped = ring.clone();
        flipped.flip();
        let (up, _) = march(&flipped, &cube, &ring_options(), &[], "side1").unwrap();
        let plan = mesh_merge_plan(&[&down, &up], &[true, false], 1e-9).unwrap();

        let mut rng = StdRng::seed_from_u64(37);
        let xd: Vec<Vec<Vec3>> = [&down, &up]
            .iter()
            .map(|m| (0..m.points().len()).map(|_| rv(&mut rng)).collect())
            .collect();
        let xd_refs: Vec<&[Vec3]> = xd.iter().map(|v| v.as_slice()).collect();
        let yd = gather_mesh(&plan, &xd_refs);
        let yb: Vec<Vec3> = (0..yd.len()).map(|_| rv(&mut rng)).collect();

        let mut xb: Vec<Vec<Vec3>> =
            [&down, &up].iter().map(|m| vec![Vec3::zeros(); m.points().len()]).collect();
        scatter_mesh(&plan, &yb, &mut xb);

        let lhs: f64 = yd.iter().zip(&yb).map(|(d, b)| d.dot(b)).sum();
        let rhs: f64 = xd
            .iter()
            .zip(&xb)
            .flat_map(|(ds, bs)| ds.iter().zip(bs))
            .map(|(d, b)| d.dot(b))
            .sum();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
    }

    /// Ragged point arrays are rejected at construction.
    #[test]
    fn ragged_mesh_is_rejected() {
        assert!(matches!(
            StructuredMesh::from_rows("m", 5, vec![Vec3::zeros(); 7]),
            Err(MarchError::RaggedMesh { len: 7, nodes: 5 })
        ));
    }
}
