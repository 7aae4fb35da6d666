//! Registry and task tape driving the collar-mesh workflow.
//!
//! A [`Manager`] owns named surface components, the curves cut or
//! derived from them, and the structured meshes marched off those
//! curves. Every geometry-producing operation appends a [`Task`] to a
//! tape holding the frozen provenance the operation's linearization
//! needs. [`forward_ad`][Manager::forward_ad] and
//! [`reverse_ad`][Manager::reverse_ad] replay that tape without
//! recomputing any topology, so derivative seeds flow from component
//! vertices to mesh nodes (and back) through an arbitrary chain of
//! intersections, curve surgery, and marching, and the dot-product
//! identity holds across the whole chain.
//!
//! A rebuild recipe can be registered to rerun the recorded
//! construction after component coordinates move, regenerating every
//! derived object under the same names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{
    curve::{self, Curve, CurveError, MergePlan, Spacing, SplitOptions},
    intersect::{
        intersect_with_provenance, intersection_seeds_b, intersection_seeds_d, CrossingRecord,
    },
    io::{
        plot3d::{self, Plot3dError},
        tecplot::{self, TecplotError},
    },
    march::{
        gather_mesh, march, mesh_merge_plan, scatter_mesh, Boundary, MarchError, MarchOptions,
        MarchTape, StructuredMesh,
    },
    mesh::TriSurface,
    Vec3,
};

/// Tolerance for matching point-set queries to surface points.
const POINT_MATCH_TOL: f64 = 1e-10;
/// Tolerance for matching shared seed rows when stitching collar halves.
const JUNCTION_TOL: f64 = 1e-10;

/// Error from a [`Manager`] operation.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// No component is registered under the given name.
    #[error("no component named '{0}' is registered")]
    UnknownComponent(String),
    /// No curve is registered under the given name.
    #[error("no curve named '{0}' is registered")]
    UnknownCurve(String),
    /// No mesh (collar half or merged block) is registered under the given name.
    #[error("no mesh named '{0}' is registered")]
    UnknownMesh(String),
    /// The name is already taken in the target registry.
    #[error("an object named '{0}' is already registered")]
    DuplicateName(String),
    /// The curve was not produced by an intersection, so marching
    /// cannot tell which surfaces its collar halves belong to.
    #[error("curve '{0}' has no recorded parent surfaces to march on")]
    MissingParents(String),
    /// A point-set query point matched no surface point closely enough.
    #[error("point {index} of set '{set}' is {distance:.3e} away from the nearest surface point")]
    PointSetMismatch {
        /// Name of the point set being added.
        set: String,
        /// Index of the offending query point.
        index: usize,
        /// Distance to the nearest surface point.
        distance: f64,
    },
    /// No point set is registered under the given name.
    #[error("no point set named '{0}' is registered")]
    UnknownPointSet(String),
    /// A seed array does not cover the concatenated surface points.
    #[error("expected {expected} surface seeds, got {got}")]
    SeedCountMismatch {
        /// Concatenated surface point count.
        expected: usize,
        /// Length of the supplied seed array.
        got: usize,
    },
    /// [`rebuild`][Manager::rebuild] was called without a recipe.
    #[error("no rebuild recipe is set")]
    NoRecipe,
    /// A curve operation failed.
    #[error(transparent)]
    Curve(#[from] CurveError),
    /// A marching or mesh-merging operation failed.
    #[error(transparent)]
    March(#[from] MarchError),
    /// A Tecplot export failed.
    #[error(transparent)]
    Tecplot(#[from] TecplotError),
    /// A Plot3D export failed.
    #[error(transparent)]
    Plot3d(#[from] Plot3dError),
}

/// One recorded geometry-producing operation, carrying the names and
/// frozen provenance its derivative replay needs.
#[derive(Clone, Debug)]
pub enum Task {
    /// Two components were intersected into curves.
    Intersect {
        /// First component name.
        first: String,
        /// Second component name.
        second: String,
        /// Chaining tolerance the intersection ran with.
        dist_tol: f64,
        /// Names of the curves produced, in discovery order.
        curves: Vec<String>,
        /// Per-curve, per-node crossing records.
        provenance: Vec<Vec<CrossingRecord>>,
    },
    /// A curve was resampled along its arc length.
    RemeshCurve {
        /// Source curve name.
        source: String,
        /// Result curve name.
        result: String,
        /// Node count of the result.
        nodes: usize,
        /// Spacing law of the result.
        spacing: Spacing,
    },
    /// A curve was split at sharp kinks or requested points.
    SplitCurve {
        /// Source curve name.
        source: String,
        /// Names of the pieces.
        pieces: Vec<String>,
        /// Per-piece indices into the source curve's nodes.
        maps: Vec<Vec<usize>>,
    },
    /// Several curves were chained into one.
    MergeCurves {
        /// Source curve names.
        sources: Vec<String>,
        /// Result curve name.
        result: String,
        /// Frozen assembly plan.
        plan: MergePlan,
    },
    /// A closed curve's node ordering was rotated.
    ShiftEnds {
        /// The rotated curve's name.
        curve: String,
        /// How far the old ordering was rotated left.
        offset: usize,
    },
    /// One collar half was marched from a seed curve over a surface.
    MarchMesh {
        /// Seed curve name.
        seed: String,
        /// Surface component marched over.
        surface: String,
        /// Name of the resulting mesh.
        mesh: String,
        /// Whether the seed curve was flipped for this side.
        flipped: bool,
        /// Frozen linearization of the march.
        tape: MarchTape,
    },
    /// Collar halves were stitched into one block.
    MergeMeshes {
        /// Source mesh names.
        sources: Vec<String>,
        /// Name of the merged block.
        result: String,
        /// Frozen node-source plan.
        plan: MeshMergePlan,
    },
}

use crate::march::MeshMergePlan;

/// A recorded construction procedure for [`Manager::rebuild`].
pub type Recipe = Box<dyn Fn(&mut Manager) -> Result<(), ManagerError>>;

/// A name-to-object map that iterates in insertion order.
struct Registry<T> {
    order: Vec<String>,
    items: HashMap<String, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { order: Vec::new(), items: HashMap::new() }
    }
}

impl<T> Registry<T> {
    fn insert(&mut self, name: String, item: T) {
        debug_assert!(!self.items.contains_key(&name));
        self.order.push(name.clone());
        self.items.insert(name, item);
    }

    fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&T> {
        self.items.get(name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.items.get_mut(name)
    }

    fn remove(&mut self, name: &str) -> Option<T> {
        let item = self.items.remove(name)?;
        self.order.retain(|n| n != name);
        Some(item)
    }

    /// Take an item out while keeping its registry slot, so a second
    /// item can be borrowed mutably at the same time.
    fn take(&mut self, name: &str) -> Option<T> {
        self.items.remove(name)
    }

    /// Undo a [`take`][Self::take].
    fn put_back(&mut self, name: &str, item: T) {
        self.items.insert(name.to_string(), item);
    }

    fn names(&self) -> &[String] {
        &self.order
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &T)> + '_ {
        self.order.iter().map(|n| (n.as_str(), &self.items[n.as_str()]))
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.items.values_mut()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.items.clear();
    }
}

/// Insertion-ordered registries of components, curves, and meshes,
/// plus the task tape their derivative replay runs on.
#[derive(Default)]
pub struct Manager {
    components: Registry<TriSurface>,
    curves: Registry<Curve>,
    meshes: Registry<StructuredMesh>,
    merged: Registry<StructuredMesh>,
    tape: Vec<Task>,
    point_sets: HashMap<String, Vec<usize>>,
    recipe: Option<Recipe>,
}

impl Manager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    //
    // registries
    //

    /// Register a surface component under its own name.
    pub fn add_component(&mut self, surface: TriSurface) -> Result<(), ManagerError> {
        let name = surface.name().to_string();
        if self.components.contains(&name) {
            return Err(ManagerError::DuplicateName(name));
        }
        log::debug!(
            "registered component '{name}' ({} vertices, {} faces)",
            surface.vertex_count(),
            surface.face_count(),
        );
        self.components.insert(name, surface);
        Ok(())
    }

    /// Register a curve under its own name.
    pub fn add_curve(&mut self, curve: Curve) -> Result<(), ManagerError> {
        let name = curve.name().to_string();
        if self.curves.contains(&name) {
            return Err(ManagerError::DuplicateName(name));
        }
        log::debug!("registered curve '{name}' ({} nodes)", curve.node_count());
        self.curves.insert(name, curve);
        Ok(())
    }

    /// Remove and return a component.
    pub fn remove_component(&mut self, name: &str) -> Result<TriSurface, ManagerError> {
        self.components
            .remove(name)
            .ok_or_else(|| ManagerError::UnknownComponent(name.to_string()))
    }

    /// Remove and return a curve.
    pub fn remove_curve(&mut self, name: &str) -> Result<Curve, ManagerError> {
        self.curves.remove(name).ok_or_else(|| ManagerError::UnknownCurve(name.to_string()))
    }

    /// Remove and return a mesh, collar half or merged block.
    pub fn remove_mesh(&mut self, name: &str) -> Result<StructuredMesh, ManagerError> {
        self.meshes
            .remove(name)
            .or_else(|| self.merged.remove(name))
            .ok_or_else(|| ManagerError::UnknownMesh(name.to_string()))
    }

    /// Drop every registered object, point set, and the task tape.
    /// The rebuild recipe is kept.
    pub fn clear_all(&mut self) {
        self.components.clear();
        self.curves.clear();
        self.meshes.clear();
        self.merged.clear();
        self.tape.clear();
        self.point_sets.clear();
        log::debug!("cleared all registries and the task tape");
    }

    /// Zero the derivative seeds of every registered object.
    pub fn clear_seeds(&mut self) {
        for s in self.components.values_mut() {
            s.clear_seeds();
        }
        for c in self.curves.values_mut() {
            c.clear_seeds();
        }
        for m in self.meshes.values_mut() {
            m.clear_seeds();
        }
        for m in self.merged.values_mut() {
            m.clear_seeds();
        }
    }

    /// A component by name.
    pub fn component(&self, name: &str) -> Result<&TriSurface, ManagerError> {
        self.components.get(name).ok_or_else(|| ManagerError::UnknownComponent(name.to_string()))
    }

    /// A component by name, mutably.
    pub fn component_mut(&mut self, name: &str) -> Result<&mut TriSurface, ManagerError> {
        self.components
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownComponent(name.to_string()))
    }

    /// A curve by name.
    pub fn curve(&self, name: &str) -> Result<&Curve, ManagerError> {
        self.curves.get(name).ok_or_else(|| ManagerError::UnknownCurve(name.to_string()))
    }

    /// A curve by name, mutably.
    pub fn curve_mut(&mut self, name: &str) -> Result<&mut Curve, ManagerError> {
        self.curves.get_mut(name).ok_or_else(|| ManagerError::UnknownCurve(name.to_string()))
    }

    /// A mesh by name, collar half or merged block.
    pub fn mesh(&self, name: &str) -> Result<&StructuredMesh, ManagerError> {
        self.meshes
            .get(name)
            .or_else(|| self.merged.get(name))
            .ok_or_else(|| ManagerError::UnknownMesh(name.to_string()))
    }

    /// A mesh by name, mutably.
    pub fn mesh_mut(&mut self, name: &str) -> Result<&mut StructuredMesh, ManagerError> {
        if self.meshes.contains(name) {
            return Ok(self.meshes.get_mut(name).unwrap_or_else(|| unreachable!()));
        }
        self.merged.get_mut(name).ok_or_else(|| ManagerError::UnknownMesh(name.to_string()))
    }

    /// Component names in insertion order.
    pub fn component_names(&self) -> &[String] {
        self.components.names()
    }

    /// Curve names in insertion order.
    pub fn curve_names(&self) -> &[String] {
        self.curves.names()
    }

    /// Collar-half mesh names in insertion order.
    pub fn mesh_names(&self) -> &[String] {
        self.meshes.names()
    }

    /// Merged-block names in insertion order.
    pub fn merged_names(&self) -> &[String] {
        self.merged.names()
    }

    /// The recorded task tape.
    pub fn tape(&self) -> &[Task] {
        &self.tape
    }

    //
    // construction operations
    //

    /// Intersect every pair of registered components and store the
    /// resulting curves. Returns the new curve names.
    pub fn intersect(&mut self, dist_tol: f64) -> Result<Vec<String>, ManagerError> {
        let names = self.components.names().to_vec();
        let mut created = Vec::new();
        for i in 0..names.len() {
            for j in (i + 1)..names.len() {
                created.extend(self.intersect_pair(&names[i], &names[j], dist_tol)?);
            }
        }
        Ok(created)
    }

    /// Intersect one named pair of components.
    ///
    /// Curves are stored as `int_<first>_<second>_<index>` with their
    /// parent components recorded, and the crossing provenance goes on
    /// the tape for derivative replay.
    pub fn intersect_pair(
        &mut self,
        first: &str,
        second: &str,
        dist_tol: f64,
    ) -> Result<Vec<String>, ManagerError> {
        let s1 = self.component(first)?;
        let s2 = self.component(second)?;
        let found = intersect_with_provenance(s1, s2, dist_tol)?;
        if found.is_empty() {
            log::warn!("'{first}' and '{second}' do not intersect");
            return Ok(Vec::new());
        }
        log::info!(
            "intersection of '{first}' and '{second}' produced {} curve(s)",
            found.len(),
        );

        // name and check the whole batch before registering any of it
        let mut curve_names = Vec::with_capacity(found.len());
        let mut provenance = Vec::with_capacity(found.len());
        let mut staged = Vec::with_capacity(found.len());
        for (idx, (mut curve, prov)) in found.into_iter().enumerate() {
            curve.set_name(format!("int_{first}_{second}_{idx:02}"));
            let name = curve.name().to_string();
            if self.curves.contains(&name) {
                return Err(ManagerError::DuplicateName(name));
            }
            curve_names.push(name);
            provenance.push(prov);
            staged.push(curve);
        }
        for (name, curve) in curve_names.iter().zip(staged) {
            self.curves.insert(name.clone(), curve);
        }
        self.tape.push(Task::Intersect {
            first: first.to_string(),
            second: second.to_string(),
            dist_tol,
            curves: curve_names.clone(),
            provenance,
        });
        Ok(curve_names)
    }

    /// Resample a curve along its arc length, storing the result as
    /// `<source>_remeshed`. Returns the new name.
    pub fn remesh_curve(
        &mut self,
        source: &str,
        n_new_nodes: usize,
        spacing: Spacing,
    ) -> Result<String, ManagerError> {
        let remeshed = self.curve(source)?.remesh(n_new_nodes, spacing)?;
        let result = remeshed.name().to_string();
        if self.curves.contains(&result) {
            return Err(ManagerError::DuplicateName(result));
        }
        self.curves.insert(result.clone(), remeshed);
        self.tape.push(Task::RemeshCurve {
            source: source.to_string(),
            result: result.clone(),
            nodes: n_new_nodes,
            spacing,
        });
        log::debug!("remeshed '{source}' into '{result}' ({n_new_nodes} nodes)");
        Ok(result)
    }

    /// Split a curve at sharp kinks and requested points, storing the
    /// pieces as `<source>_<index>`. Returns the piece names.
    pub fn split_curve(
        &mut self,
        source: &str,
        opts: &SplitOptions,
    ) -> Result<Vec<String>, ManagerError> {
        let src = self.curve(source)?;
        let maps = src.split_index_maps(opts);
        let children = src.split(opts)?;
        let pieces: Vec<String> = children.iter().map(|c| c.name().to_string()).collect();
        for name in &pieces {
            if self.curves.contains(name) {
                return Err(ManagerError::DuplicateName(name.clone()));
            }
        }
        for child in children {
            let name = child.name().to_string();
            self.curves.insert(name, child);
        }
        self.tape.push(Task::SplitCurve {
            source: source.to_string(),
            pieces: pieces.clone(),
            maps,
        });
        log::debug!("split '{source}' into {} piece(s)", pieces.len());
        Ok(pieces)
    }

    /// Chain end-matching curves into one stored under `result`.
    pub fn merge_curves(
        &mut self,
        sources: &[&str],
        result: impl Into<String>,
        tol: f64,
    ) -> Result<(), ManagerError> {
        let result = result.into();
        if self.curves.contains(&result) {
            return Err(ManagerError::DuplicateName(result));
        }
        let refs: Vec<&Curve> =
            sources.iter().map(|n| self.curve(n)).collect::<Result<_, _>>()?;
        let plan = curve::merge_plan(&refs, tol)?;
        let mut merged = curve::merge(&refs, result.clone(), tol)?;
        merged.meta_mut().parent_curve = Some(sources[0].to_string());
        self.curves.insert(result.clone(), merged);
        self.tape.push(Task::MergeCurves {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            result: result.clone(),
            plan,
        });
        log::debug!("merged {} curve(s) into '{result}'", sources.len());
        Ok(())
    }

    /// Rotate a closed curve's node ordering to start nearest
    /// `start_point`, recording the rotation for derivative replay.
    pub fn shift_end_nodes(
        &mut self,
        curve: &str,
        start_point: Vec3,
    ) -> Result<(), ManagerError> {
        let offset = self.curve_mut(curve)?.shift_end_nodes(start_point)?;
        self.tape.push(Task::ShiftEnds { curve: curve.to_string(), offset });
        Ok(())
    }

    /// March both collar halves off an intersection curve.
    ///
    /// Side 0 marches over the curve's first parent surface as the
    /// curve stands; side 1 flips the seed curve and marches over the
    /// second parent (the flip is recorded on the tape, and the stored
    /// curve keeps its original orientation). The meshes are stored as
    /// `<base_name>_00` and `<base_name>_01`, and those names are
    /// returned.
    pub fn march_mesh(
        &mut self,
        curve: &str,
        options_side0: &MarchOptions,
        options_side1: &MarchOptions,
        base_name: &str,
    ) -> Result<[String; 2], ManagerError> {
        let parents = self
            .curve(curve)?
            .meta()
            .parents
            .clone()
            .ok_or_else(|| ManagerError::MissingParents(curve.to_string()))?;
        let mesh_names = [format!("{base_name}_00"), format!("{base_name}_01")];
        for n in &mesh_names {
            if self.meshes.contains(n) || self.merged.contains(n) {
                return Err(ManagerError::DuplicateName(n.clone()));
            }
        }
        // both sides' lookups happen before the side-1 flip, so an
        // error cannot leave the stored curve reversed
        for parent in &parents {
            if !self.components.contains(parent) {
                return Err(ManagerError::UnknownComponent(parent.clone()));
            }
        }
        for options in [options_side0, options_side1] {
            for name in guide_names_of(options) {
                if !self.curves.contains(&name) {
                    return Err(ManagerError::UnknownCurve(name));
                }
            }
        }

        for (side, options) in [(0, options_side0), (1, options_side1)] {
            if side == 1 {
                self.curve_mut(curve)?.flip();
            }
            let surf = self.component(&parents[side])?;
            let seed = self.curve(curve)?;
            let gnames = guide_names_of(options);
            let pool = &self.curves;
            let guides: Vec<&Curve> = gnames
                .iter()
                .map(|n| pool.get(n).ok_or_else(|| ManagerError::UnknownCurve(n.clone())))
                .collect::<Result<_, _>>()?;
            let marched = march(seed, surf, options, &guides, mesh_names[side].clone());
            if side == 1 {
                self.curve_mut(curve)?.flip();
            }
            let (mesh, tape) = marched?;
            self.meshes.insert(mesh_names[side].clone(), mesh);
            self.curve_mut(curve)?.meta_mut().child_meshes.push(mesh_names[side].clone());
            self.tape.push(Task::MarchMesh {
                seed: curve.to_string(),
                surface: parents[side].clone(),
                mesh: mesh_names[side].clone(),
                flipped: side == 1,
                tape,
            });
        }
        log::info!(
            "marched collar halves '{}' and '{}' from '{curve}'",
            mesh_names[0],
            mesh_names[1],
        );
        Ok(mesh_names)
    }

    /// Stitch collar halves into one block stored under `result`,
    /// flipping the meshes `flips` marks so the shared seed row sits
    /// at the junction.
    pub fn merge_meshes(
        &mut self,
        sources: &[&str],
        flips: &[bool],
        result: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let result = result.into();
        if self.meshes.contains(&result) || self.merged.contains(&result) {
            return Err(ManagerError::DuplicateName(result));
        }
        let refs: Vec<&StructuredMesh> = sources
            .iter()
            .map(|n| {
                self.meshes.get(n).ok_or_else(|| ManagerError::UnknownMesh((*n).to_string()))
            })
            .collect::<Result<_, _>>()?;
        let plan = mesh_merge_plan(&refs, flips, JUNCTION_TOL)?;
        let arrays: Vec<&[Vec3]> = refs.iter().map(|m| m.points()).collect();
        let points = gather_mesh(&plan, &arrays);
        let block = StructuredMesh::from_rows(result.clone(), plan.nodes(), points)?;
        log::info!(
            "merged {} meshes into '{result}' ({} x {})",
            sources.len(),
            block.layer_count(),
            block.nodes_per_layer(),
        );
        self.merged.insert(result.clone(), block);
        self.tape.push(Task::MergeMeshes {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            result,
            plan,
        });
        Ok(())
    }

    //
    // derivative replay
    //

    /// Replay the tape in order, propagating forward seeds from
    /// component vertices (and hand-added curves) down to every
    /// derived curve and mesh.
    pub fn forward_ad(&mut self) -> Result<(), ManagerError> {
        let tasks = std::mem::take(&mut self.tape);
        log::debug!("forward derivative replay over {} task(s)", tasks.len());
        let result = self.forward_replay(&tasks);
        self.tape = tasks;
        result
    }

    /// Replay the tape backwards, accumulating reverse seeds from
    /// meshes and derived curves back onto their inputs.
    pub fn reverse_ad(&mut self) -> Result<(), ManagerError> {
        let tasks = std::mem::take(&mut self.tape);
        log::debug!("reverse derivative replay over {} task(s)", tasks.len());
        let result = self.reverse_replay(&tasks);
        self.tape = tasks;
        result
    }

    fn forward_replay(&mut self, tasks: &[Task]) -> Result<(), ManagerError> {
        for task in tasks {
            match task {
                Task::Intersect { first, second, curves, provenance, .. } => {
                    let s1 = self.component(first)?;
                    let s2 = self.component(second)?;
                    let seeds: Vec<Vec<Vec3>> =
                        provenance.iter().map(|prov| intersection_seeds_d(prov, s1, s2)).collect();
                    for (name, s) in curves.iter().zip(seeds) {
                        self.curve_mut(name)?.set_forward_seeds(&s);
                    }
                }
                Task::RemeshCurve { source, result, nodes, spacing } => {
                    let seeds = self.curve(source)?.remesh_d(*nodes, *spacing)?;
                    self.curve_mut(result)?.set_forward_seeds(&seeds);
                }
                Task::SplitCurve { source, pieces, maps } => {
                    let src_seeds = self.curve(source)?.forward_seeds().to_vec();
                    for (piece, map) in pieces.iter().zip(maps) {
                        let seeds: Vec<Vec3> = map.iter().map(|&i| src_seeds[i]).collect();
                        self.curve_mut(piece)?.set_forward_seeds(&seeds);
                    }
                }
                Task::MergeCurves { sources, result, plan } => {
                    let arrays: Vec<&[Vec3]> = sources
                        .iter()
                        .map(|n| self.curve(n).map(|c| c.forward_seeds()))
                        .collect::<Result<_, _>>()?;
                    let seeds = curve::gather_merged(plan, &arrays);
                    self.curve_mut(result)?.set_forward_seeds(&seeds);
                }
                Task::ShiftEnds { curve, offset } => {
                    let c = self.curve_mut(curve)?;
                    let mut seeds = c.forward_seeds().to_vec();
                    seeds.rotate_left(*offset);
                    c.set_forward_seeds(&seeds);
                }
                Task::MarchMesh { seed, surface, mesh, flipped, tape } => {
                    let mut seed_seeds = self.curve(seed)?.forward_seeds().to_vec();
                    if *flipped {
                        seed_seeds.reverse();
                    }
                    let surf = self.component(surface)?;
                    let pool = &self.curves;
                    let guides: Vec<&Curve> = tape
                        .guide_names()
                        .iter()
                        .map(|n| {
                            pool.get(n).ok_or_else(|| ManagerError::UnknownCurve(n.clone()))
                        })
                        .collect::<Result<_, _>>()?;
                    let mesh_seeds = tape.forward(surf, &guides, &seed_seeds);
                    self.meshes
                        .get_mut(mesh)
                        .ok_or_else(|| ManagerError::UnknownMesh(mesh.clone()))?
                        .set_forward_seeds(&mesh_seeds);
                }
                Task::MergeMeshes { sources, result, plan } => {
                    let arrays: Vec<&[Vec3]> = sources
                        .iter()
                        .map(|n| {
                            self.meshes
                                .get(n)
                                .map(|m| m.forward_seeds())
                                .ok_or_else(|| ManagerError::UnknownMesh(n.clone()))
                        })
                        .collect::<Result<_, _>>()?;
                    let seeds = gather_mesh(plan, &arrays);
                    self.merged
                        .get_mut(result)
                        .ok_or_else(|| ManagerError::UnknownMesh(result.clone()))?
                        .set_forward_seeds(&seeds);
                }
            }
        }
        Ok(())
    }

    fn reverse_replay(&mut self, tasks: &[Task]) -> Result<(), ManagerError> {
        for task in tasks.iter().rev() {
            match task {
                Task::Intersect { first, second, curves, provenance, .. } => {
                    let bars: Vec<Vec<Vec3>> = curves
                        .iter()
                        .map(|n| self.curve(n).map(|c| c.reverse_seeds().to_vec()))
                        .collect::<Result<_, _>>()?;
                    let mut s1 = self
                        .components
                        .take(first)
                        .ok_or_else(|| ManagerError::UnknownComponent(first.clone()))?;
                    let Some(s2) = self.components.get_mut(second) else {
                        self.components.put_back(first, s1);
                        return Err(ManagerError::UnknownComponent(second.clone()));
                    };
                    for (prov, b) in provenance.iter().zip(&bars) {
                        intersection_seeds_b(prov, &mut s1, s2, b);
                    }
                    self.components.put_back(first, s1);
                }
                Task::RemeshCurve { source, result, nodes, spacing } => {
                    let bars = self.curve(result)?.reverse_seeds().to_vec();
                    self.curve_mut(source)?.remesh_b(*nodes, *spacing, &bars)?;
                }
                Task::SplitCurve { source, pieces, maps } => {
                    let n = self.curve(source)?.node_count();
                    let mut delta = vec![Vec3::zeros(); n];
                    for (piece, map) in pieces.iter().zip(maps) {
                        let bars = self.curve(piece)?.reverse_seeds().to_vec();
                        for (k, &i) in map.iter().enumerate() {
                            delta[i] += bars[k];
                        }
                    }
                    self.curve_mut(source)?.add_reverse_seeds(&delta);
                }
                Task::MergeCurves { sources, result, plan } => {
                    let merged_bars = self.curve(result)?.reverse_seeds().to_vec();
                    let mut arrays: Vec<Vec<Vec3>> = sources
                        .iter()
                        .map(|n| self.curve(n).map(|c| vec![Vec3::zeros(); c.node_count()]))
                        .collect::<Result<_, _>>()?;
                    curve::scatter_merged(plan, &merged_bars, &mut arrays);
                    for (n, a) in sources.iter().zip(&arrays) {
                        self.curve_mut(n)?.add_reverse_seeds(a);
                    }
                }
                Task::ShiftEnds { curve, offset } => {
                    let c = self.curve_mut(curve)?;
                    let mut bars = c.reverse_seeds().to_vec();
                    bars.rotate_right(*offset);
                    c.set_reverse_seeds(&bars);
                }
                Task::MarchMesh { seed, surface, mesh, flipped, tape } => {
                    let mesh_bars = self.mesh(mesh)?.reverse_seeds().to_vec();
                    let surf = self
                        .components
                        .get_mut(surface)
                        .ok_or_else(|| ManagerError::UnknownComponent(surface.clone()))?;
                    let pool = &self.curves;
                    let guides: Vec<&Curve> = tape
                        .guide_names()
                        .iter()
                        .map(|n| {
                            pool.get(n).ok_or_else(|| ManagerError::UnknownCurve(n.clone()))
                        })
                        .collect::<Result<_, _>>()?;
                    let (mut seed_bars, guide_bars) = tape.reverse(surf, &guides, &mesh_bars);
                    if *flipped {
                        seed_bars.reverse();
                    }
                    self.curve_mut(seed)?.add_reverse_seeds(&seed_bars);
                    for (gname, gb) in tape.guide_names().iter().zip(&guide_bars) {
                        self.curve_mut(gname)?.add_reverse_seeds(gb);
                    }
                }
                Task::MergeMeshes { sources, result, plan } => {
                    let merged_bars = self.mesh(result)?.reverse_seeds().to_vec();
                    let mut arrays: Vec<Vec<Vec3>> = sources
                        .iter()
                        .map(|n| self.mesh(n).map(|m| vec![Vec3::zeros(); m.points().len()]))
                        .collect::<Result<_, _>>()?;
                    scatter_mesh(plan, &merged_bars, &mut arrays);
                    for (n, a) in sources.iter().zip(&arrays) {
                        self.mesh_mut(n)?.add_reverse_seeds(a);
                    }
                }
            }
        }
        Ok(())
    }

    //
    // surface-point interface
    //

    /// Component vertices followed by curve nodes,
    /// both in registry insertion order.
    pub fn surface_points(&self) -> Vec<Vec3> {
        let mut out = Vec::with_capacity(self.surface_point_count());
        for (_, s) in self.components.iter() {
            out.extend_from_slice(s.vertices());
        }
        for (_, c) in self.curves.iter() {
            out.extend_from_slice(c.points());
        }
        out
    }

    /// Number of concatenated surface points.
    pub fn surface_point_count(&self) -> usize {
        let verts: usize = self.components.iter().map(|(_, s)| s.vertex_count()).sum();
        let nodes: usize = self.curves.iter().map(|(_, c)| c.node_count()).sum();
        verts + nodes
    }

    /// Forward seeds concatenated like [`surface_points`][Self::surface_points].
    pub fn surface_forward_seeds(&self) -> Vec<Vec3> {
        let mut out = Vec::with_capacity(self.surface_point_count());
        for (_, s) in self.components.iter() {
            out.extend_from_slice(s.forward_seeds());
        }
        for (_, c) in self.curves.iter() {
            out.extend_from_slice(c.forward_seeds());
        }
        out
    }

    /// Distribute a concatenated reverse-seed array onto the
    /// registered components and curves.
    pub fn set_surface_reverse_seeds(&mut self, seeds: &[Vec3]) -> Result<(), ManagerError> {
        let expected = self.surface_point_count();
        if seeds.len() != expected {
            return Err(ManagerError::SeedCountMismatch { expected, got: seeds.len() });
        }
        let mut cursor = 0;
        let names = self.components.names().to_vec();
        for name in &names {
            let s = self.component_mut(name)?;
            let n = s.vertex_count();
            s.set_reverse_seeds(&seeds[cursor..cursor + n]);
            cursor += n;
        }
        let names = self.curves.names().to_vec();
        for name in &names {
            let c = self.curve_mut(name)?;
            let n = c.node_count();
            c.set_reverse_seeds(&seeds[cursor..cursor + n]);
            cursor += n;
        }
        Ok(())
    }

    /// Register a named point set: every query point must coincide
    /// with a surface point within `1e-10`, and the matched global
    /// indices are stored.
    pub fn add_point_set(
        &mut self,
        points: &[Vec3],
        name: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let name = name.into();
        if self.point_sets.contains_key(&name) {
            return Err(ManagerError::DuplicateName(name));
        }
        let pool = self.surface_points();
        let mut indices = Vec::with_capacity(points.len());
        for (k, q) in points.iter().enumerate() {
            let (best, dist) = pool
                .iter()
                .enumerate()
                .map(|(i, p)| (i, (p - q).norm()))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .ok_or_else(|| ManagerError::PointSetMismatch {
                    set: name.clone(),
                    index: k,
                    distance: f64::INFINITY,
                })?;
            if dist > POINT_MATCH_TOL {
                return Err(ManagerError::PointSetMismatch {
                    set: name.clone(),
                    index: k,
                    distance: dist,
                });
            }
            indices.push(best);
        }
        log::debug!("point set '{name}' matched {} point(s)", indices.len());
        self.point_sets.insert(name, indices);
        Ok(())
    }

    /// The stored global indices of a point set.
    pub fn point_set(&self, name: &str) -> Result<&[usize], ManagerError> {
        self.point_sets
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ManagerError::UnknownPointSet(name.to_string()))
    }

    /// Current coordinates of a point set's points.
    pub fn point_set_points(&self, name: &str) -> Result<Vec<Vec3>, ManagerError> {
        let indices = self.point_set(name)?;
        let pool = self.surface_points();
        Ok(indices.iter().map(|&i| pool[i]).collect())
    }

    //
    // rebuild
    //

    /// Register the construction procedure [`rebuild`][Self::rebuild] reruns.
    pub fn set_recipe(
        &mut self,
        recipe: impl Fn(&mut Manager) -> Result<(), ManagerError> + 'static,
    ) {
        self.recipe = Some(Box::new(recipe));
    }

    /// Drop every object the tape derived and rerun the recipe.
    ///
    /// Components (and hand-added curves) survive, so moving their
    /// coordinates and rebuilding regenerates every intersection
    /// curve and mesh under the same names. Point sets are kept: the
    /// rerun construction reproduces the same point layout.
    pub fn rebuild(&mut self) -> Result<(), ManagerError> {
        let recipe = self.recipe.take().ok_or(ManagerError::NoRecipe)?;
        let tasks = std::mem::take(&mut self.tape);
        for task in &tasks {
            match task {
                Task::Intersect { curves, .. } => {
                    for n in curves {
                        self.curves.remove(n);
                    }
                }
                Task::RemeshCurve { result, .. } | Task::MergeCurves { result, .. } => {
                    self.curves.remove(result);
                }
                Task::SplitCurve { pieces, .. } => {
                    for n in pieces {
                        self.curves.remove(n);
                    }
                }
                Task::ShiftEnds { .. } => {}
                Task::MarchMesh { mesh, .. } => {
                    self.meshes.remove(mesh);
                }
                Task::MergeMeshes { result, .. } => {
                    self.merged.remove(result);
                }
            }
        }
        log::info!("rebuilding: dropped {} recorded task(s), rerunning recipe", tasks.len());
        let result = recipe(self);
        self.recipe = Some(recipe);
        result
    }

    //
    // exports
    //

    /// Write every component, curve, and mesh as Tecplot ASCII files
    /// named `<tag>_<index>_<name>.plt` under `dir`.
    /// Returns the written paths.
    pub fn export_tecplot(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, ManagerError> {
        let dir = dir.as_ref();
        let mut written = Vec::new();
        for (idx, (name, surf)) in self.components.iter().enumerate() {
            let path = dir.join(format!("surf_{idx:02}_{name}.plt"));
            tecplot::save_surface(&path, surf)?;
            written.push(path);
        }
        for (idx, (name, c)) in self.curves.iter().enumerate() {
            let path = dir.join(format!("curve_{idx:02}_{name}.plt"));
            tecplot::save_curves(&path, &[c])?;
            written.push(path);
        }
        let mut idx = 0;
        for registry in [&self.meshes, &self.merged] {
            for (name, m) in registry.iter() {
                let path = dir.join(format!("mesh_{idx:02}_{name}.plt"));
                tecplot::save_structured(&path, m)?;
                written.push(path);
                idx += 1;
            }
        }
        log::info!("wrote {} Tecplot file(s) under '{}'", written.len(), dir.display());
        Ok(written)
    }

    /// Write every mesh as a Plot3D file named
    /// `mesh_<index>_<name>.xyz` under `dir`. Returns the written paths.
    pub fn export_plot3d(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, ManagerError> {
        let dir = dir.as_ref();
        let mut written = Vec::new();
        let mut idx = 0;
        for registry in [&self.meshes, &self.merged] {
            for (name, m) in registry.iter() {
                let path = dir.join(format!("mesh_{idx:02}_{name}.xyz"));
                plot3d::save_meshes(&path, &[m])?;
                written.push(path);
                idx += 1;
            }
        }
        log::info!("wrote {} Plot3D file(s) under '{}'", written.len(), dir.display());
        Ok(written)
    }
}

/// Every guide-curve name an option set references,
/// boundary conditions included, without duplicates.
fn guide_names_of(options: &MarchOptions) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for bc in [&options.bc1, &options.bc2] {
        if let Boundary::Curve(g) = bc {
            if !names.contains(g) {
                names.push(g.clone());
            }
        }
    }
    for g in &options.guide_curves {
        if !names.contains(g) {
            names.push(g.clone());
        }
    }
    names
}
