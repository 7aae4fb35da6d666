//! `tsurf` is a triangulated-surface geometry engine
//! for building overset collar meshes:
//! surface-surface intersection curves, curve surgery
//! (remeshing, splitting, merging), hyperbolic-style surface marching,
//! and forward/reverse propagation of derivative seeds
//! through every one of those operations.
//!
//! The high-level entry point is [`Manager`],
//! which owns named surface components and curves,
//! records each geometry operation on a task tape,
//! and replays the tape to move derivative seeds
//! from component coordinates to marched-mesh coordinates and back.
//! The individual building blocks ([`TriSurface`], [`Curve`], [`Adt`],
//! the intersection and marching routines) are usable on their own.
//!
//! File I/O covers Tecplot ASCII and Plot3D out of the box;
//! CGNS (an HDF5 container format) is available behind the `cgns` feature.
//! The [`buildconf`] module renders the `config.mk` toolchain fragments
//! used by the companion compiled-solver builds.

#![warn(missing_docs)]

pub mod mesh;
#[doc(inline)]
pub use mesh::{Axis, MeshBuildError, Projection, TriSurface};

pub mod curve;
#[doc(inline)]
pub use curve::{Curve, CurveError, CurveProjection, Spacing};

pub mod adt;
#[doc(inline)]
pub use adt::Adt;

pub mod intersect;
#[doc(inline)]
pub use intersect::intersect_surfaces;

pub mod march;
#[doc(inline)]
pub use march::{Boundary, MarchError, MarchOptions, StructuredMesh};

pub mod manager;
#[doc(inline)]
pub use manager::{Manager, ManagerError, Task};

pub mod io;

pub mod buildconf;
#[doc(inline)]
pub use buildconf::{BuildProfile, Platform, ProfileError};

// nalgebra re-exports of common types for convenience

pub use nalgebra as na;
/// Type alias for a 3D `nalgebra` vector.
pub type Vec3 = na::Vector3<f64>;
/// Type alias for a 3D `nalgebra` unit vector.
pub type UnitVec3 = na::Unit<Vec3>;
