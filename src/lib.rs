#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-redistribute
//!
//! mesh-redistribute partitions an unstructured mesh spatially across a fixed
//! set of cooperating workers and moves every cell to the worker owning the
//! region its centroid falls in, optionally with ghost layers from the
//! neighbouring regions.
//!
//! ## Features
//! - Distributed k-d partition tree built with a parallel Floyd–Rivest
//!   selector; no worker ever gathers the centroids
//! - Contiguous, round-robin or user-defined region → worker assignment
//! - Cell exchange with duplicate point and cell elimination on merge
//! - Process-wide point and cell ids reconciled through region owners
//! - Ghost halos grown one level at a time
//! - Clipping of boundary cells to a worker's region box
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## SPMD
//!
//! Every worker runs the same code. All collective entry points
//! ([`Redistributor::run`](crate::redistribute::Redistributor::run),
//! [`PartitionTreeBuilder::build`](crate::partitioning::PartitionTreeBuilder::build),
//! [`exchange`](crate::redistribute::exchange::exchange), ...) must be
//! called by every worker in the same order. A failure on one worker is
//! voted and returned as an `Err` on all of them.
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! mesh-redistribute = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ```no_run
//! use mesh_redistribute::prelude::*;
//!
//! let comms = RayonComm::world(2);
//! std::thread::scope(|s| {
//!     for comm in &comms {
//!         s.spawn(move || {
//!             let mesh = UnstructuredMesh::new(); // this worker's share
//!             let mut r = Redistributor::new(RedistributeConfig {
//!                 ghost_level: 1,
//!                 ..Default::default()
//!             });
//!             r.run(comm, &mesh)
//!         });
//!     }
//! });
//! ```

pub mod algs;
pub mod data;
pub mod geometry;
pub mod mesh_error;
pub mod partitioning;
pub mod redistribute;
pub mod topology;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{CommTag, Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::exchange::TransferStrategy;
    pub use crate::data::attributes::{
        DataArray, GHOST_LEVEL, GLOBAL_CELL_ID, GLOBAL_POINT_ID, INSIDE_REGION,
    };
    pub use crate::data::merge::{MeshMerger, PointMatch};
    pub use crate::data::mesh::UnstructuredMesh;
    pub use crate::geometry::bounds::Bounds;
    pub use crate::geometry::clip::{BoxClipper, CellClipper};
    pub use crate::mesh_error::MeshError;
    pub use crate::partitioning::{
        ArrayRanges, AssignmentPolicy, PartitionConfig, PartitionTree, PartitionTreeBuilder,
        RegionOwnership,
    };
    pub use crate::redistribute::{
        BoundaryPolicy, RedistributeConfig, RedistributeOutput, Redistributor,
    };
    pub use crate::topology::cell_type::CellType;
}
