//! Static traffic assignment by path-based gradient projection.
//!
//! This crate computes the user-equilibrium distribution of OD demand over the
//! paths of a congested road network. It offers tools to
//!
//! - build validated networks with BPR or linear link costs (`network` module),
//! - drive an equilibration algorithm to a termination state (`solving` module),
//! - evaluate the Beckmann objective and the relative gap (`evaluation` module),
//! - equilibrate one class by gradient projection with lazy column generation
//!   (`gradient_projection` module) or several classes with their own toll
//!   perception (`multiclass` module).
//!
//! Shortest paths in the gap evaluation run in parallel over origins; everything
//! else is a single-threaded, cooperative loop that can be interrupted through an
//! [`AbortHandle`].
//!
//! # Quick start
//!
//! ```no_run
//! use tapgp::network::{Link, NetworkBuilder};
//! use tapgp::options::SolverConfig;
//! use tapgp::{GradientProjection, Solver, TerminationState};
//!
//! let network = NetworkBuilder::new(3)
//!     .link(Link::new(0, 1, 4.0, 200.0))
//!     .link(Link::new(1, 2, 4.0, 200.0))
//!     .link(Link::new(0, 2, 10.0, 300.0))
//!     .demand(0, 2, 400.0)
//!     .build()
//!     .expect("validated network");
//!
//! let config = SolverConfig::default().with_convergence(1e-6);
//! let mut solver = Solver::new(network, config, GradientProjection::new());
//! let state = solver.solve().expect("configuration accepted");
//!
//! assert_eq!(state, TerminationState::AccuracyReached);
//! println!("gap {:.2e} after {} iterations", solver.relative_gap(), solver.iteration());
//! ```
//!
//! Input parsing and report rendering are left to callers; [`Solver::report`]
//! returns a serializable snapshot.

pub mod error;
pub mod evaluation;
pub mod gradient_projection;
pub mod history;
pub mod multiclass;
pub mod network;
pub mod options;
pub mod paths;
pub mod report;
pub mod shortest_path;
pub mod solving;
pub mod synthetic;

pub use error::{Result, TapError};
pub use gradient_projection::{GradientProjection, ShiftStatistics};
pub use multiclass::{ClassDemand, MultiClassGradientProjection, TrafficClass};
pub use network::{Link, Network, NetworkBuilder};
pub use options::{GradientProjectionOptions, LinkCostType, SolverConfig, TollType};
pub use report::SolveReport;
pub use solving::{AbortHandle, Algorithm, BaseAlgorithm, NetworkState, Solver, TerminationState};
