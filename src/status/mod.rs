//! Cached, deduplicated views over slow `kubectl` queries.
//!
//! Every external query goes through one [`SingleFlight`], so identical
//! command lines issued concurrently (including the same sub-query fanned out
//! by several composites) execute once.

pub mod app;
pub mod cache;
pub mod cluster;
pub mod runner;
pub mod single_flight;

pub use app::AppStatusService;
pub use cache::{CacheStatus, Cached, ResourceKind};
pub use cluster::ClusterStatusService;
pub use runner::{CommandRunner, KubectlRunner};
pub use single_flight::SingleFlight;
