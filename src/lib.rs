#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod db;
pub mod discovery;
pub mod extractor;
pub mod job_store;
pub mod package_store;
pub mod registry;
pub mod schema;
pub mod supervisor;
pub mod worker;

pub use self::config::Config;
pub use self::discovery::{DiscoveryConfig, DiscoveryLoop};
pub use self::job_store::JobStore;
pub use self::package_store::PackageStore;
pub use self::registry::{RegistryClient, RegistryError};
pub use self::supervisor::Supervisor;
pub use self::worker::{Worker, WorkerConfig};
