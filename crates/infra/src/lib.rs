//! Infrastructure layer: job queue, locks, stores, config, external services.

pub mod barriers;
pub mod config;
pub mod db;
pub mod external;
pub mod jobs;
pub mod locks;
pub mod outcomes;
pub mod results;

pub use config::{BundleConfig, ConfigError, DeferralPolicy, JoinStrategy};
pub use locks::{AdvisoryLocks, InMemoryLocks, LockError, LockGuard};
pub use results::{InMemoryResultBackend, ResultBackend, ResultStore, ResultStoreError};
