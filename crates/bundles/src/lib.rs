//! Bundle generation: per-entity artifact jobs and the orchestrators that fan
//! them out and assemble the result.
//!
//! Everything here runs inside queue handlers. Nothing blocks waiting for
//! other jobs; a bundle that has to wait returns and is invoked again.

pub mod child;
pub mod error;
pub mod nested;
pub mod orchestrator;
pub mod runtime;
pub mod services;
pub mod trigger;
pub mod unit_gdoc;
pub mod unit_pdf;

pub use child::ChildArtifactJob;
pub use error::{BundleError, ChildJobError};
pub use nested::NestedJobSet;
pub use orchestrator::{BundleContext, BundleJob, BundleOrchestrator, BundleStep, ChildSpec, lock_name};
pub use runtime::{InMemoryRuntime, register_handlers, spawn_workers};
pub use services::BundleServices;
pub use trigger::{BundleTrigger, PruneReport, RequestReport, RequestStatus, TriggeredRequest};
pub use unit_gdoc::UnitGdocBundle;
pub use unit_pdf::UnitPdfBundle;
