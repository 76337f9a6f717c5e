//! Core domain model for the Stratus orchestrator
//!
//! This crate defines the entities shared by every other crate: jobs,
//! workflow steps, work items, the per-user work ledger, STAC catalog
//! fragments, service and collection descriptors, error kinds, and the
//! process configuration. It carries no persistence or HTTP concerns.

pub mod config;
pub mod error;
pub mod item;
pub mod job;
pub mod object_store;
pub mod service;
pub mod stac;
pub mod step;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use item::{UserWork, WorkItem, WorkItemStatus, WorkItemUpdate};
pub use job::{normalize_labels, Job, JobLink, JobStatus, TemporalRange};
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use service::{CollectionInfo, ServiceDefinition, ServiceStep, TransformationRequest};
pub use stac::{StacCatalog, StacLink};
pub use step::{StepOperation, WorkflowStep};
