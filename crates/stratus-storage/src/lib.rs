//! Persistence for the Stratus orchestrator
//!
//! One store trait, two implementations: PostgreSQL for production and
//! an in-memory double for tests. Every trait operation is a single
//! transaction; the data-model invariants hold at each commit boundary.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::MemStore;
pub use postgres::PgStore;
pub use store::{
    CompletionOutcome, CompletionUpdate, ExpiredLeases, FailureOutcome, FailureUpdate,
    ItemContext, JobError, JobPlan, LeasePolicy, LeasedWork, Store,
};
