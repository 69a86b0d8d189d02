//! Document store layer
//!
//! # Architecture
//!
//! The adapter speaks to storage exclusively through two traits:
//!
//! ```text
//! StoreEngine (lifecycle: open/destroy/list, uuids, replication)
//!   └─→ Database (documents, attachments, views, changes)
//! ```
//!
//! `memory` is the reference implementation: a complete in-memory
//! engine with revision tokens, change sequences, attachments and a
//! restricted view evaluator. Alternative engines plug in behind the
//! same traits.

pub mod engine;
pub mod memory;

pub use engine::{
    collate, param_bool, param_str, valid_database_name, ChangeEvent, ChangesOptions,
    ChangesSubscription, Database, MapExpr, QueryParams, ReplicationOptions, RevRef, StoreEngine,
    ViewQuery,
};
pub use memory::{MemoryDatabase, MemoryEngine};
