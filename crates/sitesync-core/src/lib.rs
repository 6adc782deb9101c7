//! Shared domain types and external collaborator contracts for sitesync.
//!
//! This crate defines the data model (§3), the `Fetcher`/`Plugin` contracts
//! consumed by the core (§6), and the error taxonomy (§7). It has no I/O of
//! its own: every trait here is implemented by a collaborator outside the
//! core (a real HTTP/browser fetcher, an asset-normalization plugin) or, in
//! tests, by a fake.

pub mod backoff;
pub mod canonical;
pub mod error;
pub mod fetch;
pub mod model;
pub mod plugin;

pub use error::{Error, Result};
pub use model::{
    Asset, AssetVersion, DiffClass, Exception, ExceptionKind, Run, RunStatus, Task, TaskStatus,
};
