//! zonegrid-state — durable state for zonegrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds two tables:
//!
//! - **instances** — the committed record of every instance of every
//!   deployment (index, AZ, held addresses, persistent disks).
//! - **ip_leases** — the committed side of the IP reservation ledger. One row
//!   per address; a row names the single deployment/instance allowed to use it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).
//! Lease commits run a read-check-write inside one redb write transaction, and
//! redb admits one writer at a time, so a commit is an atomic conditional
//! write per address.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
