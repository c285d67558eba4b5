//! vmscale-state: resource pool and decision lock for the vmscale autoscaler.
//!
//! Backed by [redb](https://docs.rs/redb), holds the authoritative VM and job
//! records plus the lease table behind the cluster-wide decision lock.
//!
//! # Architecture
//!
//! ```text
//! StateStore (redb, Clone + Send + Sync)
//!   ├── impl ResourcePool   VM/job queries, guarded batch state updates
//!   └── impl MutexService   lease rows in the `locks` table
//!            └── Exclusive → ScopedLock (RAII release)
//! ```
//!
//! Deciders depend on the two traits only, never on the store directly.

pub mod error;
pub mod mutex;
pub mod pool;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use mutex::{Exclusive, LockError, LockRecord, LockResult, MutexService, ScopedLock};
pub use pool::ResourcePool;
pub use store::StateStore;
pub use types::*;
