//! redb table definitions for the vmscale state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// VM records keyed by `{vm_id}`.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Job records keyed by `{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Decision lock leases keyed by lock name.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
