//! redb table definitions for the zonegrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Instance records keyed by `{deployment}:{instance_group}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// IP leases keyed by the canonical text form of the address.
pub const IP_LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("ip_leases");
