pub mod leases;
pub mod plan;
