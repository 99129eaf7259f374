//! DNS data model
//!
//! This module provides the in-memory representation the signing core works
//! on:
//! * Owner names with DNSSEC canonical ordering
//! * Resource records, rdata variants and wire encoding
//! * RRsets and the zone database with versioned diffs
//!
//! # Module Structure
//!
//! * `name` - owner names, label operations, canonical order
//! * `protocol` - record types, rdata, wire encoding, RRsets
//! * `zone` - the zone database: nodes, lookup, diffs, serial arithmetic
//! * `errors` - the error taxonomy shared by the signing core

/// Owner names and DNSSEC canonical ordering
pub mod name;

/// Record types, rdata variants and wire encoding
pub mod protocol;

/// The zone database: nodes, lookup, diffs
pub mod zone;

/// Error taxonomy for zone and signing operations
pub mod errors;
