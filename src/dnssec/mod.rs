//! DNSSEC signing core
//!
//! Turns an unsigned or partially-signed zone into a fully signed one:
//! RRSIG maintenance per RRset, an NSEC or NSEC3 denial-of-existence chain,
//! delegation-trust records, and incremental re-signing driven by update
//! diffs.
//!
//! # Module Structure
//!
//! * `config` - signing options and policy knobs
//! * `keyring` - the active key set, roles and lifecycle metadata
//! * `signer` - single-RRset signature creation and self-verification
//! * `policy` - per-node keep/drop/refresh decisions
//! * `nsec` - NSEC chain construction
//! * `nsec3` - NSEC3 chain construction, hashing and opt-out
//! * `walker` - multi-threaded zone traversal
//! * `incremental` - diff-driven re-signing with cooperative yielding
//! * `sync` - DS/CDS/CDNSKEY maintenance

/// Signing options and policy knobs
pub mod config;

/// The active key set: loading, roles, rollover links
pub mod keyring;

/// Single-RRset signature creation
pub mod signer;

/// Per-node signing policy
pub mod policy;

/// NSEC chain construction
pub mod nsec;

/// NSEC3 chain construction
pub mod nsec3;

/// Multi-threaded zone traversal
pub mod walker;

/// Diff-driven incremental re-signing
pub mod incremental;

/// DS/CDS/CDNSKEY maintenance
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;
