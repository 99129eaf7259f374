//! Zonesigner
//!
//! The DNSSEC zone-signing engine of an authoritative DNS toolkit. Takes an
//! in-memory zone database together with a set of signing keys, and produces a
//! zone fully signed with RRSIG records and equipped with an NSEC or NSEC3
//! denial-of-existence chain.
//!
//! # Features
//!
//! * Per-RRset signature selection, creation and expiry-driven refresh
//! * KSK/ZSK role policy with seamless ZSK rollover via predecessor links
//! * NSEC and NSEC3 chains, including opt-out and empty non-terminals
//! * Multi-threaded name-by-name signing with apex-first ordering
//! * Diff-driven incremental re-signing with cooperative yielding
//! * DS/CDS/CDNSKEY delegation-trust maintenance
//!
//! # Architecture
//!
//! The crate is divided into two main modules:
//! * `dns` - names, records, rdata and the zone database
//! * `dnssec` - the signing core itself

/// Names, resource records and the zone database
pub mod dns;

/// The DNSSEC signing core
pub mod dnssec;
