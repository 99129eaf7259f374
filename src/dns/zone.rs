//! Contains the in-memory zone database the signer operates on
//!
//! A zone is a mapping from canonical name to node; one distinguished name
//! is the origin. Nodes are created lazily when a record at that name first
//! appears and are destroyed when their last record is removed. Because
//! `Name`'s `Ord` is DNSSEC canonical order, iterating the node map visits
//! names in exactly the order the denial chain needs.
//!
//! NSEC3 owner nodes live in the same map but are flagged, so "main tree"
//! and "NSEC3 tree" walks stay distinct.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::dns::errors::{DiffConflictError, SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{Rdata, Record, RecordType, Rrset, Rrsig, Soa};

/// One owner name's worth of data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    /// RRsets keyed by type code
    rrsets: BTreeMap<u16, Rrset>,
    /// Signatures keyed by the covered type code
    rrsigs: BTreeMap<u16, Vec<Rrsig>>,
    /// Set on nodes that exist only to carry NSEC3 records
    pub nsec3_node: bool,
}

impl Node {
    pub fn is_empty(&self) -> bool {
        self.rrsets.is_empty() && self.rrsigs.is_empty()
    }

    pub fn rrset(&self, rtype: RecordType) -> Option<&Rrset> {
        self.rrsets.get(&rtype.to_num())
    }

    pub fn rrsets(&self) -> impl Iterator<Item = &Rrset> {
        self.rrsets.values()
    }

    pub fn has_type(&self, rtype: RecordType) -> bool {
        self.rrsets.contains_key(&rtype.to_num())
    }

    /// Type codes present at this node, for bitmap construction
    pub fn present_types(&self) -> Vec<u16> {
        self.rrsets.keys().cloned().collect()
    }

    pub fn sigs_covering(&self, covered: RecordType) -> &[Rrsig] {
        self.rrsigs
            .get(&covered.to_num())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn all_sigs(&self) -> impl Iterator<Item = &Rrsig> {
        self.rrsigs.values().flatten()
    }

    pub fn covered_types(&self) -> Vec<u16> {
        self.rrsigs.keys().cloned().collect()
    }

    /// A delegation point owns NS but is not the apex; the caller supplies
    /// the apex test since the node does not know its own name
    pub fn is_delegation(&self, is_apex: bool) -> bool {
        !is_apex && self.has_type(RecordType::Ns)
    }

    pub fn has_dname(&self) -> bool {
        self.has_type(RecordType::Dname)
    }
}

/// How to advance the SOA serial on output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialMode {
    /// Leave the serial alone
    Keep,
    /// RFC 1982 increment
    Increment,
    /// Set to the current epoch second
    Unixtime,
    /// Set to YYYYMMDD00, incrementing within the day
    Date,
}

impl SerialMode {
    pub fn parse(s: &str) -> Option<SerialMode> {
        match s {
            "keep" => Some(SerialMode::Keep),
            "increment" => Some(SerialMode::Increment),
            "unixtime" => Some(SerialMode::Unixtime),
            "date" => Some(SerialMode::Date),
            _ => None,
        }
    }
}

/// RFC 1982 serial comparison: true if `a` is strictly newer than `b`
pub fn serial_gt(a: u32, b: u32) -> bool {
    a != b && ((a > b && a - b < 0x8000_0000) || (a < b && b - a > 0x8000_0000))
}

/// RFC 1982 addition with wrap-around
pub fn serial_add(serial: u32, n: u32) -> u32 {
    serial.wrapping_add(n)
}

/// A single diff operation, as emitted by an update pipeline or by the
/// signer itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffOpKind {
    Add,
    Del,
    /// Like `Add`, but the resigner additionally tracks earliest expiry on
    /// the affected RRSIG
    AddResign,
    /// Like `Del`, with the same expiry tracking
    DelResign,
}

impl DiffOpKind {
    pub fn is_add(&self) -> bool {
        matches!(self, DiffOpKind::Add | DiffOpKind::AddResign)
    }

    pub fn is_del(&self) -> bool {
        !self.is_add()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffOp {
    pub kind: DiffOpKind,
    pub record: Record,
}

impl DiffOp {
    pub fn add(record: Record) -> DiffOp {
        DiffOp {
            kind: DiffOpKind::Add,
            record,
        }
    }

    pub fn del(record: Record) -> DiffOp {
        DiffOp {
            kind: DiffOpKind::Del,
            record,
        }
    }
}

/// An ordered sequence of diff operations
pub type ZoneDiff = Vec<DiffOp>;

/// Additions and deletions produced by a signing pass, applied to the
/// database by the caller and handed to the downstream serializer
#[derive(Debug, Clone, Default)]
pub struct ZoneDelta {
    pub deletions: Vec<Record>,
    pub additions: Vec<Record>,
}

impl ZoneDelta {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.additions.is_empty()
    }

    pub fn merge(&mut self, other: ZoneDelta) {
        self.deletions.extend(other.deletions);
        self.additions.extend(other.additions);
    }

    pub fn into_diff(self) -> ZoneDiff {
        let mut diff = Vec::with_capacity(self.deletions.len() + self.additions.len());
        diff.extend(self.deletions.into_iter().map(DiffOp::del));
        diff.extend(self.additions.into_iter().map(DiffOp::add));
        diff
    }
}

/// The zone database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    origin: Name,
    nodes: BTreeMap<Name, Node>,
}

impl Zone {
    pub fn new(origin: Name) -> Zone {
        Zone {
            origin,
            nodes: BTreeMap::new(),
        }
    }

    pub fn origin(&self) -> &Name {
        &self.origin
    }

    pub fn node(&self, name: &Name) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &Name) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn ensure_node(&mut self, name: &Name) -> &mut Node {
        self.nodes.entry(name.clone()).or_insert_with(Node::default)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All names in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (&Name, &Node)> {
        self.nodes.iter()
    }

    /// Main-tree names only, NSEC3 owner nodes excluded
    pub fn iter_main(&self) -> impl Iterator<Item = (&Name, &Node)> {
        self.nodes.iter().filter(|(_, node)| !node.nsec3_node)
    }

    /// NSEC3 owner nodes only
    pub fn iter_nsec3(&self) -> impl Iterator<Item = (&Name, &Node)> {
        self.nodes.iter().filter(|(_, node)| node.nsec3_node)
    }

    pub fn soa(&self) -> Option<&Soa> {
        let rrset = self.nodes.get(&self.origin)?.rrset(RecordType::Soa)?;
        match rrset.rdatas.first() {
            Some(Rdata::Soa(soa)) => Some(soa),
            _ => None,
        }
    }

    pub fn soa_ttl(&self) -> Option<u32> {
        self.nodes
            .get(&self.origin)?
            .rrset(RecordType::Soa)
            .map(|s| s.ttl)
    }

    /// Add one record, creating the node lazily. RRSIGs are filed under
    /// their covered type.
    pub fn add_record(&mut self, record: &Record) {
        let node = self.ensure_node(&record.name);
        match &record.rdata {
            Rdata::Rrsig(sig) => {
                let sigs = node.rrsigs.entry(sig.type_covered.to_num()).or_default();
                if !sigs.contains(sig) {
                    sigs.push(sig.clone());
                }
            }
            rdata => {
                let rtype = rdata.rtype().to_num();
                let rrset = node.rrsets.entry(rtype).or_insert_with(|| {
                    Rrset::new(record.name.clone(), rdata.rtype(), record.ttl)
                });
                rrset.push(record.ttl, rdata.clone());
            }
        }
        if record.rtype() == RecordType::Nsec3 {
            if let Some(node) = self.nodes.get_mut(&record.name) {
                node.nsec3_node = true;
            }
        }
    }

    /// Remove one record by value; the node is destroyed when its last
    /// record goes. Returns whether anything matched.
    pub fn remove_record(&mut self, record: &Record) -> bool {
        let removed = match self.nodes.get_mut(&record.name) {
            Some(node) => match &record.rdata {
                Rdata::Rrsig(sig) => {
                    let covered = sig.type_covered.to_num();
                    let mut hit = false;
                    if let Some(sigs) = node.rrsigs.get_mut(&covered) {
                        let before = sigs.len();
                        sigs.retain(|s| s != sig);
                        hit = sigs.len() != before;
                        if sigs.is_empty() {
                            node.rrsigs.remove(&covered);
                        }
                    }
                    hit
                }
                rdata => {
                    let rtype = rdata.rtype().to_num();
                    let mut hit = false;
                    if let Some(rrset) = node.rrsets.get_mut(&rtype) {
                        let before = rrset.rdatas.len();
                        rrset.rdatas.retain(|r| r != rdata);
                        hit = rrset.rdatas.len() != before;
                        if rrset.rdatas.is_empty() {
                            node.rrsets.remove(&rtype);
                        }
                    }
                    hit
                }
            },
            None => false,
        };
        self.prune(&record.name);
        removed
    }

    /// Remove an entire RRset, returning it if present
    pub fn remove_rrset(&mut self, name: &Name, rtype: RecordType) -> Option<Rrset> {
        let removed = self
            .nodes
            .get_mut(name)
            .and_then(|node| node.rrsets.remove(&rtype.to_num()));
        self.prune(name);
        removed
    }

    /// Remove all signatures covering `covered` at `name`
    pub fn remove_sigs(&mut self, name: &Name, covered: RecordType) -> Vec<Rrsig> {
        let removed = self
            .nodes
            .get_mut(name)
            .and_then(|node| node.rrsigs.remove(&covered.to_num()))
            .unwrap_or_default();
        self.prune(name);
        removed
    }

    fn prune(&mut self, name: &Name) {
        if name == &self.origin {
            return;
        }
        if let Some(node) = self.nodes.get(name) {
            if node.is_empty() {
                self.nodes.remove(name);
            }
        }
    }

    /// True if `name` sits at or below a delegation cut or DNAME
    /// redirection, or outside the zone entirely
    pub fn is_occluded(&self, name: &Name) -> bool {
        if !name.is_subdomain_of(&self.origin) {
            return true;
        }
        let mut ancestor = name.parent();
        while let Some(a) = ancestor {
            if !a.is_subdomain_of(&self.origin) || a.label_count() < self.origin.label_count() {
                break;
            }
            if let Some(node) = self.nodes.get(&a) {
                if a != self.origin && node.has_type(RecordType::Ns) {
                    return true;
                }
                if node.has_dname() {
                    return true;
                }
            }
            if a == self.origin {
                break;
            }
            ancestor = a.parent();
        }
        false
    }

    /// True if the name participates in the denial chain: in-zone, not
    /// occluded, not an NSEC3 owner node
    pub fn is_active(&self, name: &Name) -> bool {
        match self.nodes.get(name) {
            Some(node) => !node.nsec3_node && !self.is_occluded(name),
            None => false,
        }
    }

    /// The nearest main-tree name strictly before `name` in canonical
    /// order, wrapping past the origin at most once
    pub fn predecessor(&self, name: &Name) -> Option<Name> {
        let before = self
            .nodes
            .range(..name.clone())
            .rev()
            .find(|(_, node)| !node.nsec3_node)
            .map(|(n, _)| n.clone());
        match before {
            Some(n) => Some(n),
            // wrap: the canonically last main-tree name
            None => self
                .nodes
                .iter()
                .rev()
                .find(|(n, node)| !node.nsec3_node && *n != name)
                .map(|(n, _)| n.clone()),
        }
    }

    /// The nearest name before `name` that anchors a chain position: one
    /// that carries an NSEC or, in a not-yet-secured zone, any chain-active
    /// name. Occluded glue in between is skipped. Wraps at most once.
    pub fn chain_predecessor(&self, name: &Name) -> Option<Name> {
        let anchors = |n: &Name, node: &Node| {
            !node.nsec3_node
                && (node.has_type(RecordType::Nsec) || self.is_active(n))
        };
        let before = self
            .nodes
            .range(..name.clone())
            .rev()
            .find(|(n, node)| anchors(n, node))
            .map(|(n, _)| n.clone());
        match before {
            Some(n) => Some(n),
            None => self
                .nodes
                .iter()
                .rev()
                .find(|(n, node)| *n != name && anchors(n, node))
                .map(|(n, _)| n.clone()),
        }
    }

    /// Update the SOA serial per the chosen mode; falls back to increment
    /// when the method would not advance the serial. Returns the new value.
    pub fn update_serial(&mut self, mode: SerialMode, now: u32) -> Option<u32> {
        let old = self.soa()?.serial;
        let new = match mode {
            SerialMode::Keep => old,
            SerialMode::Increment => serial_add(old, 1),
            SerialMode::Unixtime => {
                if serial_gt(now, old) {
                    now
                } else {
                    serial_add(old, 1)
                }
            }
            SerialMode::Date => {
                let date = chrono::NaiveDateTime::from_timestamp_opt(now as i64, 0)
                    .map(|dt| dt.format("%Y%m%d").to_string())
                    .and_then(|s| s.parse::<u32>().ok())
                    .map(|d| d * 100)
                    .unwrap_or(old);
                if serial_gt(date, old) {
                    date
                } else {
                    serial_add(old, 1)
                }
            }
        };
        let origin = self.origin.clone();
        if let Some(node) = self.nodes.get_mut(&origin) {
            if let Some(rrset) = node.rrsets.get_mut(&RecordType::Soa.to_num()) {
                if let Some(Rdata::Soa(soa)) = rrset.rdatas.first_mut() {
                    soa.serial = new;
                }
            }
        }
        Some(new)
    }

    /// Apply an externally produced diff, verifying that deletions name
    /// records that actually exist
    pub fn apply_diff(&mut self, diff: &[DiffOp]) -> SignResult<()> {
        for op in diff {
            if op.kind.is_del() {
                if !self.remove_record(&op.record) {
                    return Err(SignError::DiffConflict(DiffConflictError {
                        name: op.record.name.clone(),
                        rtype: op.record.rtype(),
                        detail: "deleted record not present in zone".to_string(),
                    }));
                }
            } else {
                self.add_record(&op.record);
            }
        }
        Ok(())
    }

    /// Apply a signing delta: deletions first, then additions
    pub fn apply_delta(&mut self, delta: &ZoneDelta) {
        for record in &delta.deletions {
            self.remove_record(record);
        }
        for record in &delta.additions {
            self.add_record(record);
        }
    }
}
