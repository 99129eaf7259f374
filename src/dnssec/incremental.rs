//! Diff-driven incremental re-signing
//!
//! Given a diff an update pipeline has already applied to a new zone
//! version, recompute the minimal set of RRSIG and NSEC/NSEC3 changes. The
//! work is an explicit eight-phase state machine; after roughly a hundred
//! signatures the call parks its work lists in a continuation object and
//! returns `Continue`, so long resign jobs do not starve other work. The
//! caller reinvokes with the same arguments until `Done`.

use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::RwLock;

use crate::dns::errors::{DiffConflictError, SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{Nsec, Nsec3, Rdata, Record, RecordType, Rrset};
use crate::dns::zone::{DiffOp, DiffOpKind, Zone, ZoneDiff};
use crate::dnssec::config::SigningConfig;
use crate::dnssec::keyring::Keyring;
use crate::dnssec::nsec::chain_ttl;
use crate::dnssec::nsec3::{base32hex_encode, nsec3_hash};
use crate::dnssec::policy::{keys_for_rrset, sign_new_rrset, SignContext};
use crate::dnssec::signer::SigningStatistics;

/// Yield after this many signatures have been produced
const SIGNATURES_PER_YIELD: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SignUpdates,
    RemoveOrphaned,
    BuildChain,
    ProcessNsec,
    SignNsec,
    UpdateNsec3,
    ProcessNsec3,
    SignNsec3,
    Finished,
}

/// The continuation the caller holds between invocations
pub struct ResignState {
    phase: Phase,
    /// (name, type) groups still to re-sign
    groups: VecDeque<(Name, RecordType)>,
    /// names still to check for orphaned denial records
    orphan_queue: VecDeque<Name>,
    /// names whose chain position must be reconsidered
    affected: BTreeSet<Name>,
    /// the per-phase work queue drawn from `affected`
    work: VecDeque<Name>,
    /// set once the NSEC3 sign queue holds hashed positions, not originals
    positions_ready: bool,
    /// signatures produced since the last yield
    sigs_since_yield: usize,
    /// the additive diff produced so far, for the caller's journal
    out: ZoneDiff,
    /// earliest expiration among signatures made for resign-tracked ops
    earliest_expiry: Option<u32>,
}

/// Result of one resigner invocation
pub enum ResignOutcome {
    /// All phases complete; the produced diff and the earliest tracked
    /// RRSIG expiration (for re-sign scheduling)
    Done {
        diff: ZoneDiff,
        earliest_expiry: Option<u32>,
    },
    /// Work remains; reinvoke with this continuation
    Continue(Box<ResignState>),
}

/// Re-sign incrementally after `diff` was applied to `new`
///
/// `validity` overrides the configured signature lifetime for signatures
/// made by this run. Any failure terminates the operation; the caller is
/// expected to roll the update back.
#[allow(clippy::too_many_arguments)]
pub fn resign_incremental(
    config: &SigningConfig,
    keyring: &RwLock<Keyring>,
    stats: &SigningStatistics,
    old: &Zone,
    new: &mut Zone,
    diff: &ZoneDiff,
    validity: u32,
    state: Option<Box<ResignState>>,
    now: u32,
) -> SignResult<ResignOutcome> {
    let effective = SigningConfig {
        signature_validity: validity,
        ..config.clone()
    };
    let origin = new.origin().clone();

    let mut state = match state {
        Some(state) => state,
        None => {
            verify_diff_applied(new, diff)?;
            Box::new(ResignState {
                phase: Phase::SignUpdates,
                groups: group_diff(diff),
                orphan_queue: diff_names(diff).into_iter().collect(),
                affected: BTreeSet::new(),
                work: VecDeque::new(),
                positions_ready: false,
                sigs_since_yield: 0,
                out: Vec::new(),
                earliest_expiry: None,
            })
        }
    };
    state.sigs_since_yield = 0;

    loop {
        let ctx = SignContext::new(&effective, origin.clone(), keyring, stats, now);
        match state.phase {
            Phase::SignUpdates => {
                while let Some((name, rtype)) = state.groups.pop_front() {
                    sign_update_group(&ctx, new, diff, &name, rtype, &mut state)?;
                    if state.sigs_since_yield >= SIGNATURES_PER_YIELD {
                        return Ok(ResignOutcome::Continue(state));
                    }
                }
                state.phase = Phase::RemoveOrphaned;
            }
            Phase::RemoveOrphaned => {
                while let Some(name) = state.orphan_queue.pop_front() {
                    remove_orphaned_denial(new, &name, &mut state.out);
                }
                state.phase = if effective.nsec3.is_some() {
                    Phase::UpdateNsec3
                } else {
                    Phase::BuildChain
                };
            }
            Phase::BuildChain => {
                state.affected = affected_names(old, new, diff);
                state.work = state.affected.iter().cloned().collect();
                state.phase = Phase::ProcessNsec;
            }
            Phase::ProcessNsec => {
                while let Some(name) = state.work.pop_front() {
                    process_nsec_name(&ctx, new, &name, &mut state)?;
                    if state.sigs_since_yield >= SIGNATURES_PER_YIELD {
                        return Ok(ResignOutcome::Continue(state));
                    }
                }
                state.work = state.affected.iter().cloned().collect();
                state.phase = Phase::SignNsec;
            }
            Phase::SignNsec => {
                while let Some(name) = state.work.pop_front() {
                    sign_nsec_name(&ctx, new, &name, &mut state)?;
                    if state.sigs_since_yield >= SIGNATURES_PER_YIELD {
                        return Ok(ResignOutcome::Continue(state));
                    }
                }
                state.phase = Phase::Finished;
            }
            Phase::UpdateNsec3 => {
                state.affected = affected_names_nsec3(old, new, diff, &origin);
                state.work = state.affected.iter().cloned().collect();
                state.phase = Phase::ProcessNsec3;
            }
            Phase::ProcessNsec3 => {
                while let Some(name) = state.work.pop_front() {
                    process_nsec3_name(&ctx, new, &name, &mut state)?;
                    if state.sigs_since_yield >= SIGNATURES_PER_YIELD {
                        return Ok(ResignOutcome::Continue(state));
                    }
                }
                state.work = state.affected.iter().cloned().collect();
                state.phase = Phase::SignNsec3;
            }
            Phase::SignNsec3 => {
                if !state.positions_ready {
                    state.work = nsec3_positions(&ctx, new, &state.affected)?
                        .into_iter()
                        .collect();
                    state.positions_ready = true;
                }
                while let Some(owner) = state.work.pop_front() {
                    sign_nsec3_position(&ctx, new, &owner, &mut state)?;
                    if state.sigs_since_yield >= SIGNATURES_PER_YIELD {
                        return Ok(ResignOutcome::Continue(state));
                    }
                }
                state.phase = Phase::Finished;
            }
            Phase::Finished => {
                log::debug!(
                    "incremental resign of {} complete: {} diff op(s) out",
                    origin,
                    state.out.len()
                );
                return Ok(ResignOutcome::Done {
                    diff: state.out,
                    earliest_expiry: state.earliest_expiry,
                });
            }
        }
    }
}

/// The "old side" of the diff must match the zone the caller claims to have
/// applied it to
fn verify_diff_applied(new: &Zone, diff: &ZoneDiff) -> SignResult<()> {
    for op in diff {
        let present = new
            .node(&op.record.name)
            .map(|node| match &op.record.rdata {
                Rdata::Rrsig(sig) => node
                    .sigs_covering(sig.type_covered)
                    .iter()
                    .any(|s| s == sig),
                rdata => node
                    .rrset(rdata.rtype())
                    .map(|s| s.rdatas.contains(rdata))
                    .unwrap_or(false),
            })
            .unwrap_or(false);
        let expectation = op.kind.is_add();
        if present != expectation {
            return Err(SignError::DiffConflict(DiffConflictError {
                name: op.record.name.clone(),
                rtype: op.record.rtype(),
                detail: if expectation {
                    "added record is absent from the new version".to_string()
                } else {
                    "deleted record is still present in the new version".to_string()
                },
            }));
        }
    }
    Ok(())
}

/// Distinct (name, type) groups in the diff, denial and signature types
/// excluded (those are recomputed, not blindly re-signed)
fn group_diff(diff: &ZoneDiff) -> VecDeque<(Name, RecordType)> {
    let mut seen: BTreeSet<(Name, u16)> = BTreeSet::new();
    let mut out = VecDeque::new();
    for op in diff {
        let rtype = op.record.rtype();
        if matches!(
            rtype,
            RecordType::Rrsig | RecordType::Nsec | RecordType::Nsec3
        ) {
            continue;
        }
        if seen.insert((op.record.name.clone(), rtype.to_num())) {
            out.push_back((op.record.name.clone(), rtype));
        }
    }
    out
}

fn diff_names(diff: &ZoneDiff) -> BTreeSet<Name> {
    diff.iter().map(|op| op.record.name.clone()).collect()
}

/// Whether any op in the diff for this (name, type) asked for expiry
/// tracking
fn group_tracks_expiry(diff: &ZoneDiff, name: &Name, rtype: RecordType) -> bool {
    diff.iter().any(|op| {
        op.record.name == *name
            && op.record.rtype() == rtype
            && matches!(op.kind, DiffOpKind::AddResign | DiffOpKind::DelResign)
    })
}

/// Phase 1 work: strip the signatures covering one updated (name, type) and
/// re-sign it if the type survived the update
fn sign_update_group(
    ctx: &SignContext<'_>,
    new: &mut Zone,
    diff: &ZoneDiff,
    name: &Name,
    rtype: RecordType,
    state: &mut ResignState,
) -> SignResult<()> {
    let track = group_tracks_expiry(diff, name, rtype);

    // delete the covering signatures; offline-KSK DNSKEY signatures are
    // preserved since we could never recreate them
    let ring = ctx.keyring.read();
    let doomed: Vec<Record> = new
        .node(name)
        .map(|node| {
            node.sigs_covering(rtype)
                .iter()
                .filter(|sig| {
                    if rtype != RecordType::Dnskey {
                        return true;
                    }
                    // only signatures we can recreate are expendable
                    match ring.find_by_tag(sig.key_tag, sig.algorithm) {
                        Some(key) => key.is_signing(ctx.now) && !key.is_offline(),
                        None => false,
                    }
                })
                .map(|sig| Record::new(name.clone(), sig.original_ttl, Rdata::Rrsig(sig.clone())))
                .collect()
        })
        .unwrap_or_default();
    drop(ring);

    for record in doomed {
        new.remove_record(&record);
        state.out.push(DiffOp::del(record));
    }

    // sign whatever the update left behind
    let rrset = match new.node(name).and_then(|n| n.rrset(rtype)) {
        Some(rrset) => rrset.clone(),
        None => return Ok(()),
    };
    let is_delegation = new
        .node(name)
        .map(|n| n.is_delegation(*name == ctx.origin))
        .unwrap_or(false);
    if new.is_occluded(name)
        || (is_delegation && !matches!(rtype, RecordType::Ds | RecordType::Nsec))
    {
        return Ok(());
    }

    let additions = sign_new_rrset(ctx, name, &rrset)?;
    for record in additions {
        if track {
            if let Rdata::Rrsig(sig) = &record.rdata {
                state.earliest_expiry = Some(match state.earliest_expiry {
                    Some(cur) => cur.min(sig.expiration),
                    None => sig.expiration,
                });
            }
        }
        state.sigs_since_yield += 1;
        new.add_record(&record);
        state.out.push(DiffOp::add(record));
    }
    Ok(())
}

/// Phase 2: a name left with nothing but denial records loses them too
fn remove_orphaned_denial(new: &mut Zone, name: &Name, out: &mut ZoneDiff) {
    let orphaned = match new.node(name) {
        Some(node) => node
            .rrsets()
            .all(|rrset| matches!(rrset.rtype, RecordType::Nsec | RecordType::Nsec3)),
        None => return,
    };
    if !orphaned {
        return;
    }
    let node = match new.node(name) {
        Some(node) => node,
        None => return,
    };
    let mut doomed: Vec<Record> = Vec::new();
    for rrset in node.rrsets() {
        doomed.extend(rrset.records());
    }
    for sig in node.all_sigs() {
        doomed.push(Record::new(
            name.clone(),
            sig.original_ttl,
            Rdata::Rrsig(sig.clone()),
        ));
    }
    for record in doomed {
        new.remove_record(&record);
        out.push(DiffOp::del(record));
    }
}

/// Phase 3: the names whose NSEC must be reconsidered
fn affected_names(old: &Zone, new: &Zone, diff: &ZoneDiff) -> BTreeSet<Name> {
    let mut affected = BTreeSet::new();
    for name in diff_names(diff) {
        // the name itself, and the predecessor whose NSEC points across it;
        // occluded glue between them does not anchor a chain position
        if let Some(pred) = new.chain_predecessor(&name) {
            affected.insert(pred);
        }
        affected.insert(name.clone());

        // a delegation or redirection status flip re-shadows the subtree
        let old_cut = cut_status(old, &name);
        let new_cut = cut_status(new, &name);
        if old_cut != new_cut {
            for (below, _) in new.iter_main() {
                if below.is_subdomain_of(&name) {
                    affected.insert(below.clone());
                }
            }
        }
    }
    affected
}

fn cut_status(zone: &Zone, name: &Name) -> (bool, bool) {
    match zone.node(name) {
        Some(node) => (
            node.has_type(RecordType::Ns) && *name != *zone.origin(),
            node.has_type(RecordType::Dname),
        ),
        None => (false, false),
    }
}

/// Phase 4: ensure an active name carries an NSEC (placeholder until the
/// sign phase fixes the pointer) and that its exposed RRsets are signed;
/// strip denial state from names that lost their place in the chain
fn process_nsec_name(
    ctx: &SignContext<'_>,
    new: &mut Zone,
    name: &Name,
    state: &mut ResignState,
) -> SignResult<()> {
    if !new.is_active(name) {
        // occluded or gone: any surviving NSEC and signatures go
        let doomed: Vec<Record> = match new.node(name) {
            Some(node) => {
                let mut records: Vec<Record> = node
                    .rrset(RecordType::Nsec)
                    .map(|s| s.records().collect())
                    .unwrap_or_default();
                if new.is_occluded(name) {
                    for sig in node.all_sigs() {
                        records.push(Record::new(
                            name.clone(),
                            sig.original_ttl,
                            Rdata::Rrsig(sig.clone()),
                        ));
                    }
                } else {
                    for sig in node.sigs_covering(RecordType::Nsec) {
                        records.push(Record::new(
                            name.clone(),
                            sig.original_ttl,
                            Rdata::Rrsig(sig.clone()),
                        ));
                    }
                }
                records
            }
            None => Vec::new(),
        };
        for record in doomed {
            new.remove_record(&record);
            state.out.push(DiffOp::del(record));
        }
        return Ok(());
    }

    let ttl = chain_ttl(ctx, new)?;

    // make sure every RRset the policy wants signed actually is; names
    // freshly exposed by a delegation removal arrive here unsigned
    let node = match new.node(name) {
        Some(node) => node.clone(),
        None => return Ok(()),
    };
    let is_apex = *name == ctx.origin;
    let is_delegation = node.is_delegation(is_apex);
    for rrset in node.rrsets() {
        let rtype = rrset.rtype;
        if rtype == RecordType::Rrsig || rtype == RecordType::Nsec {
            continue;
        }
        if is_delegation && rtype != RecordType::Ds {
            continue;
        }
        let ring = ctx.keyring.read();
        let wanted = keys_for_rrset(ctx.config, &ring, rtype, is_apex, ctx.now);
        let wanted_empty = wanted.is_empty();
        let covered = node.sigs_covering(rtype).iter().any(|sig| {
            sig.inception < sig.expiration
                && ring
                    .find_by_tag(sig.key_tag, sig.algorithm)
                    .map(|k| k.is_signing(ctx.now) || k.is_offline())
                    .unwrap_or(false)
        });
        drop(ring);
        if !wanted_empty && !covered {
            for record in sign_new_rrset(ctx, name, rrset)? {
                state.sigs_since_yield += 1;
                new.add_record(&record);
                state.out.push(DiffOp::add(record));
            }
        }
    }

    if node.rrset(RecordType::Nsec).is_none() {
        // placeholder; the pointer is provisional until phase 5
        let placeholder = Record::new(
            name.clone(),
            ttl,
            Rdata::Nsec(Nsec {
                next: name.clone(),
                types: Vec::new(),
            }),
        );
        new.add_record(&placeholder);
        state.out.push(DiffOp::add(placeholder));
    }
    Ok(())
}

/// The canonical successor among active names, wrapping to the origin
fn next_active_name(zone: &Zone, name: &Name) -> Name {
    let mut after = zone
        .iter_main()
        .filter(|(n, _)| zone.is_active(n))
        .map(|(n, _)| n)
        .skip_while(|n| **n <= *name);
    match after.next() {
        Some(next) => next.clone(),
        None => zone.origin().clone(),
    }
}

/// Phase 5: give each affected NSEC its precise pointer and bitmap, and
/// sign whatever changed
fn sign_nsec_name(
    ctx: &SignContext<'_>,
    new: &mut Zone,
    name: &Name,
    state: &mut ResignState,
) -> SignResult<()> {
    if !new.is_active(name) {
        return Ok(());
    }
    let ttl = chain_ttl(ctx, new)?;
    let node = match new.node(name) {
        Some(node) => node,
        None => return Ok(()),
    };

    let mut types: Vec<u16> = node.present_types();
    types.retain(|t| *t != RecordType::Nsec.to_num() && *t != RecordType::Nsec3Param.to_num());
    if new.node(&ctx.origin).map(|apex| apex.has_type(RecordType::Nsec3Param)) == Some(true)
        && *name == ctx.origin
    {
        types.push(RecordType::Nsec3Param.to_num());
    }
    types.push(RecordType::Nsec.to_num());
    types.push(RecordType::Rrsig.to_num());
    types.sort_unstable();
    types.dedup();

    let wanted = Nsec {
        next: next_active_name(new, name),
        types,
    };

    let existing = node.rrset(RecordType::Nsec);
    let unchanged = existing
        .map(|s| {
            s.ttl == ttl
                && s.len() == 1
                && matches!(s.rdatas.first(), Some(Rdata::Nsec(old)) if *old == wanted)
        })
        .unwrap_or(false);
    let has_valid_sig = {
        let ring = ctx.keyring.read();
        node.sigs_covering(RecordType::Nsec).iter().any(|sig| {
            sig.inception < sig.expiration
                && ring
                    .find_by_tag(sig.key_tag, sig.algorithm)
                    .map(|k| k.is_signing(ctx.now))
                    .unwrap_or(false)
        })
    };
    if unchanged && has_valid_sig {
        return Ok(());
    }

    // out with the old record and its signatures
    let mut doomed: Vec<Record> = existing.map(|s| s.records().collect()).unwrap_or_default();
    for sig in node.sigs_covering(RecordType::Nsec) {
        doomed.push(Record::new(
            name.clone(),
            sig.original_ttl,
            Rdata::Rrsig(sig.clone()),
        ));
    }
    for record in doomed {
        new.remove_record(&record);
        state.out.push(DiffOp::del(record));
    }

    let mut rrset = Rrset::new(name.clone(), RecordType::Nsec, ttl);
    rrset.push(ttl, Rdata::Nsec(wanted));
    for record in sign_new_rrset(ctx, name, &rrset)? {
        state.sigs_since_yield += 1;
        new.add_record(&record);
        state.out.push(DiffOp::add(record));
    }
    for record in rrset.records() {
        new.add_record(&record);
        state.out.push(DiffOp::add(record));
    }
    Ok(())
}

/// Phase 6 bookkeeping: the original names whose NSEC3 state the diff may
/// have touched, including empty non-terminals created or destroyed
fn affected_names_nsec3(
    old: &Zone,
    new: &Zone,
    diff: &ZoneDiff,
    origin: &Name,
) -> BTreeSet<Name> {
    let mut affected = affected_names(old, new, diff);
    for name in diff_names(diff) {
        // every ancestor between the name and the origin is a potential
        // empty non-terminal, newly needed or newly orphaned
        let mut ancestor = name.parent();
        while let Some(a) = ancestor {
            if !a.is_subdomain_of(origin) || a.label_count() <= origin.label_count() {
                break;
            }
            affected.insert(a.clone());
            ancestor = a.parent();
        }
    }
    affected
}

/// True if `name` is an empty non-terminal in `zone`: no node of its own,
/// but at least one active name beneath it
fn is_empty_non_terminal(zone: &Zone, name: &Name) -> bool {
    if zone.node(name).is_some() {
        return false;
    }
    zone.iter_main()
        .any(|(n, _)| n != name && n.is_subdomain_of(name) && zone.is_active(n))
}

fn hashed_owner(ctx: &SignContext<'_>, name: &Name) -> SignResult<Name> {
    let params = ctx.config.nsec3.as_ref().ok_or_else(|| {
        SignError::policy("nsec3", "(unset)", "NSEC3 phase without parameters")
    })?;
    let hash = nsec3_hash(name, params.salt_bytes(), params.iterations);
    ctx.origin
        .child(base32hex_encode(&hash).as_bytes())
        .map_err(|_| SignError::crypto("hashed owner name overflows the wire limit"))
}

/// Phase 7: create or remove the NSEC3 node for one original name
fn process_nsec3_name(
    ctx: &SignContext<'_>,
    new: &mut Zone,
    name: &Name,
    state: &mut ResignState,
) -> SignResult<()> {
    let params = match &ctx.config.nsec3 {
        Some(params) => params.clone(),
        None => return Ok(()),
    };
    let owner = hashed_owner(ctx, name)?;
    let ttl = chain_ttl(ctx, new)?;

    let in_chain = (new.is_active(name)
        || is_empty_non_terminal(new, name))
        && !(params.opt_out && {
            new.node(name)
                .map(|n| n.is_delegation(*name == ctx.origin) && !n.has_type(RecordType::Ds))
                .unwrap_or(false)
        });

    if !in_chain {
        let doomed: Vec<Record> = match new.node(&owner) {
            Some(node) => {
                let mut records: Vec<Record> = node
                    .rrset(RecordType::Nsec3)
                    .map(|s| s.records().collect())
                    .unwrap_or_default();
                for sig in node.sigs_covering(RecordType::Nsec3) {
                    records.push(Record::new(
                        owner.clone(),
                        sig.original_ttl,
                        Rdata::Rrsig(sig.clone()),
                    ));
                }
                records
            }
            None => Vec::new(),
        };
        for record in doomed {
            new.remove_record(&record);
            state.out.push(DiffOp::del(record));
        }
        // signatures at the original name may be stale too
        process_nsec_cleanup(new, name, state);
        return Ok(());
    }

    // the name belongs in the chain; make sure its data is signed and a
    // placeholder NSEC3 exists for the sign phase to point correctly
    if let Some(node) = new.node(name).cloned() {
        let is_apex = *name == ctx.origin;
        let is_delegation = node.is_delegation(is_apex);
        for rrset in node.rrsets() {
            let rtype = rrset.rtype;
            if rtype == RecordType::Rrsig || rtype == RecordType::Nsec3 {
                continue;
            }
            if is_delegation && rtype != RecordType::Ds {
                continue;
            }
            let ring = ctx.keyring.read();
            let wanted = keys_for_rrset(ctx.config, &ring, rtype, is_apex, ctx.now);
            let wanted_empty = wanted.is_empty();
            let covered = node.sigs_covering(rtype).iter().any(|sig| {
                sig.inception < sig.expiration
                    && ring
                        .find_by_tag(sig.key_tag, sig.algorithm)
                        .map(|k| k.is_signing(ctx.now) || k.is_offline())
                        .unwrap_or(false)
            });
            drop(ring);
            if !wanted_empty && !covered {
                for record in sign_new_rrset(ctx, name, rrset)? {
                    state.sigs_since_yield += 1;
                    new.add_record(&record);
                    state.out.push(DiffOp::add(record));
                }
            }
        }
    }

    if new
        .node(&owner)
        .and_then(|n| n.rrset(RecordType::Nsec3))
        .is_none()
    {
        let hash = nsec3_hash(name, params.salt_bytes(), params.iterations);
        let placeholder = Record::new(
            owner.clone(),
            ttl,
            Rdata::Nsec3(Nsec3 {
                hash_algorithm: params.hash_algorithm,
                flags: if params.opt_out { 0x01 } else { 0x00 },
                iterations: params.iterations,
                salt: params.salt_bytes().to_vec(),
                next_hashed: hash,
                types: Vec::new(),
            }),
        );
        new.add_record(&placeholder);
        state.out.push(DiffOp::add(placeholder));
    }
    Ok(())
}

/// Strip signatures from an original name that dropped out of the chain
fn process_nsec_cleanup(new: &mut Zone, name: &Name, state: &mut ResignState) {
    if !new.is_occluded(name) {
        return;
    }
    let doomed: Vec<Record> = match new.node(name) {
        Some(node) => node
            .all_sigs()
            .map(|sig| {
                Record::new(name.clone(), sig.original_ttl, Rdata::Rrsig(sig.clone()))
            })
            .collect(),
        None => Vec::new(),
    };
    for record in doomed {
        new.remove_record(&record);
        state.out.push(DiffOp::del(record));
    }
}

/// The hashed owners whose records phase 8 must reconsider: every owner
/// touched by the affected originals plus the ring predecessor of each
fn nsec3_positions(
    ctx: &SignContext<'_>,
    new: &Zone,
    affected: &BTreeSet<Name>,
) -> SignResult<BTreeSet<Name>> {
    let ring_owners: Vec<Name> = new.iter_nsec3().map(|(n, _)| n.clone()).collect();
    let mut positions: BTreeSet<Name> = BTreeSet::new();
    if ring_owners.is_empty() {
        return Ok(positions);
    }
    for name in affected {
        let owner = hashed_owner(ctx, name)?;
        match ring_owners.binary_search(&owner) {
            Ok(index) => {
                positions.insert(owner);
                let pred = if index == 0 {
                    ring_owners.len() - 1
                } else {
                    index - 1
                };
                positions.insert(ring_owners[pred].clone());
            }
            Err(slot) => {
                // the owner was removed; the predecessor of its old slot
                // must be re-pointed
                let pred = if slot == 0 {
                    ring_owners.len() - 1
                } else {
                    slot - 1
                };
                positions.insert(ring_owners[pred].clone());
            }
        }
    }
    Ok(positions)
}

/// Phase 8 work item: repair one hashed owner's next-hash pointer and
/// bitmap and re-sign it if anything changed
fn sign_nsec3_position(
    ctx: &SignContext<'_>,
    new: &mut Zone,
    owner: &Name,
    state: &mut ResignState,
) -> SignResult<()> {
    let params = match &ctx.config.nsec3 {
        Some(params) => params.clone(),
        None => return Ok(()),
    };
    let ttl = chain_ttl(ctx, new)?;

    // owner -> original name, for the names this run knows about
    let mut originals: HashMap<Name, Name> = HashMap::new();
    for name in &state.affected {
        originals.insert(hashed_owner(ctx, name)?, name.clone());
    }

    let ring_owners: Vec<Name> = new.iter_nsec3().map(|(n, _)| n.clone()).collect();
    let index = match ring_owners.binary_search(owner) {
        Ok(index) => index,
        Err(_) => return Ok(()),
    };
    let next_owner = &ring_owners[(index + 1) % ring_owners.len()];
    let next_hashed = match label_to_hash(next_owner) {
        Some(hash) => hash,
        None => return Ok(()),
    };

    let node = match new.node(owner) {
        Some(node) => node.clone(),
        None => return Ok(()),
    };
    let current = match node.rrset(RecordType::Nsec3).and_then(|s| s.rdatas.first()) {
        Some(Rdata::Nsec3(n)) => n.clone(),
        _ => return Ok(()),
    };

    let types = match originals.get(owner) {
        Some(original) => nsec3_bitmap(ctx, new, original),
        // an untouched position keeps its bitmap; only the pointer moves
        None => current.types.clone(),
    };

    let wanted = Nsec3 {
        hash_algorithm: params.hash_algorithm,
        flags: if params.opt_out { 0x01 } else { 0x00 },
        iterations: params.iterations,
        salt: params.salt_bytes().to_vec(),
        next_hashed,
        types,
    };

    let has_valid_sig = {
        let ring = ctx.keyring.read();
        node.sigs_covering(RecordType::Nsec3).iter().any(|sig| {
            sig.inception < sig.expiration
                && ring
                    .find_by_tag(sig.key_tag, sig.algorithm)
                    .map(|k| k.is_signing(ctx.now))
                    .unwrap_or(false)
        })
    };
    if current == wanted && has_valid_sig {
        return Ok(());
    }

    let mut doomed: Vec<Record> = node
        .rrset(RecordType::Nsec3)
        .map(|s| s.records().collect())
        .unwrap_or_default();
    for sig in node.sigs_covering(RecordType::Nsec3) {
        doomed.push(Record::new(
            owner.clone(),
            sig.original_ttl,
            Rdata::Rrsig(sig.clone()),
        ));
    }
    for record in doomed {
        new.remove_record(&record);
        state.out.push(DiffOp::del(record));
    }

    let mut rrset = Rrset::new(owner.clone(), RecordType::Nsec3, ttl);
    rrset.push(ttl, Rdata::Nsec3(wanted));
    for record in sign_new_rrset(ctx, owner, &rrset)? {
        state.sigs_since_yield += 1;
        new.add_record(&record);
        state.out.push(DiffOp::add(record));
    }
    for record in rrset.records() {
        new.add_record(&record);
        state.out.push(DiffOp::add(record));
    }
    Ok(())
}

/// Decode a hashed owner's first label back into hash bytes
fn label_to_hash(owner: &Name) -> Option<Vec<u8>> {
    let label = owner.labels().first()?;
    base32hex_decode(label)
}

fn base32hex_decode(label: &[u8]) -> Option<Vec<u8>> {
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    let mut out = Vec::with_capacity(label.len() * 5 / 8);
    for &c in label {
        let value = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'v' => c - b'a' + 10,
            b'A'..=b'V' => c - b'A' + 10,
            _ => return None,
        };
        buffer = (buffer << 5) | value as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xFF) as u8);
        }
    }
    Some(out)
}

/// The type bitmap for one original name in an NSEC3 zone
fn nsec3_bitmap(ctx: &SignContext<'_>, zone: &Zone, name: &Name) -> Vec<u16> {
    let node = match zone.node(name) {
        Some(node) => node,
        None => return Vec::new(),
    };
    let mut types = node.present_types();
    types.retain(|t| *t != RecordType::Nsec.to_num());
    let is_apex = *name == ctx.origin;
    let delegation = node.is_delegation(is_apex);
    let signed = !delegation || node.has_type(RecordType::Ds);
    if signed {
        types.push(RecordType::Rrsig.to_num());
    }
    types.sort_unstable();
    types.dedup();
    types
}

#[cfg(test)]
#[path = "incremental_test.rs"]
mod incremental_test;
