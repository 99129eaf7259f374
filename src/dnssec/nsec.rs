//! NSEC chain construction
//!
//! Walks the zone's active names in canonical order and points each one at
//! its successor, wrapping back to the origin. Names occluded by delegation
//! cuts or DNAME redirections do not take part and lose any NSEC they may
//! carry. Leftover NSEC3 state from a previous chain flavour is removed
//! first.

use std::sync::atomic::Ordering;

use crate::dns::errors::{CorruptZoneKind, SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{Nsec, Rdata, Record, RecordType, Rrset};
use crate::dns::zone::{Zone, ZoneDelta};
use crate::dnssec::policy::{sign_new_rrset, SignContext};

/// The TTL every chain record carries: the lesser of the SOA TTL and the
/// SOA minimum, capped by the configured maximum
pub fn chain_ttl(ctx: &SignContext<'_>, zone: &Zone) -> SignResult<u32> {
    let soa = zone.soa().ok_or_else(|| {
        SignError::corrupt(zone.origin().clone(), CorruptZoneKind::MissingSoa)
    })?;
    let soa_ttl = zone.soa_ttl().unwrap_or(soa.minimum);
    Ok(ctx.config.capped_ttl(soa_ttl.min(soa.minimum)))
}

/// Remove NSEC3 leftovers: the NSEC3PARAM at the origin, every NSEC3 owner
/// node, and the signatures covering them
pub fn remove_nsec3_leftovers(zone: &Zone, delta: &mut ZoneDelta) {
    if let Some(apex) = zone.node(zone.origin()) {
        if let Some(params) = apex.rrset(RecordType::Nsec3Param) {
            for record in params.records() {
                delta.deletions.push(record);
            }
        }
        for sig in apex.sigs_covering(RecordType::Nsec3Param) {
            delta.deletions.push(Record::new(
                zone.origin().clone(),
                sig.original_ttl,
                Rdata::Rrsig(sig.clone()),
            ));
        }
    }
    for (name, node) in zone.iter_nsec3() {
        if let Some(rrset) = node.rrset(RecordType::Nsec3) {
            for record in rrset.records() {
                delta.deletions.push(record);
            }
        }
        for sig in node.sigs_covering(RecordType::Nsec3) {
            delta.deletions.push(Record::new(
                name.clone(),
                sig.original_ttl,
                Rdata::Rrsig(sig.clone()),
            ));
        }
    }
}

/// The type codes an NSEC at this name must assert, given the node's
/// current contents and the records this run is about to remove
fn bitmap_types(zone: &Zone, name: &Name) -> Vec<u16> {
    let mut types: Vec<u16> = zone
        .node(name)
        .map(|node| node.present_types())
        .unwrap_or_default();
    // the previous chain's state does not survive this rebuild
    types.retain(|t| {
        *t != RecordType::Nsec3Param.to_num() && *t != RecordType::Nsec.to_num()
    });
    types.push(RecordType::Nsec.to_num());
    types.push(RecordType::Rrsig.to_num());
    types.sort_unstable();
    types.dedup();
    types
}

/// Build (or rebuild) the NSEC chain over the zone
///
/// Chain records are signed as they are emitted. When no signing-capable
/// key exists the chain cannot be anchored; construction is skipped and the
/// post-sign audit fails the run.
pub fn build_nsec_chain(ctx: &SignContext<'_>, zone: &Zone) -> SignResult<ZoneDelta> {
    let mut delta = ZoneDelta::default();

    if !ctx.keyring.read().has_active_key(ctx.now) {
        log::warn!(
            "no active signing key for {}; NSEC chain not built",
            ctx.origin
        );
        return Ok(delta);
    }

    let ttl = chain_ttl(ctx, zone)?;
    remove_nsec3_leftovers(zone, &mut delta);

    // the chain covers exactly the active names, in canonical order
    let active: Vec<&Name> = zone
        .iter_main()
        .filter(|(name, _)| zone.is_active(name))
        .map(|(name, _)| name)
        .collect();

    // occluded or vanished names lose their NSEC state
    for (name, node) in zone.iter_main() {
        if zone.is_active(name) {
            continue;
        }
        if let Some(rrset) = node.rrset(RecordType::Nsec) {
            for record in rrset.records() {
                delta.deletions.push(record);
            }
        }
        for sig in node.sigs_covering(RecordType::Nsec) {
            delta.deletions.push(Record::new(
                name.clone(),
                sig.original_ttl,
                Rdata::Rrsig(sig.clone()),
            ));
        }
    }

    for (i, name) in active.iter().enumerate() {
        let next = active[(i + 1) % active.len()];
        let nsec = Nsec {
            next: (*next).clone(),
            types: bitmap_types(zone, name),
        };

        // an unchanged NSEC keeps its record and whatever signature the
        // node pass already settled on
        let existing = zone.node(name).and_then(|n| n.rrset(RecordType::Nsec));
        if let Some(existing) = existing {
            let unchanged = existing.ttl == ttl
                && existing.len() == 1
                && matches!(existing.rdatas.first(), Some(Rdata::Nsec(old)) if *old == nsec);
            if unchanged {
                continue;
            }
            for record in existing.records() {
                delta.deletions.push(record);
            }
            for sig in zone
                .node(name)
                .map(|n| n.sigs_covering(RecordType::Nsec))
                .unwrap_or(&[])
            {
                delta.deletions.push(Record::new(
                    (*name).clone(),
                    sig.original_ttl,
                    Rdata::Rrsig(sig.clone()),
                ));
            }
        }

        let mut rrset = Rrset::new((*name).clone(), RecordType::Nsec, ttl);
        rrset.push(ttl, Rdata::Nsec(nsec));
        delta
            .additions
            .extend(sign_new_rrset(ctx, name, &rrset)?);
        for record in rrset.records() {
            delta.additions.push(record);
        }
        ctx.stats.nsec_emitted.fetch_add(1, Ordering::Release);
    }

    log::debug!(
        "NSEC chain over {} name(s) for {}",
        active.len(),
        ctx.origin
    );
    Ok(delta)
}
