//! NSEC3 chain construction
//!
//! Hashes every active name (and a speculative wildcard child per name),
//! synthesises empty non-terminals from the closest-encloser walk, sorts
//! the hash list, and emits NSEC3 records whose next-hash pointers close
//! the cycle. Two distinct names landing on the same hash is a salt
//! collision and aborts the build.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use sha1::{Digest, Sha1};

use crate::dns::errors::{SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{Nsec3, Nsec3Param, Rdata, Record, RecordType, Rrset};
use crate::dns::zone::{Zone, ZoneDelta};
use crate::dnssec::config::Nsec3Config;
use crate::dnssec::nsec::chain_ttl;
use crate::dnssec::policy::{sign_new_rrset, SignContext};

/// SHA-1 output width, the only deployed NSEC3 hash size
pub const NSEC3_HASH_LEN: usize = 20;

/// The base32hex alphabet (RFC 4648, extended hex), as NSEC3 owner labels
/// use it
const BASE32HEX: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Encode bytes as unpadded base32hex
pub fn base32hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32HEX[((buffer >> bits) & 0x1F) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32HEX[((buffer << (5 - bits)) & 0x1F) as usize] as char);
    }
    out
}

/// The iterated NSEC3 hash (RFC 5155 section 5): SHA-1 over the canonical
/// wire name and salt, re-hashed `iterations` more times
pub fn nsec3_hash(name: &Name, salt: &[u8], iterations: u16) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(name.to_canonical_wire());
    hasher.update(salt);
    let mut hash = hasher.finalize().to_vec();
    for _ in 0..iterations {
        let mut hasher = Sha1::new();
        hasher.update(&hash);
        hasher.update(salt);
        hash = hasher.finalize().to_vec();
    }
    hash
}

/// One hash list entry. The speculative flag marks wildcard-prediction
/// entries, which take part in sorting but are neither emitted nor allowed
/// to trigger collision failures.
#[derive(Debug, Clone)]
struct HashEntry {
    hash: Vec<u8>,
    name: Name,
    speculative: bool,
}

/// Duplicate non-speculative hashes over distinct names are fatal. The
/// input must be hash-sorted; speculative entries in between do not mask a
/// collision.
fn check_collisions(entries: &[HashEntry]) -> SignResult<()> {
    let reals: Vec<&HashEntry> = entries.iter().filter(|e| !e.speculative).collect();
    for pair in reals.windows(2) {
        if pair[0].hash == pair[1].hash && pair[0].name != pair[1].name {
            return Err(SignError::SaltCollision {
                hash: hex::encode(&pair[0].hash),
            });
        }
    }
    Ok(())
}

/// True if the name is a delegation point without a DS RRset
fn is_insecure_delegation(zone: &Zone, name: &Name) -> bool {
    match zone.node(name) {
        Some(node) => {
            node.is_delegation(name == zone.origin()) && !node.has_type(RecordType::Ds)
        }
        None => false,
    }
}

/// The type codes the NSEC3 for this original name asserts. Empty
/// non-terminals assert nothing; unsigned delegations assert their NS but
/// no RRSIG.
fn bitmap_types(zone: &Zone, name: &Name, is_apex: bool) -> Vec<u16> {
    let node = match zone.node(name) {
        Some(node) => node,
        None => return Vec::new(), // empty non-terminal
    };
    let mut types = node.present_types();
    types.retain(|t| *t != RecordType::Nsec.to_num());
    if is_apex && !types.contains(&RecordType::Nsec3Param.to_num()) {
        // installed by this very run
        types.push(RecordType::Nsec3Param.to_num());
    }
    let delegation = node.is_delegation(is_apex);
    let signed = !delegation || node.has_type(RecordType::Ds);
    if signed {
        types.push(RecordType::Rrsig.to_num());
    }
    types.sort_unstable();
    types.dedup();
    types
}

/// Remove a previous NSEC chain in its entirety
fn remove_nsec_leftovers(zone: &Zone, delta: &mut ZoneDelta) {
    for (name, node) in zone.iter_main() {
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
}

/// Build (or repair) the NSEC3 chain over the zone
pub fn build_nsec3_chain(ctx: &SignContext<'_>, zone: &Zone) -> SignResult<ZoneDelta> {
    let params = match &ctx.config.nsec3 {
        Some(params) => params.clone(),
        None => {
            return Err(SignError::policy(
                "nsec3",
                "(unset)",
                "NSEC3 chain requested without parameters",
            ))
        }
    };

    {
        let ring = ctx.keyring.read();
        let signing = ring.signing_keys(ctx.now);
        if !signing.is_empty() && signing.iter().all(|k| !k.algorithm.supports_nsec3()) {
            return Err(SignError::policy(
                "nsec3",
                "(keys)",
                "every signing key uses an NSEC-only algorithm",
            ));
        }
        if !ring.has_active_key(ctx.now) {
            log::warn!(
                "no active signing key for {}; NSEC3 chain not built",
                ctx.origin
            );
            return Ok(ZoneDelta::default());
        }
    }

    let ttl = chain_ttl(ctx, zone)?;
    let salt = params.salt_bytes().to_vec();
    let mut delta = ZoneDelta::default();
    remove_nsec_leftovers(zone, &mut delta);

    // names covered by the chain, in canonical order; with opt-out on,
    // insecure delegations stay outside
    let included: Vec<Name> = zone
        .iter_main()
        .filter(|(name, _)| zone.is_active(name))
        .filter(|(name, _)| !(params.opt_out && is_insecure_delegation(zone, name)))
        .map(|(name, _)| (*name).clone())
        .collect();

    let mut entries: Vec<HashEntry> = Vec::with_capacity(included.len() * 2);
    for name in &included {
        entries.push(HashEntry {
            hash: nsec3_hash(name, &salt, params.iterations),
            name: name.clone(),
            speculative: false,
        });
        // predict the wildcard child so a colliding owner is caught before
        // it can be synthesised at query time
        let wildcard = name.wildcard_child();
        if zone.node(&wildcard).is_none() {
            entries.push(HashEntry {
                hash: nsec3_hash(&wildcard, &salt, params.iterations),
                name: wildcard,
                speculative: true,
            });
        }
    }

    // empty non-terminals: ancestors of each included name that are not
    // themselves nodes, found by the closest-encloser walk against the
    // previous included name
    let origin_labels = ctx.origin.label_count();
    for window in included.windows(2) {
        let (prev, cur) = (&window[0], &window[1]);
        let common = prev.common_label_count(cur);
        let mut depth = cur.label_count() - 1;
        while depth > common && depth > origin_labels {
            let encloser = cur.suffix(depth);
            if zone.node(&encloser).is_none() {
                entries.push(HashEntry {
                    hash: nsec3_hash(&encloser, &salt, params.iterations),
                    name: encloser,
                    speculative: false,
                });
            }
            depth -= 1;
        }
    }

    entries.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.speculative.cmp(&b.speculative)));
    entries.dedup_by(|a, b| a.hash == b.hash && a.name == b.name);
    check_collisions(&entries)?;

    let emitted: Vec<&HashEntry> = entries.iter().filter(|e| !e.speculative).collect();
    let flags = if params.opt_out { 0x01 } else { 0x00 };

    // what the chain should look like, keyed by hashed owner
    let mut desired: BTreeMap<Name, Nsec3> = BTreeMap::new();
    for (i, entry) in emitted.iter().enumerate() {
        let next = &emitted[(i + 1) % emitted.len()];
        let owner_label = base32hex_encode(&entry.hash);
        let owner = ctx
            .origin
            .child(owner_label.as_bytes())
            .map_err(|_| SignError::crypto("hashed owner name overflows the wire limit"))?;
        let is_apex = entry.name == ctx.origin;
        desired.insert(
            owner,
            Nsec3 {
                hash_algorithm: params.hash_algorithm,
                flags,
                iterations: params.iterations,
                salt: salt.clone(),
                next_hashed: next.hash.clone(),
                types: bitmap_types(zone, &entry.name, is_apex),
            },
        );
    }

    // retire NSEC3 records that no longer correspond to a hash entry or
    // that were built under different parameters
    for (name, node) in zone.iter_nsec3() {
        let keep = match (node.rrset(RecordType::Nsec3), desired.get(name)) {
            (Some(existing), Some(wanted)) => {
                existing.ttl == ttl
                    && existing.len() == 1
                    && matches!(existing.rdatas.first(), Some(Rdata::Nsec3(old)) if old == wanted)
            }
            _ => false,
        };
        if keep {
            // the record survives; its signature may still be due
            let refresh = ctx.config.effective_refresh_window();
            let sigs = node.sigs_covering(RecordType::Nsec3);
            let lapsing = sigs.is_empty()
                || sigs.iter().all(|s| {
                    s.inception >= s.expiration
                        || ctx.now.wrapping_add(refresh) >= s.expiration
                });
            if lapsing {
                for sig in sigs {
                    delta.deletions.push(Record::new(
                        name.clone(),
                        sig.original_ttl,
                        Rdata::Rrsig(sig.clone()),
                    ));
                }
                if let Some(rrset) = node.rrset(RecordType::Nsec3) {
                    delta.additions.extend(sign_new_rrset(ctx, name, rrset)?);
                }
            }
            desired.remove(name);
            continue;
        }
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

    for (owner, nsec3) in desired {
        let mut rrset = Rrset::new(owner.clone(), RecordType::Nsec3, ttl);
        rrset.push(ttl, Rdata::Nsec3(nsec3));
        delta.additions.extend(sign_new_rrset(ctx, &owner, &rrset)?);
        for record in rrset.records() {
            delta.additions.push(record);
        }
        ctx.stats.nsec3_emitted.fetch_add(1, Ordering::Release);
    }

    install_nsec3param(ctx, zone, &params, &mut delta)?;

    log::debug!(
        "NSEC3 chain over {} name(s) for {} (iterations {}, salt {})",
        emitted.len(),
        ctx.origin,
        params.iterations,
        params.salt_display()
    );
    Ok(delta)
}

/// Put the NSEC3PARAM for the current chain at the apex, dropping any
/// stale parameter sets
fn install_nsec3param(
    ctx: &SignContext<'_>,
    zone: &Zone,
    params: &Nsec3Config,
    delta: &mut ZoneDelta,
) -> SignResult<()> {
    let wanted = Nsec3Param {
        hash_algorithm: params.hash_algorithm,
        // NSEC3PARAM flags are always zero; opt-out lives on the records
        flags: 0,
        iterations: params.iterations,
        salt: params.salt_bytes().to_vec(),
    };

    let apex = zone.node(zone.origin());
    let existing = apex.and_then(|n| n.rrset(RecordType::Nsec3Param));
    let mut already_present = false;
    if let Some(existing) = existing {
        for record in existing.records() {
            match &record.rdata {
                Rdata::Nsec3Param(p) if *p == wanted => already_present = true,
                _ => delta.deletions.push(record),
            }
        }
    }
    if !already_present {
        let record = Record::new(ctx.origin.clone(), 0, Rdata::Nsec3Param(wanted));
        let mut rrset = Rrset::new(ctx.origin.clone(), RecordType::Nsec3Param, 0);
        rrset.push(0, record.rdata.clone());
        delta
            .additions
            .extend(sign_new_rrset(ctx, &ctx.origin, &rrset)?);
        delta.additions.push(record);
    }
    Ok(())
}

#[cfg(test)]
#[path = "nsec3_test.rs"]
mod nsec3_test;
