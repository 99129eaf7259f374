//! Multi-threaded zone traversal
//!
//! The full-sign path: the apex is processed first on the caller's thread
//! (establishing TTLs and the key RRset signatures the chain engines depend
//! on), then a pool of workers drains a single shared iterator of names.
//! Each worker fully processes one node before asking for the next, merges
//! its output into the shared buffer, and polls the cancel flag in between.
//!
//! Lock order is fixed: walker cursor, then the key-list lock (inside the
//! node policy), then the output buffer. No lock is held across a
//! cryptographic operation on another lock's path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Mutex, RwLock};

use crate::dns::errors::{AuditError, SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{Rdata, RecordType};
use crate::dns::zone::{Zone, ZoneDelta};
use crate::dnssec::config::SigningConfig;
use crate::dnssec::keyring::Keyring;
use crate::dnssec::nsec::build_nsec_chain;
use crate::dnssec::nsec3::{base32hex_encode, build_nsec3_chain};
use crate::dnssec::policy::{keys_for_rrset, maintain_dnskey_rrset, sign_node, SignContext};
use crate::dnssec::signer::SigningStatistics;
use crate::dnssec::sync::{install_delegation_ds, install_sync_records};

/// Walk every non-apex node and sign it, distributing names across
/// `ctx.config.threads` workers
pub fn walk_zone(
    ctx: &SignContext<'_>,
    zone: &Zone,
    cancel: &AtomicBool,
) -> SignResult<ZoneDelta> {
    // apex first, on the caller's thread
    let apex_node = zone
        .node(&ctx.origin)
        .ok_or_else(|| {
            SignError::corrupt(
                ctx.origin.clone(),
                crate::dns::errors::CorruptZoneKind::MissingSoa,
            )
        })?;
    let mut output = sign_node(ctx, &ctx.origin, apex_node)?;

    let names: Vec<Name> = zone
        .iter_main()
        .filter(|(name, _)| **name != ctx.origin)
        .map(|(name, _)| (*name).clone())
        .collect();

    if names.is_empty() {
        return Ok(output);
    }

    let threads = ctx.config.threads.max(1).min(names.len());
    if threads == 1 {
        for name in &names {
            if cancel.load(Ordering::Acquire) {
                return Err(SignError::Cancelled);
            }
            if zone.is_occluded(name) {
                continue;
            }
            if let Some(node) = zone.node(name) {
                output.merge(sign_node(ctx, name, node)?);
            }
        }
        return Ok(output);
    }

    let cursor = Mutex::new(0usize);
    let buffer = Mutex::new(ZoneDelta::default());
    let failure: Mutex<Option<SignError>> = Mutex::new(None);

    thread::scope(|scope| {
        for thread_id in 0..threads {
            let worker_name = format!("zone-signer-{}", thread_id);
            let names = &names;
            let cursor = &cursor;
            let buffer = &buffer;
            let failure = &failure;
            let builder = thread::Builder::new().name(worker_name);
            let _ = builder.spawn_scoped(scope, move || {
                loop {
                    if cancel.load(Ordering::Acquire) {
                        return;
                    }
                    let index = {
                        let mut cursor = cursor.lock();
                        let index = *cursor;
                        *cursor += 1;
                        index
                    };
                    if index >= names.len() {
                        // end of iteration observed; this worker is done
                        return;
                    }
                    if failure.lock().is_some() {
                        return;
                    }
                    let name = &names[index];
                    // occluded nodes are recognised mid-walk and take the
                    // dump-only path: their records pass through unsigned
                    if zone.is_occluded(name) {
                        continue;
                    }
                    let node = match zone.node(name) {
                        Some(node) => node,
                        None => continue,
                    };
                    match sign_node(ctx, name, node) {
                        Ok(delta) => {
                            // one merge per node keeps a node's records
                            // contiguous in the output
                            buffer.lock().merge(delta);
                        }
                        Err(err) => {
                            let mut slot = failure.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            return;
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = failure.into_inner() {
        return Err(err);
    }
    if cancel.load(Ordering::Acquire) {
        return Err(SignError::Cancelled);
    }
    output.merge(buffer.into_inner());
    Ok(output)
}

/// Sign the whole zone: pre-walk mutations, the parallel walk, the denial
/// chain, and the post-sign audit
///
/// The zone is mutated in place; the returned delta is the cumulative
/// change for the downstream serializer. A cancelled run returns
/// `SignError::Cancelled` and the caller discards the output.
pub fn sign_zone(
    config: &SigningConfig,
    zone: &mut Zone,
    keyring: &RwLock<Keyring>,
    stats: &SigningStatistics,
    now: u32,
    cancel: &AtomicBool,
) -> SignResult<ZoneDelta> {
    config.validate()?;

    let origin = zone.origin().clone();
    let ctx = SignContext::new(config, origin.clone(), keyring, stats, now);
    let mut cumulative = ZoneDelta::default();

    // reconcile the key set with what the apex already publishes
    if let Some(apex) = zone.node(&origin) {
        if let Some(dnskeys) = apex.rrset(RecordType::Dnskey) {
            let dnskeys = dnskeys.clone();
            keyring.write().reconcile(&dnskeys);
        }
    }

    // pre-walk mutations, on the control thread only
    let old_soa = zone.soa().cloned();
    zone.update_serial(config.serial_mode, now);
    if let (Some(old_soa), Some(new_soa)) = (old_soa, zone.soa().cloned()) {
        if old_soa != new_soa {
            let ttl = zone.soa_ttl().unwrap_or(3600);
            cumulative
                .deletions
                .push(crate::dns::protocol::Record::new(
                    origin.clone(),
                    ttl,
                    Rdata::Soa(old_soa),
                ));
            cumulative
                .additions
                .push(crate::dns::protocol::Record::new(
                    origin.clone(),
                    ttl,
                    Rdata::Soa(new_soa),
                ));
        }
    }
    if let Some(apex) = zone.node(&origin) {
        let delta = maintain_dnskey_rrset(&ctx, apex);
        zone.apply_delta(&delta);
        cumulative.merge(delta);
    }
    let delta = install_sync_records(&ctx, zone)?;
    zone.apply_delta(&delta);
    cumulative.merge(delta);
    if config.generate_ds {
        let delta = install_delegation_ds(&ctx, zone)?;
        zone.apply_delta(&delta);
        cumulative.merge(delta);
    }

    // the walk
    let delta = walk_zone(&ctx, zone, cancel)?;
    zone.apply_delta(&delta);
    cumulative.merge(delta);

    // the denial chain
    let delta = if config.nsec3.is_some() {
        build_nsec3_chain(&ctx, zone)?
    } else {
        build_nsec_chain(&ctx, zone)?
    };
    zone.apply_delta(&delta);
    cumulative.merge(delta);

    if cancel.load(Ordering::Acquire) {
        return Err(SignError::Cancelled);
    }

    audit_zone(&ctx, zone)?;
    log::info!("zone {} signed: {}", origin, stats.report());
    Ok(cumulative)
}

/// The post-sign audit: every RRset the policy wants signed carries a
/// signature from an active key, and the denial chain closes
pub fn audit_zone(ctx: &SignContext<'_>, zone: &Zone) -> SignResult<()> {
    let ring = ctx.keyring.read();
    let mut unsigned: Vec<(Name, RecordType)> = Vec::new();

    for (name, node) in zone.iter() {
        if !node.nsec3_node && !zone.is_active(name) {
            continue;
        }
        let is_apex = *name == ctx.origin;
        let is_delegation = node.is_delegation(is_apex);
        for rrset in node.rrsets() {
            let rtype = rrset.rtype;
            if rtype == RecordType::Rrsig {
                continue;
            }
            if is_delegation
                && !matches!(rtype, RecordType::Ds | RecordType::Nsec | RecordType::Nsec3)
            {
                continue;
            }
            let wanted = keys_for_rrset(ctx.config, &ring, rtype, is_apex, ctx.now);
            if wanted.is_empty() {
                continue;
            }
            let ok = node.sigs_covering(rtype).iter().any(|sig| {
                sig.inception < sig.expiration
                    && ring
                        .find_by_tag(sig.key_tag, sig.algorithm)
                        .map(|key| key.is_signing(ctx.now) || key.is_offline())
                        .unwrap_or(false)
            });
            if !ok {
                unsigned.push((name.clone(), rtype));
            }
        }
    }

    let chain_intact = if ctx.config.nsec3.is_some() {
        nsec3_chain_closes(ctx, zone)
    } else {
        nsec_chain_closes(ctx, zone)
    };

    if unsigned.is_empty() && chain_intact {
        Ok(())
    } else {
        for (name, rtype) in &unsigned {
            log::error!("audit: {} {:?} is not properly signed", name, rtype);
        }
        if !chain_intact {
            log::error!("audit: the denial chain does not close");
        }
        Err(SignError::AuditFailed(AuditError {
            unsigned,
            chain_intact,
        }))
    }
}

/// Follow `next` pointers from the origin; every active name must be
/// visited exactly once before the walk returns to the origin
fn nsec_chain_closes(ctx: &SignContext<'_>, zone: &Zone) -> bool {
    let active: Vec<&Name> = zone
        .iter_main()
        .filter(|(name, _)| zone.is_active(name))
        .map(|(name, _)| name)
        .collect();
    if active.is_empty() {
        return false;
    }
    let mut current = &ctx.origin;
    for step in 0..active.len() {
        let node = match zone.node(current) {
            Some(node) => node,
            None => return false,
        };
        let nsec = match node.rrset(RecordType::Nsec).and_then(|s| s.rdatas.first()) {
            Some(Rdata::Nsec(nsec)) => nsec,
            _ => return false,
        };
        if *current != *active[step] {
            return false;
        }
        current = &nsec.next;
    }
    *current == ctx.origin
}

/// Sorted NSEC3 owners must cycle under `next-hash`
fn nsec3_chain_closes(ctx: &SignContext<'_>, zone: &Zone) -> bool {
    let mut owners: Vec<(&Name, &[u8])> = Vec::new();
    for (name, node) in zone.iter_nsec3() {
        let nsec3 = match node.rrset(RecordType::Nsec3).and_then(|s| s.rdatas.first()) {
            Some(Rdata::Nsec3(nsec3)) => nsec3,
            _ => return false,
        };
        owners.push((name, &nsec3.next_hashed));
    }
    if owners.is_empty() {
        return false;
    }
    // owner labels are base32hex, which sorts like the hashes themselves
    owners.sort_by(|a, b| a.0.cmp(b.0));
    for (i, (_, next_hashed)) in owners.iter().enumerate() {
        let expected = owners[(i + 1) % owners.len()].0;
        let label = base32hex_encode(next_hashed);
        let pointed = match ctx.origin.child(label.as_bytes()) {
            Ok(name) => name,
            Err(_) => return false,
        };
        if pointed != *expected {
            return false;
        }
    }
    true
}

#[cfg(test)]
#[path = "walker_test.rs"]
mod walker_test;
