//! Per-node signing policy
//!
//! Decides, for each (name, type), which existing RRSIGs to keep, drop or
//! refresh, and which keys must produce fresh signatures. The decisions are
//! expressed as a delta of record deletions and additions so the walker can
//! serialise them through the shared output buffer.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;

use crate::dns::errors::{CorruptZoneKind, SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{Rdata, Record, RecordType, Rrset, Rrsig};
use crate::dns::zone::{Node, ZoneDelta};
use crate::dnssec::config::SigningConfig;
use crate::dnssec::keyring::{KeyId, Keyring, SigningKey};
use crate::dnssec::signer::{RrsetSigner, SigningStatistics};

/// Shared state threaded through every signing call
///
/// Worker threads hold this by reference; mutation happens only through the
/// atomic counters and the keyring lock.
pub struct SignContext<'a> {
    pub config: &'a SigningConfig,
    pub origin: Name,
    pub keyring: &'a RwLock<Keyring>,
    pub stats: &'a SigningStatistics,
    /// The wall-clock instant this run is signing for
    pub now: u32,
}

impl<'a> SignContext<'a> {
    pub fn new(
        config: &'a SigningConfig,
        origin: Name,
        keyring: &'a RwLock<Keyring>,
        stats: &'a SigningStatistics,
        now: u32,
    ) -> SignContext<'a> {
        SignContext {
            config,
            origin,
            keyring,
            stats,
            now,
        }
    }

    pub fn signer(&self) -> RrsetSigner<'_> {
        RrsetSigner::new(self.config, &self.origin, self.stats)
    }

    pub fn inception(&self) -> u32 {
        self.config.inception(self.now)
    }
}

/// What the state machine decided about one existing signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SigVerdict {
    Keep,
    Drop,
    /// Drop and additionally bar the key from re-signing this RRset in
    /// this pass; malformed windows are never silently regenerated
    DropSuppress,
    /// Drop and re-sign under the same key
    Refresh,
}

/// Whether an RRset of this type gets signed at this node at all
fn should_sign_type(rtype: RecordType, is_apex: bool, is_delegation: bool) -> bool {
    if rtype == RecordType::Rrsig {
        return false;
    }
    if is_delegation {
        // at a cut, only the denial record and the DS hold zone data
        return matches!(
            rtype,
            RecordType::Ds | RecordType::Nsec | RecordType::Nsec3
        );
    }
    let _ = is_apex;
    true
}

/// The keys that must produce signatures for this RRset
///
/// At the origin, DNSKEY/CDS/CDNSKEY are signed by every KSK, and by the
/// ZSKs as well unless `keyset-kskonly` restricts the keyset to KSKs.
/// Everything else is ZSK work; KSKs step in when the KSK flag is advisory
/// or no ZSK is active at all. Revoked keys sign only the DNSKEY RRset.
pub fn keys_for_rrset<'k>(
    config: &SigningConfig,
    ring: &'k Keyring,
    rtype: RecordType,
    is_apex: bool,
    now: u32,
) -> Vec<&'k SigningKey> {
    let signing: Vec<&SigningKey> = ring.iter().filter(|k| k.is_signing(now)).collect();

    let ksks: Vec<&SigningKey> = signing.iter().cloned().filter(|k| k.is_ksk()).collect();
    let zsks: Vec<&SigningKey> = if config.ignore_ksk_flag {
        signing.clone()
    } else {
        signing.iter().cloned().filter(|k| !k.is_ksk()).collect()
    };

    let apex_keyset = is_apex
        && matches!(
            rtype,
            RecordType::Dnskey | RecordType::Cds | RecordType::Cdnskey
        );

    let mut chosen: Vec<&SigningKey> = Vec::new();
    if apex_keyset {
        chosen.extend(ksks.iter().cloned());
        if !config.keyset_kskonly {
            chosen.extend(zsks.iter().cloned());
        }
    } else if !zsks.is_empty() {
        chosen = zsks;
    } else {
        // no active ZSK; the KSKs carry the zone
        chosen = ksks;
    }

    let mut seen: HashSet<KeyId> = HashSet::new();
    chosen.retain(|k| seen.insert(k.id));
    // revoked keys vouch only for the DNSKEY RRset they appear in
    chosen.retain(|k| !k.is_revoked(now) || rtype == RecordType::Dnskey);
    chosen
}

/// Evaluate one existing RRSIG against the state machine
fn judge_sig(
    ctx: &SignContext<'_>,
    ring: &Keyring,
    sig: &Rrsig,
    name: &Name,
    rrset: Option<&Rrset>,
    signing_ids: &HashSet<KeyId>,
    expects_dnskey: bool,
) -> SigVerdict {
    // malformed window: never valid, never replaceable
    if sig.inception >= sig.expiration {
        if ctx.config.resign_expired_compat {
            return SigVerdict::Refresh;
        }
        log::debug!(
            "dropping malformed signature over {} {:?} (inception {} >= expiration {})",
            name,
            sig.type_covered,
            sig.inception,
            sig.expiration
        );
        return SigVerdict::DropSuppress;
    }

    let near_expiry =
        ctx.now.wrapping_add(ctx.config.effective_refresh_window()) >= sig.expiration;
    let future = sig.inception > ctx.now;

    let key = match ring.find_by_tag(sig.key_tag, sig.algorithm) {
        Some(key) => key,
        None => {
            if future {
                // a signature from a key being introduced; leave it alone
                return SigVerdict::Keep;
            }
            if expects_dnskey {
                // the apex keyset is fully known; an unknown tag is junk
                return SigVerdict::Drop;
            }
            if ctx.config.remove_orphan_signatures {
                return SigVerdict::Drop;
            }
            return SigVerdict::Keep;
        }
    };

    if !key.is_signing(ctx.now) && ctx.config.remove_inactive_key_signatures {
        return SigVerdict::Drop;
    }

    if signing_ids.contains(&key.id) {
        if key.is_offline() {
            // cannot re-create what this key signed; keep it
            return SigVerdict::Keep;
        }
        if near_expiry {
            return SigVerdict::Refresh;
        }
        if let Some(rrset) = rrset {
            if sig.original_ttl != rrset.ttl {
                return SigVerdict::Refresh;
            }
            match ctx.signer().verify_rrsig(sig, name, rrset, key) {
                Ok(true) => SigVerdict::Keep,
                Ok(false) | Err(_) => SigVerdict::Refresh,
            }
        } else {
            SigVerdict::Keep
        }
    } else if key.is_publishing(ctx.now) {
        // pre-roll: published but not yet signing
        if near_expiry {
            SigVerdict::Drop
        } else {
            SigVerdict::Keep
        }
    } else if ctx.config.remove_orphan_signatures {
        SigVerdict::Drop
    } else {
        SigVerdict::Keep
    }
}

/// Produce the deletions and additions that leave `node` fully signed
///
/// `name` must not be occluded; the walker routes occluded nodes away from
/// here. Corrupt structures (DS without NS, DNSKEY below the apex) abort
/// the run.
pub fn sign_node(ctx: &SignContext<'_>, name: &Name, node: &Node) -> SignResult<ZoneDelta> {
    let is_apex = *name == ctx.origin;

    if !is_apex && node.has_type(RecordType::Ds) && !node.has_type(RecordType::Ns) {
        return Err(SignError::corrupt(name.clone(), CorruptZoneKind::DsWithoutNs));
    }
    if !is_apex && node.has_type(RecordType::Dnskey) {
        return Err(SignError::corrupt(
            name.clone(),
            CorruptZoneKind::DnskeyBelowApex,
        ));
    }

    let is_delegation = node.is_delegation(is_apex);
    let ring = ctx.keyring.read();
    let mut delta = ZoneDelta::default();

    // signatures over types that are no longer present at all
    for covered in node.covered_types() {
        let rtype = RecordType::from_num(covered);
        if node.has_type(rtype) {
            continue;
        }
        for sig in node.sigs_covering(rtype) {
            delta.deletions.push(sig_record(name, sig));
            ctx.stats.signatures_dropped.fetch_add(1, Ordering::Release);
        }
    }

    for rrset in node.rrsets() {
        let rtype = rrset.rtype;
        let wants_sig = should_sign_type(rtype, is_apex, is_delegation);
        let existing = node.sigs_covering(rtype);

        if !wants_sig {
            for sig in existing {
                delta.deletions.push(sig_record(name, sig));
                ctx.stats.signatures_dropped.fetch_add(1, Ordering::Release);
            }
            continue;
        }

        let signing_keys = keys_for_rrset(ctx.config, &ring, rtype, is_apex, ctx.now);
        let signing_ids: HashSet<KeyId> = signing_keys.iter().map(|k| k.id).collect();
        let expects_dnskey = is_apex && rtype == RecordType::Dnskey;

        // ids of keys whose signature over this RRset survives this pass
        let mut covered_by: HashSet<KeyId> = HashSet::new();
        // keys barred from re-signing this RRset (malformed-window drops)
        let mut suppressed: HashSet<KeyId> = HashSet::new();
        // refreshes re-sign under the same key even when the key would not
        // otherwise be selected anew
        let mut refresh_under: Vec<KeyId> = Vec::new();

        for sig in existing {
            let verdict = judge_sig(
                ctx,
                &ring,
                sig,
                name,
                Some(rrset),
                &signing_ids,
                expects_dnskey,
            );
            match verdict {
                SigVerdict::Keep => {
                    if let Some(key) = ring.find_by_tag(sig.key_tag, sig.algorithm) {
                        covered_by.insert(key.id);
                    }
                    ctx.stats.signatures_retained.fetch_add(1, Ordering::Release);
                }
                SigVerdict::Drop => {
                    delta.deletions.push(sig_record(name, sig));
                    ctx.stats.signatures_dropped.fetch_add(1, Ordering::Release);
                }
                SigVerdict::DropSuppress => {
                    delta.deletions.push(sig_record(name, sig));
                    ctx.stats.signatures_dropped.fetch_add(1, Ordering::Release);
                    if let Some(key) = ring.find_by_tag(sig.key_tag, sig.algorithm) {
                        suppressed.insert(key.id);
                    }
                }
                SigVerdict::Refresh => {
                    delta.deletions.push(sig_record(name, sig));
                    ctx.stats.signatures_dropped.fetch_add(1, Ordering::Release);
                    ctx.stats
                        .signatures_refreshed
                        .fetch_add(1, Ordering::Release);
                    if let Some(key) = ring.find_by_tag(sig.key_tag, sig.algorithm) {
                        refresh_under.push(key.id);
                    }
                }
            }
        }

        let signer = ctx.signer();
        let inception = ctx.inception();
        let expiration = signer.expiration_for(rtype, ctx.now);

        for key in &signing_keys {
            if covered_by.contains(&key.id) || suppressed.contains(&key.id) {
                continue;
            }
            if key.is_offline() {
                // nothing we can do; existing signatures were retained above
                continue;
            }
            // seamless ZSK rollover: while the predecessor's signature
            // still stands, the successor stays quiet
            if let Some(pred) = key.predecessor {
                if covered_by.contains(&pred) {
                    continue;
                }
            }
            let sig = signer.sign_rrset(name, rrset, key, inception, expiration)?;
            covered_by.insert(key.id);
            delta.additions.push(sig_record(name, &sig));
        }

        // refreshed signatures from keys outside the current selection
        // (e.g. retained pre-roll keys with a bad TTL) are re-made as well
        for id in refresh_under {
            if covered_by.contains(&id) || signing_ids.contains(&id) {
                continue;
            }
            if let Some(key) = ring.get(id) {
                if key.is_offline() {
                    continue;
                }
                let sig = signer.sign_rrset(name, rrset, key, inception, expiration)?;
                covered_by.insert(id);
                delta.additions.push(sig_record(name, &sig));
            }
        }
    }

    ctx.stats.nodes_walked.fetch_add(1, Ordering::Release);
    Ok(delta)
}

/// Sign a freshly built RRset (an NSEC, NSEC3 or placeholder) that has no
/// existing signatures; used by the chain engines and the resigner
pub fn sign_new_rrset(
    ctx: &SignContext<'_>,
    name: &Name,
    rrset: &Rrset,
) -> SignResult<Vec<Record>> {
    let ring = ctx.keyring.read();
    let is_apex = *name == ctx.origin;
    let keys = keys_for_rrset(ctx.config, &ring, rrset.rtype, is_apex, ctx.now);
    let signer = ctx.signer();
    let inception = ctx.inception();
    let expiration = signer.expiration_for(rrset.rtype, ctx.now);

    let mut out = Vec::new();
    let mut signed: HashSet<KeyId> = HashSet::new();
    for key in keys {
        if key.is_offline() {
            continue;
        }
        if let Some(pred) = key.predecessor {
            if signed.contains(&pred) {
                continue;
            }
        }
        let sig = signer.sign_rrset(name, rrset, key, inception, expiration)?;
        signed.insert(key.id);
        out.push(sig_record(name, &sig));
    }
    Ok(out)
}

/// Maintain the apex DNSKEY RRset: add publishable keys that are missing,
/// withdraw keys past their delete time
pub fn maintain_dnskey_rrset(ctx: &SignContext<'_>, apex: &Node) -> ZoneDelta {
    let ring = ctx.keyring.read();
    let mut delta = ZoneDelta::default();

    let existing = apex.rrset(RecordType::Dnskey);
    let ttl = ctx
        .config
        .dnskey_ttl
        .or_else(|| existing.map(|s| s.ttl))
        .or_else(|| ctx.config.max_ttl)
        .unwrap_or(3600);

    for key in ring.iter() {
        let dnskey = key.dnskey(ctx.now);
        let published = existing
            .map(|s| s.rdatas.iter().any(|r| matches!(r, Rdata::Dnskey(k) if *k == dnskey)))
            .unwrap_or(false);

        if key.is_publishing(ctx.now) && !key.placeholder {
            if !published {
                log::debug!("publishing DNSKEY tag {} at the apex", key.key_tag);
                delta.additions.push(Record::new(
                    ctx.origin.clone(),
                    ttl,
                    Rdata::Dnskey(dnskey),
                ));
            }
        } else if key.is_removable(ctx.now) && published {
            log::debug!("withdrawing DNSKEY tag {} from the apex", key.key_tag);
            delta.deletions.push(Record::new(
                ctx.origin.clone(),
                existing.map(|s| s.ttl).unwrap_or(ttl),
                Rdata::Dnskey(dnskey),
            ));
        }
    }
    delta
}

fn sig_record(name: &Name, sig: &Rrsig) -> Record {
    Record::new(name.clone(), sig.original_ttl, Rdata::Rrsig(sig.clone()))
}

#[cfg(test)]
#[path = "policy_test.rs"]
mod policy_test;
