//! Signs one RRset under one key
//!
//! Builds the canonical signing buffer (RRSIG rdata prefix followed by the
//! RRset members in canonical order), selects the validity window with
//! jitter, and produces the signature bytes in DNSSEC wire form. ECDSA
//! signatures come out of OpenSSL DER-encoded and are repacked as the
//! fixed-width `r || s` concatenation the wire format requires.

use std::sync::atomic::{AtomicU64, Ordering};

use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::sign::{Signer, Verifier};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::dns::errors::{SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{Algorithm, Rdata, Record, RecordType, Rrset, Rrsig};
use crate::dnssec::config::SigningConfig;
use crate::dnssec::keyring::SigningKey;

/// Signing statistics, shared across worker threads
#[derive(Debug, Default)]
pub struct SigningStatistics {
    pub signatures_created: AtomicU64,
    pub signatures_retained: AtomicU64,
    pub signatures_dropped: AtomicU64,
    pub signatures_refreshed: AtomicU64,
    pub verify_successes: AtomicU64,
    pub verify_failures: AtomicU64,
    pub nodes_walked: AtomicU64,
    pub nsec_emitted: AtomicU64,
    pub nsec3_emitted: AtomicU64,
}

/// A point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub signatures_created: u64,
    pub signatures_retained: u64,
    pub signatures_dropped: u64,
    pub signatures_refreshed: u64,
    pub verify_successes: u64,
    pub verify_failures: u64,
    pub nodes_walked: u64,
    pub nsec_emitted: u64,
    pub nsec3_emitted: u64,
}

impl SigningStatistics {
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            signatures_created: self.signatures_created.load(Ordering::Acquire),
            signatures_retained: self.signatures_retained.load(Ordering::Acquire),
            signatures_dropped: self.signatures_dropped.load(Ordering::Acquire),
            signatures_refreshed: self.signatures_refreshed.load(Ordering::Acquire),
            verify_successes: self.verify_successes.load(Ordering::Acquire),
            verify_failures: self.verify_failures.load(Ordering::Acquire),
            nodes_walked: self.nodes_walked.load(Ordering::Acquire),
            nsec_emitted: self.nsec_emitted.load(Ordering::Acquire),
            nsec3_emitted: self.nsec3_emitted.load(Ordering::Acquire),
        }
    }

    /// One-line summary for the front-end's log
    pub fn report(&self) -> String {
        let snap = self.snapshot();
        format!(
            "signed {} rrset(s), retained {}, dropped {}, refreshed {}, verify {}/{} ok, {} node(s)",
            snap.signatures_created,
            snap.signatures_retained,
            snap.signatures_dropped,
            snap.signatures_refreshed,
            snap.verify_successes,
            snap.verify_successes + snap.verify_failures,
            snap.nodes_walked
        )
    }
}

fn digest_for(algorithm: Algorithm) -> SignResult<Option<MessageDigest>> {
    match algorithm {
        Algorithm::RsaSha256 | Algorithm::EcdsaP256Sha256 => Ok(Some(MessageDigest::sha256())),
        Algorithm::RsaSha512 => Ok(Some(MessageDigest::sha512())),
        Algorithm::EcdsaP384Sha384 => Ok(Some(MessageDigest::sha384())),
        Algorithm::Ed25519 => Ok(None),
        Algorithm::Unknown(num) => Err(SignError::crypto(&format!(
            "cannot sign with unsupported algorithm {}",
            num
        ))),
    }
}

/// ECDSA coordinate width in octets, or `None` for non-ECDSA algorithms
fn ecdsa_width(algorithm: Algorithm) -> Option<usize> {
    match algorithm {
        Algorithm::EcdsaP256Sha256 => Some(32),
        Algorithm::EcdsaP384Sha384 => Some(48),
        _ => None,
    }
}

fn ecdsa_der_to_raw(der: &[u8], width: usize) -> SignResult<Vec<u8>> {
    let sig = EcdsaSig::from_der(der)?;
    let r = sig.r().to_vec();
    let s = sig.s().to_vec();
    if r.len() > width || s.len() > width {
        return Err(SignError::crypto("ECDSA component exceeds coordinate width"));
    }
    let mut out = vec![0u8; width * 2];
    out[width - r.len()..width].copy_from_slice(&r);
    out[2 * width - s.len()..].copy_from_slice(&s);
    Ok(out)
}

fn ecdsa_raw_to_der(raw: &[u8], width: usize) -> SignResult<Vec<u8>> {
    if raw.len() != width * 2 {
        return Err(SignError::crypto("ECDSA signature has the wrong length"));
    }
    let r = BigNum::from_slice(&raw[..width])?;
    let s = BigNum::from_slice(&raw[width..])?;
    Ok(EcdsaSig::from_private_components(r, s)?.to_der()?)
}

/// The per-RRset signer
///
/// Stateless apart from the shared statistics; safe to call from any number
/// of worker threads at once.
pub struct RrsetSigner<'a> {
    config: &'a SigningConfig,
    origin: &'a Name,
    stats: &'a SigningStatistics,
}

impl<'a> RrsetSigner<'a> {
    pub fn new(
        config: &'a SigningConfig,
        origin: &'a Name,
        stats: &'a SigningStatistics,
    ) -> RrsetSigner<'a> {
        RrsetSigner {
            config,
            origin,
            stats,
        }
    }

    pub fn stats(&self) -> &SigningStatistics {
        self.stats
    }

    /// The jittered expiration for an RRset of this type at `now`
    pub fn expiration_for(&self, rtype: RecordType, now: u32) -> u32 {
        let nominal = match rtype {
            RecordType::Dnskey => self.config.dnskey_expiration(now),
            RecordType::Soa => self.config.soa_expiration(now),
            _ => self.config.rr_expiration(now),
        };
        if self.config.jitter > 0 {
            let fuzz = rand::thread_rng().gen_range(0, self.config.jitter);
            nominal.saturating_sub(fuzz)
        } else {
            nominal
        }
    }

    /// Sign one RRset under one key over the given validity window
    ///
    /// Cryptographic failure is fatal. The caller is responsible for
    /// skipping offline keys; reaching this without private material is an
    /// error.
    pub fn sign_rrset(
        &self,
        name: &Name,
        rrset: &Rrset,
        key: &SigningKey,
        inception: u32,
        expiration: u32,
    ) -> SignResult<Rrsig> {
        let private = key.private().ok_or_else(|| {
            SignError::crypto(&format!(
                "key tag {} has no private material",
                key.key_tag
            ))
        })?;

        let mut sig = Rrsig {
            type_covered: rrset.rtype,
            algorithm: key.algorithm,
            labels: name.rrsig_label_count(),
            original_ttl: rrset.ttl,
            expiration,
            inception,
            key_tag: key.key_tag,
            signer_name: self.origin.clone(),
            signature: Vec::new(),
        };

        let data = signing_buffer(&sig, name, rrset);

        let raw = match digest_for(key.algorithm)? {
            Some(digest) => {
                let mut signer = Signer::new(digest, private)?;
                signer.update(&data)?;
                let out = signer.sign_to_vec()?;
                match ecdsa_width(key.algorithm) {
                    Some(width) => ecdsa_der_to_raw(&out, width)?,
                    None => out,
                }
            }
            None => {
                let mut signer = Signer::new_without_digest(private)?;
                signer.sign_oneshot_to_vec(&data)?
            }
        };
        sig.signature = raw;

        if self.config.verify_signatures {
            match self.verify_rrsig(&sig, name, rrset, key) {
                Ok(true) => {
                    self.stats.verify_successes.fetch_add(1, Ordering::Release);
                }
                Ok(false) | Err(_) => {
                    // a failed self-check is suspicious but not fatal
                    self.stats.verify_failures.fetch_add(1, Ordering::Release);
                    log::warn!(
                        "self-verification failed for {} {:?} under key tag {}",
                        name,
                        rrset.rtype,
                        key.key_tag
                    );
                }
            }
        }

        self.stats.signatures_created.fetch_add(1, Ordering::Release);
        log::debug!(
            "signed {} {:?} with key tag {} (expires {})",
            name,
            rrset.rtype,
            key.key_tag,
            expiration
        );
        Ok(sig)
    }

    /// Check an RRSIG we hold the key for against the current RRset.
    /// Wildcard-expanded owners verify against the wildcard's label count.
    pub fn verify_rrsig(
        &self,
        sig: &Rrsig,
        name: &Name,
        rrset: &Rrset,
        key: &SigningKey,
    ) -> SignResult<bool> {
        let pkey = match key.private() {
            Some(p) => p,
            // public-only keys cannot be checked here; the caller retains
            None => return Ok(true),
        };
        let data = signing_buffer(sig, name, rrset);
        let result = match digest_for(key.algorithm)? {
            Some(digest) => {
                let wire_sig = match ecdsa_width(key.algorithm) {
                    Some(width) => ecdsa_raw_to_der(&sig.signature, width)?,
                    None => sig.signature.clone(),
                };
                let mut verifier = Verifier::new(digest, pkey)?;
                verifier.update(&data)?;
                verifier.verify(&wire_sig)?
            }
            None => {
                let mut verifier = Verifier::new_without_digest(pkey)?;
                verifier.verify_oneshot(&sig.signature, &data)?
            }
        };
        Ok(result)
    }
}

/// The exact octet sequence the signature covers: the RRSIG rdata up to and
/// excluding the signature field, then each member RR in canonical form and
/// canonical order. For wildcard-expanded owners the original wildcard name
/// is reconstructed from the label count.
pub fn signing_buffer(sig: &Rrsig, name: &Name, rrset: &Rrset) -> Vec<u8> {
    let mut data = sig.to_prefix_wire();

    let owner = if (sig.labels as usize) < name.label_count() {
        name.suffix(sig.labels as usize).wildcard_child()
    } else {
        name.clone()
    };

    let mut sorted: Vec<&Rdata> = rrset.rdatas.iter().collect();
    sorted.sort_by(|a, b| crate::dns::protocol::canonical_rdata_cmp(a, b));
    for rdata in sorted {
        let record = Record::new(owner.clone(), sig.original_ttl, (*rdata).clone());
        data.extend_from_slice(&record.to_canonical_wire(sig.original_ttl));
    }
    data
}
