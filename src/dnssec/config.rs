//! DNSSEC signing configuration
//!
//! All knobs the signing core recognises, with the string-form option
//! parsing the front-end feeds. Policy violations (unknown digest types,
//! excessive NSEC3 iterations, malformed salts) fail here, at parse time,
//! never mid-walk.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::dns::errors::{SignError, SignResult};
use crate::dns::protocol::DigestType;
use crate::dns::zone::SerialMode;

/// Iteration counts above this are refused unless explicitly overridden;
/// high iteration counts burden validators far more than attackers.
pub const MAX_NSEC3_ITERATIONS: u16 = 150;

/// SHA-1, the only NSEC3 hash algorithm ever deployed
pub const NSEC3_HASH_SHA1: u8 = 1;

/// NSEC3 chain parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nsec3Config {
    /// Hash algorithm (1 = SHA-1)
    pub hash_algorithm: u8,
    /// Extra hash iterations
    pub iterations: u16,
    /// `None` for the `-` spelling, `Some(vec![])` for an explicit empty
    /// hex string. Both hash identically; the distinction round-trips.
    pub salt: Option<Vec<u8>>,
    /// Omit insecure delegations from the chain
    pub opt_out: bool,
}

impl Nsec3Config {
    /// Parse the salt spelling used in option strings and zone files:
    /// `-` means no salt, otherwise an even-length hex string.
    pub fn parse_salt(s: &str) -> SignResult<Option<Vec<u8>>> {
        if s == "-" {
            return Ok(None);
        }
        hex::decode(s)
            .map(Some)
            .map_err(|_| SignError::policy("nsec3 salt", s, "not a hex string"))
    }

    /// The salt bytes fed into hashing; both spellings of "no salt" are
    /// empty here
    pub fn salt_bytes(&self) -> &[u8] {
        self.salt.as_deref().unwrap_or(&[])
    }

    /// Render the salt in its original spelling
    pub fn salt_display(&self) -> String {
        match &self.salt {
            None => "-".to_string(),
            Some(bytes) => hex::encode(bytes),
        }
    }
}

/// Which synchronisation records to publish at the apex
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecordsPolicy {
    pub cdnskey: bool,
    pub cds_digests: Vec<DigestType>,
}

impl SyncRecordsPolicy {
    /// Parse the comma-separated policy string: `cdnskey` and
    /// `cds:<digest-algorithm>` tokens. An empty string suppresses both
    /// record types. Unknown tokens and digest types are fatal.
    pub fn parse(s: &str) -> SignResult<SyncRecordsPolicy> {
        let mut policy = SyncRecordsPolicy::default();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token.eq_ignore_ascii_case("cdnskey") {
                policy.cdnskey = true;
            } else if let Some(digest) = token.strip_prefix("cds:") {
                let num: u8 = digest.parse().map_err(|_| {
                    SignError::policy("sync-records", token, "digest type is not a number")
                })?;
                let dt = DigestType::from_num(num).ok_or_else(|| {
                    SignError::policy("sync-records", token, "unsupported digest type")
                })?;
                if !policy.cds_digests.contains(&dt) {
                    policy.cds_digests.push(dt);
                }
            } else {
                return Err(SignError::policy("sync-records", token, "unknown token"));
            }
        }
        Ok(policy)
    }

    pub fn is_empty(&self) -> bool {
        !self.cdnskey && self.cds_digests.is_empty()
    }
}

/// DNSSEC zone signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// How to bump the SOA serial on output
    pub serial_mode: SerialMode,
    /// Cap all record TTLs when outputting
    pub max_ttl: Option<u32>,
    /// TTL for newly added DNSKEYs; the existing RRset TTL otherwise
    pub dnskey_ttl: Option<u32>,
    /// Expiry randomisation bound, seconds
    pub jitter: u32,
    /// Refresh a signature when its expiry is within this of now;
    /// defaults to a quarter of the signature validity
    pub refresh_window: Option<u32>,
    /// Nominal lifetime of new RRSIGs, seconds
    pub signature_validity: u32,
    /// Separate lifetime for DNSKEY RRSIGs
    pub dnskey_validity: Option<u32>,
    /// Separate lifetime for the SOA RRSIG
    pub soa_validity: Option<u32>,
    /// Explicit inception override, epoch seconds
    pub start_time: Option<u32>,
    /// Explicit expiration override
    pub end_time: Option<u32>,
    /// Explicit DNSKEY expiration override
    pub dnskey_end_time: Option<u32>,
    /// NSEC3 parameters; `None` means an NSEC chain
    pub nsec3: Option<Nsec3Config>,
    /// Sign DNSKEY/CDS/CDNSKEY at the apex with KSKs only
    pub keyset_kskonly: bool,
    /// Treat the KSK flag as advisory
    pub ignore_ksk_flag: bool,
    /// Drop RRSIGs made by keys we do not know
    pub remove_orphan_signatures: bool,
    /// Drop RRSIGs made by keys no longer active
    pub remove_inactive_key_signatures: bool,
    /// CDS/CDNSKEY publication policy
    pub sync_records: SyncRecordsPolicy,
    /// Install DS records from dsset/keyset files at delegations
    pub generate_ds: bool,
    /// Where dsset/keyset files live
    pub dsset_dir: Option<PathBuf>,
    /// Worker threads for the full-sign walk
    pub threads: usize,
    /// Self-verify each signature after creation
    pub verify_signatures: bool,
    /// Regenerate RRSIGs whose inception is at or past their expiration
    /// instead of dropping them
    pub resign_expired_compat: bool,
    /// Permit NSEC3 iteration counts past the protocol-wide maximum
    pub allow_high_iterations: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            serial_mode: SerialMode::Increment,
            max_ttl: None,
            dnskey_ttl: None,
            jitter: 0,
            refresh_window: None,
            signature_validity: 30 * 24 * 60 * 60, // 30 days
            dnskey_validity: None,
            soa_validity: None,
            start_time: None,
            end_time: None,
            dnskey_end_time: None,
            nsec3: None,
            keyset_kskonly: false,
            ignore_ksk_flag: false,
            remove_orphan_signatures: false,
            remove_inactive_key_signatures: false,
            sync_records: SyncRecordsPolicy::default(),
            generate_ds: false,
            dsset_dir: None,
            threads: default_threads(),
            verify_signatures: true,
            resign_expired_compat: false,
            allow_high_iterations: false,
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl SigningConfig {
    /// Signature inception: the explicit start time, or an hour before now
    /// to absorb validator clock skew
    pub fn inception(&self, now: u32) -> u32 {
        self.start_time.unwrap_or_else(|| now.saturating_sub(3600))
    }

    /// Expiration for ordinary RRsets
    pub fn rr_expiration(&self, now: u32) -> u32 {
        self.end_time
            .unwrap_or_else(|| now.wrapping_add(self.signature_validity))
    }

    /// Expiration for the DNSKEY RRset
    pub fn dnskey_expiration(&self, now: u32) -> u32 {
        match self.dnskey_end_time {
            Some(t) => t,
            None => now.wrapping_add(self.dnskey_validity.unwrap_or(self.signature_validity)),
        }
    }

    /// Expiration for the SOA RRset
    pub fn soa_expiration(&self, now: u32) -> u32 {
        match self.soa_validity {
            Some(v) => now.wrapping_add(v),
            None => self.rr_expiration(now),
        }
    }

    /// The effective refresh window
    pub fn effective_refresh_window(&self) -> u32 {
        self.refresh_window
            .unwrap_or(self.signature_validity / 4)
    }

    /// Cap a TTL at the configured maximum
    pub fn capped_ttl(&self, ttl: u32) -> u32 {
        match self.max_ttl {
            Some(max) => ttl.min(max),
            None => ttl,
        }
    }

    /// Validate cross-option constraints; called once before any walk
    pub fn validate(&self) -> SignResult<()> {
        if let Some(nsec3) = &self.nsec3 {
            if nsec3.hash_algorithm != NSEC3_HASH_SHA1 {
                return Err(SignError::policy(
                    "nsec3",
                    &nsec3.hash_algorithm.to_string(),
                    "unknown hash algorithm",
                ));
            }
            if nsec3.iterations > MAX_NSEC3_ITERATIONS && !self.allow_high_iterations {
                return Err(SignError::policy(
                    "nsec3",
                    &nsec3.iterations.to_string(),
                    "iteration count exceeds the protocol maximum",
                ));
            }
        }
        if self.jitter >= self.signature_validity && self.signature_validity > 0 {
            return Err(SignError::policy(
                "jitter",
                &self.jitter.to_string(),
                "jitter must be smaller than the signature validity",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_config_default() {
        let config = SigningConfig::default();
        assert_eq!(config.serial_mode, SerialMode::Increment);
        assert_eq!(config.signature_validity, 2_592_000);
        assert!(config.nsec3.is_none());
        assert!(config.verify_signatures);
        assert!(!config.resign_expired_compat);
        assert!(config.threads >= 1);
    }

    #[test]
    fn test_refresh_window_defaults_to_quarter_validity() {
        let mut config = SigningConfig::default();
        assert_eq!(config.effective_refresh_window(), 2_592_000 / 4);
        config.refresh_window = Some(86_400);
        assert_eq!(config.effective_refresh_window(), 86_400);
    }

    #[test]
    fn test_expiration_windows() {
        let config = SigningConfig {
            signature_validity: 1000,
            dnskey_validity: Some(2000),
            soa_validity: Some(500),
            ..SigningConfig::default()
        };
        assert_eq!(config.rr_expiration(100), 1100);
        assert_eq!(config.dnskey_expiration(100), 2100);
        assert_eq!(config.soa_expiration(100), 600);
        // explicit end times win
        let config = SigningConfig {
            end_time: Some(42),
            dnskey_end_time: Some(43),
            ..config
        };
        assert_eq!(config.rr_expiration(100), 42);
        assert_eq!(config.dnskey_expiration(100), 43);
    }

    #[test]
    fn test_inception_absorbs_clock_skew() {
        let config = SigningConfig::default();
        assert_eq!(config.inception(10_000), 6_400);
        let config = SigningConfig {
            start_time: Some(9_999),
            ..SigningConfig::default()
        };
        assert_eq!(config.inception(10_000), 9_999);
    }

    #[test]
    fn test_sync_records_parse() {
        let policy = SyncRecordsPolicy::parse("cdnskey,cds:2").unwrap();
        assert!(policy.cdnskey);
        assert_eq!(policy.cds_digests, vec![DigestType::Sha256]);

        // duplicates collapse
        let policy = SyncRecordsPolicy::parse("cds:2, cds:2, cds:4").unwrap();
        assert_eq!(
            policy.cds_digests,
            vec![DigestType::Sha256, DigestType::Sha384]
        );

        // empty suppresses both
        let policy = SyncRecordsPolicy::parse("").unwrap();
        assert!(policy.is_empty());

        // unsupported digest is fatal
        assert!(SyncRecordsPolicy::parse("cds:99").is_err());
        assert!(SyncRecordsPolicy::parse("bogus").is_err());
    }

    #[test]
    fn test_salt_parsing_preserves_spelling() {
        assert_eq!(Nsec3Config::parse_salt("-").unwrap(), None);
        assert_eq!(Nsec3Config::parse_salt("").unwrap(), Some(vec![]));
        assert_eq!(
            Nsec3Config::parse_salt("ab01").unwrap(),
            Some(vec![0xab, 0x01])
        );
        assert!(Nsec3Config::parse_salt("xyz").is_err());

        let none = Nsec3Config {
            hash_algorithm: NSEC3_HASH_SHA1,
            iterations: 0,
            salt: None,
            opt_out: false,
        };
        let empty = Nsec3Config { salt: Some(vec![]), ..none.clone() };
        // both hash identically but render differently
        assert_eq!(none.salt_bytes(), empty.salt_bytes());
        assert_eq!(none.salt_display(), "-");
        assert_eq!(empty.salt_display(), "");
    }

    #[test]
    fn test_iteration_cap() {
        let config = SigningConfig {
            nsec3: Some(Nsec3Config {
                hash_algorithm: NSEC3_HASH_SHA1,
                iterations: MAX_NSEC3_ITERATIONS + 1,
                salt: None,
                opt_out: false,
            }),
            ..SigningConfig::default()
        };
        assert!(config.validate().is_err());
        let config = SigningConfig {
            allow_high_iterations: true,
            ..config
        };
        assert!(config.validate().is_ok());
    }
}
