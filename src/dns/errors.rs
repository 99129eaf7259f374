//! Error types for signing operations with context and severity information
//!
//! The taxonomy follows the failure model of the signing core: corrupt-zone,
//! cryptographic and policy errors are fatal and unwind to the caller; stale
//! and orphan signatures are local and consumed by policy, so they never
//! appear here.

use std::error::Error;
use std::fmt;
use std::io;

use crate::dns::name::Name;
use crate::dns::protocol::RecordType;

/// Signing operation error with detailed context
#[derive(Debug)]
pub enum SignError {
    /// The input zone violates structural invariants
    CorruptZone(CorruptZoneError),
    /// Signature creation or key initialisation failed
    Crypto(CryptoError),
    /// An option or requested mode is unusable; raised at parse or pre-walk,
    /// never mid-walk
    Policy(PolicyError),
    /// Key file loading failed
    KeyLoad(KeyLoadError),
    /// Two distinct names hashed identically under the chosen NSEC3 salt
    SaltCollision { hash: String },
    /// An incremental update's "old" side does not match the current zone
    DiffConflict(DiffConflictError),
    /// The cancel flag was observed; output must be discarded
    Cancelled,
    /// The post-sign audit found the zone incompletely signed
    AuditFailed(AuditError),
    /// Underlying file I/O (dsset/keyset ingestion)
    Io(io::Error),
}

#[derive(Debug)]
pub struct CorruptZoneError {
    pub name: Name,
    pub kind: CorruptZoneKind,
}

#[derive(Debug)]
pub enum CorruptZoneKind {
    /// DS present without NS
    DsWithoutNs,
    /// DNSKEY at a non-apex name
    DnskeyBelowApex,
    /// The denial chain could not be traced back to the origin
    BrokenChain,
    /// No SOA at the origin
    MissingSoa,
}

#[derive(Debug)]
pub struct CryptoError {
    pub context: String,
    pub source: Option<openssl::error::ErrorStack>,
}

#[derive(Debug)]
pub struct PolicyError {
    pub option: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct KeyLoadError {
    pub key_name: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct DiffConflictError {
    pub name: Name,
    pub rtype: RecordType,
    pub detail: String,
}

#[derive(Debug)]
pub struct AuditError {
    pub unsigned: Vec<(Name, RecordType)>,
    pub chain_intact: bool,
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::CorruptZone(e) => match e.kind {
                CorruptZoneKind::DsWithoutNs => {
                    write!(f, "Corrupt zone: DS without NS at {}", e.name)
                }
                CorruptZoneKind::DnskeyBelowApex => {
                    write!(f, "Corrupt zone: DNSKEY below the apex at {}", e.name)
                }
                CorruptZoneKind::BrokenChain => {
                    write!(f, "Corrupt zone: denial chain broken near {}", e.name)
                }
                CorruptZoneKind::MissingSoa => {
                    write!(f, "Corrupt zone: no SOA at the origin {}", e.name)
                }
            },
            SignError::Crypto(e) => write!(f, "Cryptographic failure: {}", e.context),
            SignError::Policy(e) => {
                write!(f, "Policy error: {} = {} ({})", e.option, e.value, e.reason)
            }
            SignError::KeyLoad(e) => {
                write!(f, "Key load failure for {}: {}", e.key_name, e.reason)
            }
            SignError::SaltCollision { hash } => {
                write!(f, "Duplicate hash {} - choose a different salt", hash)
            }
            SignError::DiffConflict(e) => write!(
                f,
                "Update conflict at {} {:?}: {}",
                e.name, e.rtype, e.detail
            ),
            SignError::Cancelled => write!(f, "Signing was cancelled"),
            SignError::AuditFailed(e) => write!(
                f,
                "Post-sign audit failed: {} unsigned RRset(s), chain intact: {}",
                e.unsigned.len(),
                e.chain_intact
            ),
            SignError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl Error for SignError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SignError::Crypto(e) => e.source.as_ref().map(|s| s as &(dyn Error + 'static)),
            SignError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SignError {
    fn from(err: io::Error) -> Self {
        SignError::Io(err)
    }
}

impl From<openssl::error::ErrorStack> for SignError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        SignError::Crypto(CryptoError {
            context: "OpenSSL operation failed".to_string(),
            source: Some(err),
        })
    }
}

impl SignError {
    pub fn corrupt(name: Name, kind: CorruptZoneKind) -> SignError {
        SignError::CorruptZone(CorruptZoneError { name, kind })
    }

    pub fn crypto(context: &str) -> SignError {
        SignError::Crypto(CryptoError {
            context: context.to_string(),
            source: None,
        })
    }

    pub fn policy(option: &str, value: &str, reason: &str) -> SignError {
        SignError::Policy(PolicyError {
            option: option.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Result type alias for signing operations
pub type SignResult<T> = Result<T, SignError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_corrupt_zone_display() {
        let err = SignError::corrupt(
            Name::from_str("sub.example.com").unwrap(),
            CorruptZoneKind::DsWithoutNs,
        );
        let display = format!("{}", err);
        assert!(display.contains("DS without NS"));
        assert!(display.contains("sub.example.com."));
    }

    #[test]
    fn test_salt_collision_display() {
        let err = SignError::SaltCollision {
            hash: "deadbeef".to_string(),
        };
        assert!(format!("{}", err).contains("Duplicate hash"));
    }

    #[test]
    fn test_policy_display() {
        let err = SignError::policy("sync-records", "cds:99", "unsupported digest type");
        let display = format!("{}", err);
        assert!(display.contains("sync-records"));
        assert!(display.contains("unsupported digest type"));
    }
}
