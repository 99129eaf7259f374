//! Shared helpers for the signing test suites

use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use std::str::FromStr;

use crate::dns::name::Name;
use crate::dns::protocol::{Algorithm, Rdata, RecordType, Rrset};
use crate::dns::errors::SignResult;
use crate::dnssec::keyring::{KeyMaterial, KeySource, KeyTiming, Keyring, SigningKey};

/// Generate a P-256 key pair, returning the private handle and the raw
/// `x || y` public key material as it appears in DNSKEY rdata
pub fn ec_pkey() -> (PKey<Private>, Vec<u8>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let ec = EcKey::generate(&group).unwrap();
    let mut ctx = BigNumContext::new().unwrap();
    let mut x = BigNum::new().unwrap();
    let mut y = BigNum::new().unwrap();
    ec.public_key()
        .affine_coordinates_gfp(&group, &mut x, &mut y, &mut ctx)
        .unwrap();
    let mut public = vec![0u8; 64];
    let xb = x.to_vec();
    let yb = y.to_vec();
    public[32 - xb.len()..32].copy_from_slice(&xb);
    public[64 - yb.len()..].copy_from_slice(&yb);
    (PKey::from_ec_key(ec).unwrap(), public)
}

/// Key material for a fresh P-256 key active since the epoch
pub fn ec_key_material(origin: &Name, flags: u16) -> KeyMaterial {
    let (pkey, public) = ec_pkey();
    KeyMaterial {
        name: origin.clone(),
        algorithm: Algorithm::EcdsaP256Sha256,
        flags,
        public_key: public,
        private: Some(pkey),
        timing: KeyTiming {
            created: Some(0),
            publish: Some(0),
            activate: Some(0),
            inactive: None,
            revoke: None,
            delete: None,
        },
        predecessor_tag: None,
        successor_tag: None,
        force_publish: false,
        force_sign: false,
        hint_remove: false,
        format_revision: 1,
    }
}

pub struct StaticSource(pub Vec<KeyMaterial>);

impl KeySource for StaticSource {
    fn find_matching_keys(&self, _origin: &Name) -> SignResult<Vec<KeyMaterial>> {
        Ok(self.0.clone())
    }
}

/// A keyring loaded from the given materials
pub fn ring_with(origin: &Name, materials: Vec<KeyMaterial>) -> Keyring {
    let mut ring = Keyring::new(origin.clone());
    ring.load(&StaticSource(materials)).unwrap();
    ring
}

/// A single materialised key; flags 256 for a ZSK, 257 for a KSK
pub fn ec_key(origin: &Name, flags: u16) -> SigningKey {
    let ring = ring_with(origin, vec![ec_key_material(origin, flags)]);
    let key = ring.iter().next().unwrap().clone();
    key
}

/// Same, but public-only
pub fn offline_key(origin: &Name, flags: u16) -> SigningKey {
    let mut material = ec_key_material(origin, flags);
    material.private = None;
    let ring = ring_with(origin, vec![material]);
    let key = ring.iter().next().unwrap().clone();
    key
}

/// A one-member A RRset with a fixed address, so signing buffers built for
/// different owners over "the same" data stay comparable
pub fn test_rrset(owner: &str, ttl: u32) -> Rrset {
    let mut rrset = Rrset::new(Name::from_str(owner).unwrap(), RecordType::A, ttl);
    rrset.push(
        ttl,
        Rdata::A {
            addr: "10.0.0.1".parse().unwrap(),
        },
    );
    rrset
}
