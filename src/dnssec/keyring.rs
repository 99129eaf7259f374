//! The active key set
//!
//! Materialises signing keys from an external source, classifies them by
//! role, and tracks lifecycle windows and rollover links. Keys live in an
//! arena indexed by stable id; predecessor and successor fields hold ids,
//! never references.

use std::collections::HashMap;

use openssl::pkey::{PKey, Private};

use crate::dns::errors::{KeyLoadError, SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{
    Algorithm, Dnskey, Rdata, Rrset, DNSKEY_FLAG_REVOKE, DNSKEY_FLAG_SEP, DNSKEY_FLAG_ZONE,
};

/// Stable arena index of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub usize);

/// Key lifecycle timestamps, epoch seconds. `None` means the event is not
/// scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyTiming {
    pub created: Option<u32>,
    pub publish: Option<u32>,
    pub activate: Option<u32>,
    pub inactive: Option<u32>,
    pub revoke: Option<u32>,
    pub delete: Option<u32>,
}

impl KeyTiming {
    /// Published at `now`: publish time reached, delete time not
    pub fn published_at(&self, now: u32) -> bool {
        match self.publish {
            Some(t) if t <= now => self.delete.map_or(true, |d| d > now),
            _ => false,
        }
    }

    /// Actively signing at `now`: activate reached, inactive and delete not
    pub fn active_at(&self, now: u32) -> bool {
        match self.activate {
            Some(t) if t <= now => {
                self.inactive.map_or(true, |i| i > now)
                    && self.delete.map_or(true, |d| d > now)
            }
            _ => false,
        }
    }

    pub fn revoked_at(&self, now: u32) -> bool {
        matches!(self.revoke, Some(t) if t <= now)
    }

    pub fn deletable_at(&self, now: u32) -> bool {
        matches!(self.delete, Some(t) if t <= now)
    }
}

/// A candidate key as the external key source yields it
#[derive(Clone)]
pub struct KeyMaterial {
    /// The origin the key file names
    pub name: Name,
    pub algorithm: Algorithm,
    /// DNSKEY wire flags
    pub flags: u16,
    pub public_key: Vec<u8>,
    /// Private half; `None` for public-only (offline) keys
    pub private: Option<PKey<Private>>,
    pub timing: KeyTiming,
    /// Rollover links, by key tag
    pub predecessor_tag: Option<u16>,
    pub successor_tag: Option<u16>,
    pub force_publish: bool,
    pub force_sign: bool,
    pub hint_remove: bool,
    /// Legacy private-key format byte, carried verbatim
    pub format_revision: u8,
}

/// The key source the core consumes; key file formats are external
pub trait KeySource {
    fn find_matching_keys(&self, origin: &Name) -> SignResult<Vec<KeyMaterial>>;
}

/// One materialised signing key
#[derive(Clone)]
pub struct SigningKey {
    pub id: KeyId,
    pub algorithm: Algorithm,
    pub key_tag: u16,
    pub flags: u16,
    pub public_key: Vec<u8>,
    private: Option<PKey<Private>>,
    pub timing: KeyTiming,
    pub predecessor: Option<KeyId>,
    pub successor: Option<KeyId>,
    pub force_publish: bool,
    pub force_sign: bool,
    pub hint_remove: bool,
    pub format_revision: u8,
    /// Corresponds to a DNSKEY already published at the apex
    pub published: bool,
    /// Created by reconciliation for a published DNSKEY we have no file
    /// for; explains RRSIGs by keys we do not possess
    pub placeholder: bool,
}

impl SigningKey {
    pub fn is_ksk(&self) -> bool {
        self.flags & DNSKEY_FLAG_SEP != 0
    }

    pub fn is_revoked(&self, now: u32) -> bool {
        self.flags & DNSKEY_FLAG_REVOKE != 0 || self.timing.revoked_at(now)
    }

    /// Only the public half is available; existing signatures by this key
    /// are retained since we cannot re-create them
    pub fn is_offline(&self) -> bool {
        self.private.is_none()
    }

    pub fn is_publishing(&self, now: u32) -> bool {
        (self.force_publish || self.timing.published_at(now)) && !self.hint_remove
    }

    pub fn is_signing(&self, now: u32) -> bool {
        self.force_sign || self.timing.active_at(now)
    }

    pub fn is_removable(&self, now: u32) -> bool {
        self.hint_remove || self.timing.deletable_at(now)
    }

    pub fn private(&self) -> Option<&PKey<Private>> {
        self.private.as_ref()
    }

    /// The published DNSKEY form, with the revoke bit reflected
    pub fn dnskey(&self, now: u32) -> Dnskey {
        let mut flags = self.flags | DNSKEY_FLAG_ZONE;
        if self.timing.revoked_at(now) {
            flags |= DNSKEY_FLAG_REVOKE;
        }
        Dnskey {
            flags,
            protocol: 3,
            algorithm: self.algorithm,
            public_key: self.public_key.clone(),
        }
    }
}

/// The materialised key set for one zone
pub struct Keyring {
    origin: Name,
    keys: Vec<SigningKey>,
    by_tag: HashMap<(u16, u8), Vec<KeyId>>,
    /// Declared rollover tags, resolved into ids once loading completes
    pending_links: Vec<(KeyId, Option<u16>, Option<u16>)>,
}

impl Keyring {
    pub fn new(origin: Name) -> Keyring {
        Keyring {
            origin,
            keys: Vec::new(),
            by_tag: HashMap::new(),
            pending_links: Vec::new(),
        }
    }

    pub fn origin(&self) -> &Name {
        &self.origin
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, id: KeyId) -> Option<&SigningKey> {
        self.keys.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SigningKey> {
        self.keys.iter()
    }

    /// Look a key up by tag and algorithm; revoked keys change tag when the
    /// revoke bit flips, so both forms are tried
    pub fn find_by_tag(&self, key_tag: u16, algorithm: Algorithm) -> Option<&SigningKey> {
        self.by_tag
            .get(&(key_tag, algorithm.to_num()))
            .and_then(|ids| ids.first())
            .and_then(|id| self.get(*id))
    }

    /// Materialise all candidate keys from the source
    ///
    /// Keys naming a different origin fail loading fatally. Duplicate key
    /// files (same tag and algorithm) are merged, retaining the one that
    /// carries private material.
    pub fn load(&mut self, source: &dyn KeySource) -> SignResult<()> {
        let materials = source.find_matching_keys(&self.origin)?;
        for material in materials {
            self.insert_material(material)?;
        }
        self.link_rollovers();
        log::debug!(
            "loaded {} key(s) for zone {}",
            self.keys.len(),
            self.origin
        );
        Ok(())
    }

    fn insert_material(&mut self, material: KeyMaterial) -> SignResult<()> {
        if material.name != self.origin {
            return Err(SignError::KeyLoad(KeyLoadError {
                key_name: material.name.to_string(),
                reason: format!("key does not belong to zone {}", self.origin),
            }));
        }
        let dnskey = Dnskey {
            flags: material.flags | DNSKEY_FLAG_ZONE,
            protocol: 3,
            algorithm: material.algorithm,
            public_key: material.public_key.clone(),
        };
        let key_tag = dnskey.key_tag();

        if let Some(existing) = self.find_by_tag(key_tag, material.algorithm) {
            let id = existing.id;
            // same key seen twice; keep the copy that can sign
            let have_private = self.keys[id.0].private.is_some();
            if !have_private && material.private.is_some() {
                log::warn!(
                    "duplicate key file for tag {}; retaining the copy with private material",
                    key_tag
                );
                let slot = &mut self.keys[id.0];
                slot.private = material.private;
                slot.timing = material.timing;
                slot.force_publish = material.force_publish;
                slot.force_sign = material.force_sign;
                slot.hint_remove = material.hint_remove;
                slot.format_revision = material.format_revision;
            } else {
                log::warn!("duplicate key file for tag {}; ignored", key_tag);
            }
            return Ok(());
        }

        let id = KeyId(self.keys.len());
        self.keys.push(SigningKey {
            id,
            algorithm: material.algorithm,
            key_tag,
            flags: material.flags,
            public_key: material.public_key,
            private: material.private,
            timing: material.timing,
            predecessor: None,
            successor: None,
            force_publish: material.force_publish,
            force_sign: material.force_sign,
            hint_remove: material.hint_remove,
            format_revision: material.format_revision,
            published: false,
            placeholder: false,
        });
        self.by_tag
            .entry((key_tag, material.algorithm.to_num()))
            .or_default()
            .push(id);
        // remember the declared links for the linking pass
        self.pending_links.push((
            id,
            material.predecessor_tag,
            material.successor_tag,
        ));
        Ok(())
    }

    /// Resolve declared predecessor/successor tags into arena ids. A link
    /// only holds when both sides agree: the successor names the
    /// predecessor and the predecessor names the successor back.
    fn link_rollovers(&mut self) {
        let links = std::mem::take(&mut self.pending_links);
        for (id, pred_tag, _) in &links {
            if let Some(pred_tag) = pred_tag {
                let alg = self.keys[id.0].algorithm;
                if let Some(pred) = self.find_by_tag(*pred_tag, alg).map(|k| k.id) {
                    let reverse = links
                        .iter()
                        .find(|(lid, _, _)| *lid == pred)
                        .and_then(|(_, _, s)| *s);
                    if reverse == Some(self.keys[id.0].key_tag) {
                        self.keys[id.0].predecessor = Some(pred);
                        self.keys[pred.0].successor = Some(*id);
                    }
                }
            }
        }
    }

    /// Mark keys that correspond to DNSKEYs already published at the apex,
    /// and add public-only placeholders for published keys we have no file
    /// for, so their RRSIGs can be correctly retained
    pub fn reconcile(&mut self, apex_dnskeys: &Rrset) {
        for rdata in &apex_dnskeys.rdatas {
            let dnskey = match rdata {
                Rdata::Dnskey(k) => k,
                _ => continue,
            };
            let tag = dnskey.key_tag();
            if let Some(existing) = self.find_by_tag(tag, dnskey.algorithm) {
                let id = existing.id;
                self.keys[id.0].published = true;
                continue;
            }
            log::debug!(
                "published DNSKEY tag {} has no key file; adding placeholder",
                tag
            );
            let id = KeyId(self.keys.len());
            self.keys.push(SigningKey {
                id,
                algorithm: dnskey.algorithm,
                key_tag: tag,
                flags: dnskey.flags,
                public_key: dnskey.public_key.clone(),
                private: None,
                timing: KeyTiming::default(),
                predecessor: None,
                successor: None,
                force_publish: false,
                force_sign: false,
                hint_remove: false,
                format_revision: 0,
                published: true,
                placeholder: true,
            });
            self.by_tag
                .entry((tag, dnskey.algorithm.to_num()))
                .or_default()
                .push(id);
        }
    }

    /// Keys that should sign at `now`, unordered
    pub fn signing_keys(&self, now: u32) -> Vec<&SigningKey> {
        self.keys.iter().filter(|k| k.is_signing(now)).collect()
    }

    /// Keys whose DNSKEY should be present at the apex at `now`
    pub fn publishing_keys(&self, now: u32) -> Vec<&SigningKey> {
        self.keys.iter().filter(|k| k.is_publishing(now)).collect()
    }

    /// True if any key can produce signatures at `now`
    pub fn has_active_key(&self, now: u32) -> bool {
        self.keys
            .iter()
            .any(|k| k.is_signing(now) && !k.is_offline())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn origin() -> Name {
        Name::from_str("example.com").unwrap()
    }

    fn material(flags: u16, public: &[u8]) -> KeyMaterial {
        KeyMaterial {
            name: origin(),
            algorithm: Algorithm::EcdsaP256Sha256,
            flags,
            public_key: public.to_vec(),
            private: None,
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

    struct StaticSource(Vec<KeyMaterial>);

    impl KeySource for StaticSource {
        fn find_matching_keys(&self, _origin: &Name) -> SignResult<Vec<KeyMaterial>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_load_and_classify() {
        let mut ring = Keyring::new(origin());
        let source = StaticSource(vec![
            material(257, b"ksk-public"),
            material(256, b"zsk-public"),
        ]);
        ring.load(&source).unwrap();
        assert_eq!(ring.len(), 2);
        let ksks: Vec<_> = ring.iter().filter(|k| k.is_ksk()).collect();
        assert_eq!(ksks.len(), 1);
        assert!(ring.iter().all(|k| k.is_publishing(100)));
        assert!(ring.iter().all(|k| k.is_signing(100)));
        assert!(ring.iter().all(|k| k.is_offline()));
    }

    #[test]
    fn test_wrong_origin_is_fatal() {
        let mut ring = Keyring::new(origin());
        let mut wrong = material(256, b"zsk-public");
        wrong.name = Name::from_str("other.org").unwrap();
        let source = StaticSource(vec![wrong]);
        assert!(ring.load(&source).is_err());
    }

    #[test]
    fn test_duplicate_keys_merge() {
        let mut ring = Keyring::new(origin());
        let source = StaticSource(vec![
            material(256, b"zsk-public"),
            material(256, b"zsk-public"),
        ]);
        ring.load(&source).unwrap();
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_activation_windows() {
        let timing = KeyTiming {
            created: Some(0),
            publish: Some(100),
            activate: Some(200),
            inactive: Some(300),
            revoke: None,
            delete: Some(400),
        };
        assert!(!timing.published_at(50));
        assert!(timing.published_at(150));
        assert!(!timing.active_at(150));
        assert!(timing.active_at(250));
        assert!(!timing.active_at(350));
        assert!(!timing.published_at(450));
        assert!(timing.deletable_at(450));
    }

    #[test]
    fn test_rollover_linking_requires_reverse_link() {
        let mut ring = Keyring::new(origin());
        let pred = material(256, b"predecessor");
        let succ = material(256, b"successor");

        // compute the tags the keys will get
        let pred_tag = Dnskey {
            flags: 256 | DNSKEY_FLAG_ZONE,
            protocol: 3,
            algorithm: Algorithm::EcdsaP256Sha256,
            public_key: pred.public_key.clone(),
        }
        .key_tag();
        let succ_tag = Dnskey {
            flags: 256 | DNSKEY_FLAG_ZONE,
            protocol: 3,
            algorithm: Algorithm::EcdsaP256Sha256,
            public_key: succ.public_key.clone(),
        }
        .key_tag();

        let mut pred = pred;
        let mut succ = succ;
        pred.successor_tag = Some(succ_tag);
        succ.predecessor_tag = Some(pred_tag);

        ring.load(&StaticSource(vec![pred, succ])).unwrap();
        let succ_key = ring.find_by_tag(succ_tag, Algorithm::EcdsaP256Sha256).unwrap();
        let pred_key = ring.find_by_tag(pred_tag, Algorithm::EcdsaP256Sha256).unwrap();
        assert_eq!(succ_key.predecessor, Some(pred_key.id));
        assert_eq!(pred_key.successor, Some(succ_key.id));
    }

    #[test]
    fn test_one_sided_link_is_ignored() {
        let mut ring = Keyring::new(origin());
        let pred = material(256, b"predecessor");
        let pred_tag = Dnskey {
            flags: 256 | DNSKEY_FLAG_ZONE,
            protocol: 3,
            algorithm: Algorithm::EcdsaP256Sha256,
            public_key: pred.public_key.clone(),
        }
        .key_tag();
        let mut succ = material(256, b"successor");
        succ.predecessor_tag = Some(pred_tag);
        // predecessor never names the successor back
        ring.load(&StaticSource(vec![pred, succ])).unwrap();
        assert!(ring.iter().all(|k| k.predecessor.is_none()));
        assert!(ring.iter().all(|k| k.successor.is_none()));
    }

    #[test]
    fn test_reconcile_adds_placeholder() {
        let mut ring = Keyring::new(origin());
        ring.load(&StaticSource(vec![material(256, b"zsk-public")]))
            .unwrap();

        let mut rrset = Rrset::new(origin(), crate::dns::protocol::RecordType::Dnskey, 3600);
        let foreign = Dnskey {
            flags: 257,
            protocol: 3,
            algorithm: Algorithm::EcdsaP256Sha256,
            public_key: b"somebody-elses-key".to_vec(),
        };
        rrset.push(3600, Rdata::Dnskey(foreign.clone()));
        ring.reconcile(&rrset);

        assert_eq!(ring.len(), 2);
        let placeholder = ring
            .find_by_tag(foreign.key_tag(), Algorithm::EcdsaP256Sha256)
            .unwrap();
        assert!(placeholder.placeholder);
        assert!(placeholder.is_offline());
        assert!(placeholder.published);
    }

    #[test]
    fn test_format_revision_round_trips() {
        let mut ring = Keyring::new(origin());
        let mut m = material(256, b"zsk-public");
        m.format_revision = 0x42;
        ring.load(&StaticSource(vec![m])).unwrap();
        assert_eq!(ring.iter().next().unwrap().format_revision, 0x42);
    }
}
