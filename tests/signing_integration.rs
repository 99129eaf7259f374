//! Integration tests for the zone-signing engine
//!
//! These tests drive the whole pipeline the way an authoritative server
//! front-end would: materialise keys, full-sign a populated zone, audit it,
//! then push update diffs through the incremental resigner.

use parking_lot::RwLock;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;

use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::PKey;

use zonesigner::dns::name::Name;
use zonesigner::dns::protocol::{Algorithm, Rdata, Record, RecordType, Soa};
use zonesigner::dns::zone::{DiffOp, SerialMode, Zone, ZoneDiff};
use zonesigner::dnssec::config::{Nsec3Config, SigningConfig, NSEC3_HASH_SHA1};
use zonesigner::dnssec::incremental::{resign_incremental, ResignOutcome};
use zonesigner::dnssec::keyring::{KeyMaterial, KeySource, KeyTiming, Keyring};
use zonesigner::dnssec::policy::SignContext;
use zonesigner::dnssec::signer::SigningStatistics;
use zonesigner::dnssec::walker::{audit_zone, sign_zone};

const NOW: u32 = 1_700_000_000;

fn name(s: &str) -> Name {
    Name::from_str(s).unwrap()
}

/// Generate a P-256 key pair active since the epoch
fn fresh_key(origin: &Name, flags: u16) -> KeyMaterial {
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

    KeyMaterial {
        name: origin.clone(),
        algorithm: Algorithm::EcdsaP256Sha256,
        flags,
        public_key: public,
        private: Some(PKey::from_ec_key(ec).unwrap()),
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

struct StaticKeys(Vec<KeyMaterial>);

impl KeySource for StaticKeys {
    fn find_matching_keys(
        &self,
        _origin: &Name,
    ) -> Result<Vec<KeyMaterial>, zonesigner::dns::errors::SignError> {
        Ok(self.0.clone())
    }
}

fn keyring(origin: &Name) -> RwLock<Keyring> {
    let mut ring = Keyring::new(origin.clone());
    ring.load(&StaticKeys(vec![
        fresh_key(origin, 257),
        fresh_key(origin, 256),
    ]))
    .unwrap();
    RwLock::new(ring)
}

/// A zone with a delegation, a wildcard, an empty non-terminal and glue
fn populated_zone() -> Zone {
    let origin = name("example.com");
    let mut zone = Zone::new(origin.clone());
    zone.add_record(&Record::new(
        origin.clone(),
        3600,
        Rdata::Soa(Soa {
            m_name: name("ns1.example.com"),
            r_name: name("hostmaster.example.com"),
            serial: 2023010100,
            refresh: 7200,
            retry: 3600,
            expire: 1209600,
            minimum: 600,
        }),
    ));
    zone.add_record(&Record::new(
        origin.clone(),
        3600,
        Rdata::Ns {
            host: name("ns1.example.com"),
        },
    ));
    zone.add_record(&Record::new(
        name("ns1.example.com"),
        3600,
        Rdata::A {
            addr: "192.0.2.53".parse().unwrap(),
        },
    ));
    zone.add_record(&Record::new(
        name("www.example.com"),
        300,
        Rdata::A {
            addr: "192.0.2.80".parse().unwrap(),
        },
    ));
    zone.add_record(&Record::new(
        name("www.example.com"),
        300,
        Rdata::Aaaa {
            addr: "2001:db8::80".parse().unwrap(),
        },
    ));
    // empty non-terminal: apps.example.com has no records of its own
    zone.add_record(&Record::new(
        name("api.apps.example.com"),
        300,
        Rdata::A {
            addr: "192.0.2.81".parse().unwrap(),
        },
    ));
    // wildcard
    zone.add_record(&Record::new(
        name("*.wild.example.com"),
        300,
        Rdata::Txt {
            data: vec![b"caught".to_vec()],
        },
    ));
    // delegation with in-zone glue
    zone.add_record(&Record::new(
        name("child.example.com"),
        3600,
        Rdata::Ns {
            host: name("ns.child.example.com"),
        },
    ));
    zone.add_record(&Record::new(
        name("ns.child.example.com"),
        3600,
        Rdata::A {
            addr: "192.0.2.90".parse().unwrap(),
        },
    ));
    zone
}

fn resign_to_done(
    config: &SigningConfig,
    ring: &RwLock<Keyring>,
    stats: &SigningStatistics,
    old: &Zone,
    new: &mut Zone,
    diff: &ZoneDiff,
) {
    let mut state = None;
    loop {
        match resign_incremental(
            config,
            ring,
            stats,
            old,
            new,
            diff,
            config.signature_validity,
            state,
            NOW,
        )
        .unwrap()
        {
            ResignOutcome::Done { .. } => return,
            ResignOutcome::Continue(next) => state = Some(next),
        }
    }
}

#[test]
fn test_full_nsec_sign_and_audit() {
    let origin = name("example.com");
    let ring = keyring(&origin);
    let config = SigningConfig::default();
    let stats = SigningStatistics::default();
    let mut zone = populated_zone();
    let cancel = AtomicBool::new(false);

    sign_zone(&config, &mut zone, &ring, &stats, NOW, &cancel).unwrap();

    // every authoritative name carries an NSEC with the chain TTL
    for owner in &["example.com", "www.example.com", "child.example.com"] {
        let node = zone.node(&name(owner)).unwrap();
        let nsec = node.rrset(RecordType::Nsec).expect("NSEC missing");
        assert_eq!(nsec.ttl, 600, "chain TTL is min(SOA TTL, minimum)");
    }

    // glue below the cut is chainless
    assert!(zone
        .node(&name("ns.child.example.com"))
        .unwrap()
        .rrset(RecordType::Nsec)
        .is_none());

    // the counters moved
    let snap = stats.snapshot();
    assert!(snap.signatures_created > 0);
    assert!(snap.nsec_emitted >= 5);
    assert_eq!(snap.verify_failures, 0);
}

#[test]
fn test_full_nsec3_sign_covers_empty_non_terminals() {
    let origin = name("example.com");
    let ring = keyring(&origin);
    let config = SigningConfig {
        nsec3: Some(Nsec3Config {
            hash_algorithm: NSEC3_HASH_SHA1,
            iterations: 1,
            salt: Some(vec![0x13, 0x37]),
            opt_out: false,
        }),
        ..SigningConfig::default()
    };
    let stats = SigningStatistics::default();
    let mut zone = populated_zone();
    let cancel = AtomicBool::new(false);

    sign_zone(&config, &mut zone, &ring, &stats, NOW, &cancel).unwrap();

    // active names: apex, ns1, www, api.apps, *.wild, child, plus the
    // empty non-terminals apps and wild
    assert_eq!(zone.iter_nsec3().count(), 8);

    // NSEC3PARAM at the apex
    assert!(zone
        .node(&origin)
        .unwrap()
        .rrset(RecordType::Nsec3Param)
        .is_some());
}

#[test]
fn test_max_ttl_caps_chain_records() {
    let origin = name("example.com");
    let ring = keyring(&origin);
    let config = SigningConfig {
        max_ttl: Some(120),
        ..SigningConfig::default()
    };
    let stats = SigningStatistics::default();
    let mut zone = populated_zone();
    let cancel = AtomicBool::new(false);
    sign_zone(&config, &mut zone, &ring, &stats, NOW, &cancel).unwrap();

    let nsec = zone
        .node(&origin)
        .unwrap()
        .rrset(RecordType::Nsec)
        .unwrap();
    assert_eq!(nsec.ttl, 120);
}

#[test]
fn test_date_serial_mode() {
    let origin = name("example.com");
    let ring = keyring(&origin);
    let config = SigningConfig {
        serial_mode: SerialMode::Date,
        ..SigningConfig::default()
    };
    let stats = SigningStatistics::default();
    let mut zone = populated_zone();
    let cancel = AtomicBool::new(false);
    sign_zone(&config, &mut zone, &ring, &stats, NOW, &cancel).unwrap();

    // 2023-11-14, starting serial 2023010100: the date form advances
    assert_eq!(zone.soa().unwrap().serial, 2023111400);
}

#[test]
fn test_incremental_update_cycle_keeps_zone_valid() {
    let origin = name("example.com");
    let ring = keyring(&origin);
    let config = SigningConfig::default();
    let stats = SigningStatistics::default();
    let mut zone = populated_zone();
    let cancel = AtomicBool::new(false);
    sign_zone(&config, &mut zone, &ring, &stats, NOW, &cancel).unwrap();

    // add two names, drop one, through two incremental rounds
    let old = zone.clone();
    let mut new = zone.clone();
    let mail = Record::new(
        name("mail.example.com"),
        300,
        Rdata::A {
            addr: "192.0.2.25".parse().unwrap(),
        },
    );
    let diff: ZoneDiff = vec![
        DiffOp::add(mail.clone()),
        DiffOp::add(Record::new(
            name("mail.example.com"),
            300,
            Rdata::Mx {
                priority: 10,
                host: name("mail.example.com"),
            },
        )),
    ];
    new.apply_diff(&diff).unwrap();
    resign_to_done(&config, &ring, &stats, &old, &mut new, &diff);

    let ctx = SignContext::new(&config, origin.clone(), &ring, &stats, NOW);
    audit_zone(&ctx, &new).unwrap();

    // now retract the A record; the MX stays
    let old2 = new.clone();
    let inverse: ZoneDiff = vec![DiffOp::del(mail)];
    new.apply_diff(&inverse).unwrap();
    resign_to_done(&config, &ring, &stats, &old2, &mut new, &inverse);

    audit_zone(&ctx, &new).unwrap();
    let node = new.node(&name("mail.example.com")).unwrap();
    assert!(node.rrset(RecordType::A).is_none());
    assert!(node.rrset(RecordType::Mx).is_some());
    assert!(!node.sigs_covering(RecordType::Mx).is_empty());
}

#[test]
fn test_delegation_status_change_reshapes_chain() {
    let origin = name("example.com");
    let ring = keyring(&origin);
    let config = SigningConfig::default();
    let stats = SigningStatistics::default();
    let mut zone = populated_zone();
    let cancel = AtomicBool::new(false);
    sign_zone(&config, &mut zone, &ring, &stats, NOW, &cancel).unwrap();

    // withdrawing the delegation exposes the former glue
    let old = zone.clone();
    let mut new = zone.clone();
    let diff: ZoneDiff = vec![DiffOp::del(Record::new(
        name("child.example.com"),
        3600,
        Rdata::Ns {
            host: name("ns.child.example.com"),
        },
    ))];
    new.apply_diff(&diff).unwrap();
    resign_to_done(&config, &ring, &stats, &old, &mut new, &diff);

    let exposed = new.node(&name("ns.child.example.com")).unwrap();
    assert!(
        exposed.rrset(RecordType::Nsec).is_some(),
        "former glue joins the chain once the cut above it is gone"
    );
    assert!(!exposed.sigs_covering(RecordType::A).is_empty());

    let ctx = SignContext::new(&config, origin, &ring, &stats, NOW);
    audit_zone(&ctx, &new).unwrap();
}
