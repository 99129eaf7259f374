//! NSEC3 chain scenario tests

#[cfg(test)]
mod tests {
    use parking_lot::RwLock;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    use crate::dns::name::Name;
    use crate::dns::protocol::{Nsec3, Rdata, Record, RecordType, Soa};
    use crate::dns::zone::{Zone, ZoneDelta};
    use crate::dnssec::config::{Nsec3Config, SigningConfig, NSEC3_HASH_SHA1};
    use crate::dnssec::nsec3::{base32hex_encode, build_nsec3_chain, nsec3_hash};
    use crate::dnssec::policy::SignContext;
    use crate::dnssec::signer::SigningStatistics;
    use crate::dnssec::testutil::{ec_key_material, ring_with};

    const NOW: u32 = 1_700_000_000;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn nsec3_config(opt_out: bool) -> Nsec3Config {
        Nsec3Config {
            hash_algorithm: NSEC3_HASH_SHA1,
            iterations: 2,
            salt: Some(vec![0xab]),
            opt_out,
        }
    }

    fn test_zone() -> Zone {
        let origin = name("example.com");
        let mut zone = Zone::new(origin.clone());
        zone.add_record(&Record::new(
            origin.clone(),
            3600,
            Rdata::Soa(Soa {
                m_name: name("ns.example.com"),
                r_name: name("admin.example.com"),
                serial: 1,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum: 300,
            }),
        ));
        zone.add_record(&Record::new(
            origin,
            3600,
            Rdata::Ns {
                host: name("ns.example.com"),
            },
        ));
        zone.add_record(&Record::new(
            name("ns.example.com"),
            3600,
            Rdata::A {
                addr: "10.0.0.53".parse().unwrap(),
            },
        ));
        zone
    }

    /// All NSEC3 records in the delta's additions, keyed by hashed owner
    fn chain_of(delta: &ZoneDelta) -> BTreeMap<Name, Nsec3> {
        delta
            .additions
            .iter()
            .filter_map(|r| match &r.rdata {
                Rdata::Nsec3(n) => Some((r.name.clone(), n.clone())),
                _ => None,
            })
            .collect()
    }

    fn assert_cycle(chain: &BTreeMap<Name, Nsec3>, origin: &Name) {
        assert!(!chain.is_empty());
        // sorted hashed owners must form a cycle under next_hashed
        let mut owners: Vec<(&Name, &Nsec3)> = chain.iter().collect();
        owners.sort_by_key(|(owner, _)| owner.labels()[0].clone());
        for (i, (_, nsec3)) in owners.iter().enumerate() {
            let (next_owner, _) = owners[(i + 1) % owners.len()];
            let expected_label = base32hex_encode(&nsec3.next_hashed);
            assert_eq!(
                next_owner.labels()[0],
                expected_label.as_bytes().to_vec(),
                "next-hash pointer must name the following owner"
            );
            assert!(next_owner.parent().unwrap() == *origin);
        }
    }

    #[test]
    fn test_chain_is_a_cycle() {
        let origin = name("example.com");
        let ring = RwLock::new(ring_with(&origin, vec![ec_key_material(&origin, 256)]));
        let config = SigningConfig {
            nsec3: Some(nsec3_config(false)),
            ..SigningConfig::default()
        };
        let stats = SigningStatistics::default();
        let ctx = SignContext::new(&config, origin.clone(), &ring, &stats, NOW);

        let zone = test_zone();
        let delta = build_nsec3_chain(&ctx, &zone).unwrap();
        let chain = chain_of(&delta);
        assert_eq!(chain.len(), 2); // apex and ns.example.com
        assert_cycle(&chain, &origin);
        assert_eq!(stats.snapshot().nsec3_emitted, 2);

        // NSEC3PARAM lands at the apex with zero flags
        let param = delta
            .additions
            .iter()
            .find_map(|r| match &r.rdata {
                Rdata::Nsec3Param(p) => Some(p),
                _ => None,
            })
            .expect("NSEC3PARAM must be installed");
        assert_eq!(param.flags, 0);
        assert_eq!(param.iterations, 2);
        assert_eq!(param.salt, vec![0xab]);

        // every NSEC3 is signed
        let sig_count = delta
            .additions
            .iter()
            .filter(|r| matches!(&r.rdata, Rdata::Rrsig(s) if s.type_covered == RecordType::Nsec3))
            .count();
        assert_eq!(sig_count, 2);
    }

    #[test]
    fn test_opt_out_skips_insecure_delegation() {
        let origin = name("example.com");
        let ring = RwLock::new(ring_with(&origin, vec![ec_key_material(&origin, 256)]));
        let stats = SigningStatistics::default();

        let mut zone = test_zone();
        zone.add_record(&Record::new(
            name("sub.example.com"),
            3600,
            Rdata::Ns {
                host: name("sub.ns."),
            },
        ));

        // with opt-out on, the insecure delegation has no NSEC3
        let config = SigningConfig {
            nsec3: Some(nsec3_config(true)),
            ..SigningConfig::default()
        };
        let ctx = SignContext::new(&config, origin.clone(), &ring, &stats, NOW);
        let delta = build_nsec3_chain(&ctx, &zone).unwrap();
        let chain = chain_of(&delta);
        assert_eq!(chain.len(), 2);
        assert_cycle(&chain, &origin);
        let sub_hash = nsec3_hash(&name("sub.example.com"), &[0xab], 2);
        let sub_owner = origin
            .child(base32hex_encode(&sub_hash).as_bytes())
            .unwrap();
        assert!(!chain.contains_key(&sub_owner));
        // the opt-out bit is set on every emitted record
        assert!(chain.values().all(|n| n.flags & 0x01 != 0));

        // with opt-out off it is present, with an NS-only bitmap
        let config = SigningConfig {
            nsec3: Some(nsec3_config(false)),
            ..SigningConfig::default()
        };
        let ctx = SignContext::new(&config, origin.clone(), &ring, &stats, NOW);
        let delta = build_nsec3_chain(&ctx, &zone).unwrap();
        let chain = chain_of(&delta);
        assert_eq!(chain.len(), 3);
        assert_cycle(&chain, &origin);
        let sub = chain.get(&sub_owner).expect("insecure delegation included");
        assert_eq!(sub.types, vec![RecordType::Ns.to_num()]);
    }

    #[test]
    fn test_empty_non_terminal_gets_a_record() {
        let origin = name("example.com");
        let ring = RwLock::new(ring_with(&origin, vec![ec_key_material(&origin, 256)]));
        let config = SigningConfig {
            nsec3: Some(nsec3_config(false)),
            ..SigningConfig::default()
        };
        let stats = SigningStatistics::default();
        let ctx = SignContext::new(&config, origin.clone(), &ring, &stats, NOW);

        let mut zone = test_zone();
        // a.b.example.com exists; b.example.com does not
        zone.add_record(&Record::new(
            name("a.b.example.com"),
            300,
            Rdata::A {
                addr: "10.0.0.7".parse().unwrap(),
            },
        ));

        let delta = build_nsec3_chain(&ctx, &zone).unwrap();
        let chain = chain_of(&delta);
        // apex, ns, a.b and the synthesised b
        assert_eq!(chain.len(), 4);
        assert_cycle(&chain, &origin);

        let ent_hash = nsec3_hash(&name("b.example.com"), &[0xab], 2);
        let ent_owner = origin
            .child(base32hex_encode(&ent_hash).as_bytes())
            .unwrap();
        let ent = chain.get(&ent_owner).expect("empty non-terminal in chain");
        assert!(ent.types.is_empty(), "an ENT asserts no types");
    }

    #[test]
    fn test_apex_bitmap_advertises_nsec3param() {
        let origin = name("example.com");
        let ring = RwLock::new(ring_with(&origin, vec![ec_key_material(&origin, 256)]));
        let config = SigningConfig {
            nsec3: Some(nsec3_config(false)),
            ..SigningConfig::default()
        };
        let stats = SigningStatistics::default();
        let ctx = SignContext::new(&config, origin.clone(), &ring, &stats, NOW);

        let zone = test_zone();
        let delta = build_nsec3_chain(&ctx, &zone).unwrap();
        let chain = chain_of(&delta);
        let apex_hash = nsec3_hash(&origin, &[0xab], 2);
        let apex_owner = origin
            .child(base32hex_encode(&apex_hash).as_bytes())
            .unwrap();
        let apex = chain.get(&apex_owner).unwrap();
        assert!(apex.types.contains(&RecordType::Soa.to_num()));
        assert!(apex.types.contains(&RecordType::Nsec3Param.to_num()));
        assert!(apex.types.contains(&RecordType::Rrsig.to_num()));
    }

    #[test]
    fn test_chain_repair_keeps_matching_records() {
        let origin = name("example.com");
        let ring = RwLock::new(ring_with(&origin, vec![ec_key_material(&origin, 256)]));
        let config = SigningConfig {
            nsec3: Some(nsec3_config(false)),
            ..SigningConfig::default()
        };
        let stats = SigningStatistics::default();
        let ctx = SignContext::new(&config, origin.clone(), &ring, &stats, NOW);

        let mut zone = test_zone();
        let first = build_nsec3_chain(&ctx, &zone).unwrap();
        zone.apply_delta(&first);

        // a second build over the unchanged zone emits nothing new
        let second = build_nsec3_chain(&ctx, &zone).unwrap();
        let chain = chain_of(&second);
        assert!(chain.is_empty(), "unchanged chain must be kept in place");
        assert!(second
            .deletions
            .iter()
            .all(|r| r.rtype() != RecordType::Nsec3));
    }

    #[test]
    fn test_stale_parameters_are_replaced() {
        let origin = name("example.com");
        let ring = RwLock::new(ring_with(&origin, vec![ec_key_material(&origin, 256)]));
        let stats = SigningStatistics::default();

        let mut zone = test_zone();
        let old_config = SigningConfig {
            nsec3: Some(Nsec3Config {
                iterations: 5,
                ..nsec3_config(false)
            }),
            ..SigningConfig::default()
        };
        let ctx = SignContext::new(&old_config, origin.clone(), &ring, &stats, NOW);
        let first = build_nsec3_chain(&ctx, &zone).unwrap();
        zone.apply_delta(&first);

        // rebuild under different iterations: every old record goes
        let new_config = SigningConfig {
            nsec3: Some(nsec3_config(false)),
            ..SigningConfig::default()
        };
        let ctx = SignContext::new(&new_config, origin.clone(), &ring, &stats, NOW);
        let second = build_nsec3_chain(&ctx, &zone).unwrap();
        let deleted_nsec3 = second
            .deletions
            .iter()
            .filter(|r| r.rtype() == RecordType::Nsec3)
            .count();
        assert_eq!(deleted_nsec3, 2);
        assert_eq!(chain_of(&second).len(), 2);
        // the old NSEC3PARAM is withdrawn as well
        assert!(second
            .deletions
            .iter()
            .any(|r| r.rtype() == RecordType::Nsec3Param));
    }

    #[test]
    fn test_nsec_chain_is_removed_on_switch() {
        let origin = name("example.com");
        let ring = RwLock::new(ring_with(&origin, vec![ec_key_material(&origin, 256)]));
        let config = SigningConfig {
            nsec3: Some(nsec3_config(false)),
            ..SigningConfig::default()
        };
        let stats = SigningStatistics::default();
        let ctx = SignContext::new(&config, origin.clone(), &ring, &stats, NOW);

        let mut zone = test_zone();
        zone.add_record(&Record::new(
            origin.clone(),
            300,
            Rdata::Nsec(crate::dns::protocol::Nsec {
                next: name("ns.example.com"),
                types: vec![RecordType::Soa.to_num()],
            }),
        ));

        let delta = build_nsec3_chain(&ctx, &zone).unwrap();
        assert!(delta
            .deletions
            .iter()
            .any(|r| r.rtype() == RecordType::Nsec));
    }

    #[test]
    fn test_missing_parameters_is_fatal() {
        let origin = name("example.com");
        let ring = RwLock::new(ring_with(&origin, vec![ec_key_material(&origin, 256)]));
        let config = SigningConfig::default();
        let stats = SigningStatistics::default();
        let ctx = SignContext::new(&config, origin, &ring, &stats, NOW);
        let zone = test_zone();
        assert!(build_nsec3_chain(&ctx, &zone).is_err());
    }
}
