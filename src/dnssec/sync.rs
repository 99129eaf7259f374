//! Delegation-trust maintenance
//!
//! Installs DS RRsets at delegation points from per-child `dsset-`/`keyset-`
//! files, and keeps the apex CDS/CDNSKEY RRsets in step with the configured
//! synchronisation policy.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use sha1::Sha1;
use sha2::{Digest as Sha2Digest, Sha256, Sha384};

use crate::dns::errors::{SignError, SignResult};
use crate::dns::name::Name;
use crate::dns::protocol::{
    Algorithm, DigestType, Dnskey, Ds, Rdata, Record, RecordType,
};
use crate::dns::zone::{Zone, ZoneDelta};
use crate::dnssec::policy::SignContext;

/// Compute the DS digest of a DNSKEY at `owner` (RFC 4034 section 5.1.4)
pub fn compute_ds(owner: &Name, dnskey: &Dnskey, digest_type: DigestType) -> Ds {
    let mut input = owner.to_canonical_wire();
    input.extend_from_slice(&dnskey.to_rdata_wire());
    let digest = match digest_type {
        DigestType::Sha1 => {
            let mut hasher = Sha1::new();
            hasher.update(&input);
            hasher.finalize().to_vec()
        }
        DigestType::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(&input);
            hasher.finalize().to_vec()
        }
        DigestType::Sha384 => {
            let mut hasher = Sha384::new();
            hasher.update(&input);
            hasher.finalize().to_vec()
        }
    };
    Ds {
        key_tag: dnskey.key_tag(),
        algorithm: dnskey.algorithm,
        digest_type,
        digest,
    }
}

/// Bring the apex CDS/CDNSKEY RRsets in line with the `sync-records`
/// policy. An empty policy publishes nothing and leaves existing records
/// untouched.
pub fn install_sync_records(ctx: &SignContext<'_>, zone: &Zone) -> SignResult<ZoneDelta> {
    let mut delta = ZoneDelta::default();
    let policy = &ctx.config.sync_records;
    if policy.is_empty() {
        return Ok(delta);
    }

    let apex = match zone.node(&ctx.origin) {
        Some(apex) => apex,
        None => return Ok(delta),
    };
    let ttl = ctx
        .config
        .dnskey_ttl
        .or_else(|| apex.rrset(RecordType::Dnskey).map(|s| s.ttl))
        .unwrap_or(3600);

    let ring = ctx.keyring.read();
    let ksks: Vec<Dnskey> = ring
        .iter()
        .filter(|k| k.is_ksk() && k.is_publishing(ctx.now) && !k.is_revoked(ctx.now))
        .map(|k| k.dnskey(ctx.now))
        .collect();

    let mut wanted_cdnskey: Vec<Rdata> = Vec::new();
    let mut wanted_cds: Vec<Rdata> = Vec::new();
    for dnskey in &ksks {
        if policy.cdnskey {
            wanted_cdnskey.push(Rdata::Cdnskey(dnskey.clone()));
        }
        for digest_type in &policy.cds_digests {
            wanted_cds.push(Rdata::Cds(compute_ds(&ctx.origin, dnskey, *digest_type)));
        }
    }

    reconcile_rrset(
        zone,
        &ctx.origin,
        RecordType::Cdnskey,
        ttl,
        wanted_cdnskey,
        &mut delta,
    );
    reconcile_rrset(
        zone,
        &ctx.origin,
        RecordType::Cds,
        ttl,
        wanted_cds,
        &mut delta,
    );
    Ok(delta)
}

/// Emit the deletions/additions that morph the RRset at (name, rtype) into
/// exactly `wanted`
fn reconcile_rrset(
    zone: &Zone,
    name: &Name,
    rtype: RecordType,
    ttl: u32,
    wanted: Vec<Rdata>,
    delta: &mut ZoneDelta,
) {
    let existing = zone.node(name).and_then(|n| n.rrset(rtype));
    if let Some(existing) = existing {
        for record in existing.records() {
            if !wanted.contains(&record.rdata) {
                delta.deletions.push(record);
            }
        }
    }
    for rdata in wanted {
        let present = existing
            .map(|s| s.rdatas.contains(&rdata))
            .unwrap_or(false);
        if !present {
            delta.additions.push(Record::new(name.clone(), ttl, rdata));
        }
    }
}

/// Install DS RRsets at delegation points from dsset/keyset files
///
/// For each delegation owner, `dsset-<child>` is preferred; a legacy
/// `keyset-<child>` (DNSKEY records) is accepted and digested with SHA-256.
/// A missing file leaves the delegation without DS.
pub fn install_delegation_ds(ctx: &SignContext<'_>, zone: &Zone) -> SignResult<ZoneDelta> {
    let mut delta = ZoneDelta::default();
    let dir = match &ctx.config.dsset_dir {
        Some(dir) => dir.clone(),
        None => return Ok(delta),
    };

    for (name, node) in zone.iter_main() {
        if !node.is_delegation(*name == ctx.origin) || zone.is_occluded(name) {
            continue;
        }
        let child = name.to_string();
        let dsset_path = dir.join(format!("dsset-{}", child));
        let keyset_path = dir.join(format!("keyset-{}", child));

        let wanted: Vec<Rdata> = if dsset_path.exists() {
            parse_dsset_file(&dsset_path, name)?
                .into_iter()
                .map(Rdata::Ds)
                .collect()
        } else if keyset_path.exists() {
            parse_keyset_file(&keyset_path)?
                .into_iter()
                .map(|key| Rdata::Ds(compute_ds(name, &key, DigestType::Sha256)))
                .collect()
        } else {
            continue;
        };

        let ttl = node
            .rrset(RecordType::Ds)
            .map(|s| s.ttl)
            .or_else(|| node.rrset(RecordType::Ns).map(|s| s.ttl))
            .unwrap_or(3600);
        log::debug!("installing {} DS record(s) at {}", wanted.len(), name);
        reconcile_rrset(zone, name, RecordType::Ds, ttl, wanted, &mut delta);
    }
    Ok(delta)
}

/// Parse a `dsset-` file: one DS record per line in presentation form,
/// `<owner> [ttl] [IN] DS <tag> <alg> <digest-type> <hex>`
fn parse_dsset_file(path: &Path, owner: &Name) -> SignResult<Vec<Ds>> {
    let text = fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let ds_pos = fields
            .iter()
            .position(|f| f.eq_ignore_ascii_case("DS"))
            .ok_or_else(|| {
                SignError::policy("dsset", line, "line does not contain a DS record")
            })?;
        if fields.len() < ds_pos + 5 {
            return Err(SignError::policy("dsset", line, "truncated DS record"));
        }
        let key_tag: u16 = fields[ds_pos + 1]
            .parse()
            .map_err(|_| SignError::policy("dsset", line, "bad key tag"))?;
        let algorithm: u8 = fields[ds_pos + 2]
            .parse()
            .map_err(|_| SignError::policy("dsset", line, "bad algorithm"))?;
        let digest_num: u8 = fields[ds_pos + 3]
            .parse()
            .map_err(|_| SignError::policy("dsset", line, "bad digest type"))?;
        let digest_type = DigestType::from_num(digest_num).ok_or_else(|| {
            SignError::policy("dsset", line, "unsupported digest type")
        })?;
        let digest = hex::decode(fields[ds_pos + 4..].concat())
            .map_err(|_| SignError::policy("dsset", line, "digest is not hex"))?;
        if let Ok(named) = Name::from_str(fields[0]) {
            if named != *owner {
                return Err(SignError::policy(
                    "dsset",
                    line,
                    "file names a different delegation owner",
                ));
            }
        }
        out.push(Ds {
            key_tag,
            algorithm: Algorithm::from_num(algorithm),
            digest_type,
            digest,
        });
    }
    Ok(out)
}

/// Parse a legacy `keyset-` file: DNSKEY records in presentation form,
/// `<owner> [ttl] [IN] DNSKEY <flags> <protocol> <alg> <base64...>`
fn parse_keyset_file(path: &Path) -> SignResult<Vec<Dnskey>> {
    let text = fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let key_pos = fields
            .iter()
            .position(|f| f.eq_ignore_ascii_case("DNSKEY"))
            .ok_or_else(|| {
                SignError::policy("keyset", line, "line does not contain a DNSKEY record")
            })?;
        if fields.len() < key_pos + 5 {
            return Err(SignError::policy("keyset", line, "truncated DNSKEY record"));
        }
        let flags: u16 = fields[key_pos + 1]
            .parse()
            .map_err(|_| SignError::policy("keyset", line, "bad flags"))?;
        let protocol: u8 = fields[key_pos + 2]
            .parse()
            .map_err(|_| SignError::policy("keyset", line, "bad protocol"))?;
        let algorithm: u8 = fields[key_pos + 3]
            .parse()
            .map_err(|_| SignError::policy("keyset", line, "bad algorithm"))?;
        let public_key = base64::decode(fields[key_pos + 4..].concat())
            .map_err(|_| SignError::policy("keyset", line, "key material is not base64"))?;
        out.push(Dnskey {
            flags,
            protocol,
            algorithm: Algorithm::from_num(algorithm),
            public_key,
        });
    }
    Ok(out)
}
