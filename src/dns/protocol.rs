//! Record types and rdata in a transport agnostic fashion
//!
//! Rdata is modelled as a tagged variant over the record types the signer
//! needs to understand structurally; everything else is carried as opaque
//! bytes and still participates in canonical ordering. Wire encoding here is
//! the uncompressed, canonical-form encoding DNSSEC signing and digesting
//! require, not packet encoding.

use std::cmp::Ordering;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde_derive::{Deserialize, Serialize};

use crate::dns::name::Name;

/// The DNS class of everything this crate touches
pub const CLASS_IN: u16 = 1;

/// `RecordType` represents the type of a resource record
///
/// An integer can be converted to a record type using the `from_num`
/// function, and back to an integer using the `to_num` method. Types the
/// signer has no structural interest in stay `Unknown`.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    Unknown(u16),
    A,          // 1
    Ns,         // 2
    Cname,      // 5
    Soa,        // 6
    Ptr,        // 12
    Mx,         // 15
    Txt,        // 16
    Aaaa,       // 28
    Srv,        // 33
    Ds,         // 43
    Rrsig,      // 46
    Nsec,       // 47
    Dnskey,     // 48
    Nsec3,      // 50
    Nsec3Param, // 51
    Cds,        // 59
    Cdnskey,    // 60
    Dname,      // 39
}

impl RecordType {
    pub fn to_num(&self) -> u16 {
        match *self {
            RecordType::Unknown(x) => x,
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Dname => 39,
            RecordType::Ds => 43,
            RecordType::Rrsig => 46,
            RecordType::Nsec => 47,
            RecordType::Dnskey => 48,
            RecordType::Nsec3 => 50,
            RecordType::Nsec3Param => 51,
            RecordType::Cds => 59,
            RecordType::Cdnskey => 60,
        }
    }

    pub fn from_num(num: u16) -> RecordType {
        match num {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            33 => RecordType::Srv,
            39 => RecordType::Dname,
            43 => RecordType::Ds,
            46 => RecordType::Rrsig,
            47 => RecordType::Nsec,
            48 => RecordType::Dnskey,
            50 => RecordType::Nsec3,
            51 => RecordType::Nsec3Param,
            59 => RecordType::Cds,
            60 => RecordType::Cdnskey,
            _ => RecordType::Unknown(num),
        }
    }
}

/// DNSSEC signing algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// RSA/SHA-256 (Algorithm 8)
    RsaSha256,
    /// RSA/SHA-512 (Algorithm 10)
    RsaSha512,
    /// ECDSA P-256 with SHA-256 (Algorithm 13)
    EcdsaP256Sha256,
    /// ECDSA P-384 with SHA-384 (Algorithm 14)
    EcdsaP384Sha384,
    /// ED25519 (Algorithm 15)
    Ed25519,
    /// Anything else; kept for orphan-signature bookkeeping
    Unknown(u8),
}

impl Algorithm {
    pub fn to_num(&self) -> u8 {
        match *self {
            Algorithm::RsaSha256 => 8,
            Algorithm::RsaSha512 => 10,
            Algorithm::EcdsaP256Sha256 => 13,
            Algorithm::EcdsaP384Sha384 => 14,
            Algorithm::Ed25519 => 15,
            Algorithm::Unknown(x) => x,
        }
    }

    pub fn from_num(num: u8) -> Algorithm {
        match num {
            8 => Algorithm::RsaSha256,
            10 => Algorithm::RsaSha512,
            13 => Algorithm::EcdsaP256Sha256,
            14 => Algorithm::EcdsaP384Sha384,
            15 => Algorithm::Ed25519,
            _ => Algorithm::Unknown(num),
        }
    }

    /// The pre-NSEC3 algorithms (RSAMD5, DSA, RSASHA1) must not anchor an
    /// NSEC3 chain; their NSEC3-capable aliases exist for that purpose.
    pub fn supports_nsec3(&self) -> bool {
        !matches!(self.to_num(), 1 | 3 | 5)
    }
}

/// DNSSEC digest types for DS records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestType {
    /// SHA-1 (Digest Type 1) - legacy
    Sha1,
    /// SHA-256 (Digest Type 2)
    Sha256,
    /// SHA-384 (Digest Type 4)
    Sha384,
}

impl DigestType {
    pub fn to_num(&self) -> u8 {
        match *self {
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha384 => 4,
        }
    }

    pub fn from_num(num: u8) -> Option<DigestType> {
        match num {
            1 => Some(DigestType::Sha1),
            2 => Some(DigestType::Sha256),
            4 => Some(DigestType::Sha384),
            _ => None,
        }
    }
}

/// RRSIG rdata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rrsig {
    /// Type covered
    pub type_covered: RecordType,
    /// Algorithm
    pub algorithm: Algorithm,
    /// Labels count of the owner, wildcard label excluded
    pub labels: u8,
    /// Original TTL of the covered RRset
    pub original_ttl: u32,
    /// Signature expiration, epoch seconds
    pub expiration: u32,
    /// Signature inception, epoch seconds
    pub inception: u32,
    /// Key tag of the signing key
    pub key_tag: u16,
    /// Signer's name (the zone origin)
    pub signer_name: Name,
    /// Signature bytes
    pub signature: Vec<u8>,
}

impl Rrsig {
    /// The fixed-size rdata prefix plus signer name, without the signature.
    /// This is exactly the prefix that gets fed into signature computation.
    pub fn to_prefix_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.signer_name.wire_len());
        out.extend_from_slice(&self.type_covered.to_num().to_be_bytes());
        out.push(self.algorithm.to_num());
        out.push(self.labels);
        out.extend_from_slice(&self.original_ttl.to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&self.inception.to_be_bytes());
        out.extend_from_slice(&self.key_tag.to_be_bytes());
        out.extend_from_slice(&self.signer_name.to_canonical_wire());
        out
    }
}

/// DNSKEY rdata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dnskey {
    /// Flags (256 for ZSK, 257 for KSK; 0x80 marks revocation)
    pub flags: u16,
    /// Protocol (always 3)
    pub protocol: u8,
    /// Algorithm
    pub algorithm: Algorithm,
    /// Public key material
    pub public_key: Vec<u8>,
}

/// The zone-key bit
pub const DNSKEY_FLAG_ZONE: u16 = 0x0100;
/// The secure-entry-point bit distinguishing KSKs
pub const DNSKEY_FLAG_SEP: u16 = 0x0001;
/// The revocation bit
pub const DNSKEY_FLAG_REVOKE: u16 = 0x0080;

impl Dnskey {
    pub fn is_ksk(&self) -> bool {
        self.flags & DNSKEY_FLAG_SEP != 0
    }

    pub fn is_revoked(&self) -> bool {
        self.flags & DNSKEY_FLAG_REVOKE != 0
    }

    pub fn to_rdata_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.public_key.len());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.push(self.protocol);
        out.push(self.algorithm.to_num());
        out.extend_from_slice(&self.public_key);
        out
    }

    /// Key tag per RFC 4034 Appendix B
    pub fn key_tag(&self) -> u16 {
        let rdata = self.to_rdata_wire();
        let mut ac: u32 = 0;
        for (i, &byte) in rdata.iter().enumerate() {
            if i % 2 == 0 {
                ac += (byte as u32) << 8;
            } else {
                ac += byte as u32;
            }
        }
        ac += (ac >> 16) & 0xFFFF;
        (ac & 0xFFFF) as u16
    }
}

/// DS rdata; CDS shares the layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ds {
    pub key_tag: u16,
    pub algorithm: Algorithm,
    pub digest_type: DigestType,
    pub digest: Vec<u8>,
}

/// NSEC rdata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nsec {
    /// The next owner in canonical order, wrapping to the origin
    pub next: Name,
    /// Types present at the owner, as raw type codes
    pub types: Vec<u16>,
}

/// NSEC3 rdata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nsec3 {
    /// Hash algorithm (1 = SHA-1)
    pub hash_algorithm: u8,
    /// Flags; bit 0 is opt-out
    pub flags: u8,
    /// Extra hash iterations
    pub iterations: u16,
    /// Salt; empty means no salt
    pub salt: Vec<u8>,
    /// Hash of the next owner in hash order
    pub next_hashed: Vec<u8>,
    /// Types present at the original owner
    pub types: Vec<u16>,
}

/// NSEC3PARAM rdata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nsec3Param {
    pub hash_algorithm: u8,
    pub flags: u8,
    pub iterations: u16,
    pub salt: Vec<u8>,
}

/// SOA rdata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Soa {
    pub m_name: Name,
    pub r_name: Name,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// `Rdata` is the primary representation of record data
///
/// Types the signer needs to inspect or construct are structured variants;
/// everything else is `Other` with opaque bytes. Canonical comparison of
/// `Other` is bytewise over the stored form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Rdata {
    A { addr: Ipv4Addr },
    Aaaa { addr: Ipv6Addr },
    Ns { host: Name },
    Cname { host: Name },
    Dname { target: Name },
    Ptr { target: Name },
    Mx { priority: u16, host: Name },
    Txt { data: Vec<Vec<u8>> },
    Srv { priority: u16, weight: u16, port: u16, host: Name },
    Soa(Soa),
    Ds(Ds),
    Cds(Ds),
    Dnskey(Dnskey),
    Cdnskey(Dnskey),
    Rrsig(Rrsig),
    Nsec(Nsec),
    Nsec3(Nsec3),
    Nsec3Param(Nsec3Param),
    Other { rtype: u16, data: Vec<u8> },
}

impl Rdata {
    pub fn rtype(&self) -> RecordType {
        match self {
            Rdata::A { .. } => RecordType::A,
            Rdata::Aaaa { .. } => RecordType::Aaaa,
            Rdata::Ns { .. } => RecordType::Ns,
            Rdata::Cname { .. } => RecordType::Cname,
            Rdata::Dname { .. } => RecordType::Dname,
            Rdata::Ptr { .. } => RecordType::Ptr,
            Rdata::Mx { .. } => RecordType::Mx,
            Rdata::Txt { .. } => RecordType::Txt,
            Rdata::Srv { .. } => RecordType::Srv,
            Rdata::Soa(_) => RecordType::Soa,
            Rdata::Ds(_) => RecordType::Ds,
            Rdata::Cds(_) => RecordType::Cds,
            Rdata::Dnskey(_) => RecordType::Dnskey,
            Rdata::Cdnskey(_) => RecordType::Cdnskey,
            Rdata::Rrsig(_) => RecordType::Rrsig,
            Rdata::Nsec(_) => RecordType::Nsec,
            Rdata::Nsec3(_) => RecordType::Nsec3,
            Rdata::Nsec3Param(_) => RecordType::Nsec3Param,
            Rdata::Other { rtype, .. } => RecordType::from_num(*rtype),
        }
    }

    /// Canonical-form rdata encoding per RFC 4034 section 6.2: uncompressed,
    /// with embedded names of the legacy types case-folded to lower case.
    pub fn to_canonical_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Rdata::A { addr } => out.extend_from_slice(&addr.octets()),
            Rdata::Aaaa { addr } => out.extend_from_slice(&addr.octets()),
            Rdata::Ns { host } => out.extend_from_slice(&host.to_canonical_wire()),
            Rdata::Cname { host } => out.extend_from_slice(&host.to_canonical_wire()),
            Rdata::Dname { target } => out.extend_from_slice(&target.to_canonical_wire()),
            Rdata::Ptr { target } => out.extend_from_slice(&target.to_canonical_wire()),
            Rdata::Mx { priority, host } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&host.to_canonical_wire());
            }
            Rdata::Txt { data } => {
                for chunk in data {
                    out.push(chunk.len() as u8);
                    out.extend_from_slice(chunk);
                }
            }
            Rdata::Srv { priority, weight, port, host } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                out.extend_from_slice(&host.to_canonical_wire());
            }
            Rdata::Soa(soa) => {
                out.extend_from_slice(&soa.m_name.to_canonical_wire());
                out.extend_from_slice(&soa.r_name.to_canonical_wire());
                out.extend_from_slice(&soa.serial.to_be_bytes());
                out.extend_from_slice(&soa.refresh.to_be_bytes());
                out.extend_from_slice(&soa.retry.to_be_bytes());
                out.extend_from_slice(&soa.expire.to_be_bytes());
                out.extend_from_slice(&soa.minimum.to_be_bytes());
            }
            Rdata::Ds(ds) | Rdata::Cds(ds) => {
                out.extend_from_slice(&ds.key_tag.to_be_bytes());
                out.push(ds.algorithm.to_num());
                out.push(ds.digest_type.to_num());
                out.extend_from_slice(&ds.digest);
            }
            Rdata::Dnskey(key) | Rdata::Cdnskey(key) => {
                out.extend_from_slice(&key.to_rdata_wire());
            }
            Rdata::Rrsig(sig) => {
                out.extend_from_slice(&sig.to_prefix_wire());
                out.extend_from_slice(&sig.signature);
            }
            Rdata::Nsec(nsec) => {
                // RFC 6840: the next name is not case-folded
                out.extend_from_slice(&nsec.next.to_wire());
                out.extend_from_slice(&type_bitmap(&nsec.types));
            }
            Rdata::Nsec3(n3) => {
                out.push(n3.hash_algorithm);
                out.push(n3.flags);
                out.extend_from_slice(&n3.iterations.to_be_bytes());
                out.push(n3.salt.len() as u8);
                out.extend_from_slice(&n3.salt);
                out.push(n3.next_hashed.len() as u8);
                out.extend_from_slice(&n3.next_hashed);
                out.extend_from_slice(&type_bitmap(&n3.types));
            }
            Rdata::Nsec3Param(p) => {
                out.push(p.hash_algorithm);
                out.push(p.flags);
                out.extend_from_slice(&p.iterations.to_be_bytes());
                out.push(p.salt.len() as u8);
                out.extend_from_slice(&p.salt);
            }
            Rdata::Other { data, .. } => out.extend_from_slice(data),
        }
        out
    }
}

/// Canonical rdata comparison: bytewise over the wire form, a shorter prefix
/// sorting first
pub fn canonical_rdata_cmp(a: &Rdata, b: &Rdata) -> Ordering {
    a.to_canonical_wire().cmp(&b.to_canonical_wire())
}

/// The NSEC/NSEC3 windowed type bitmap (RFC 4034 section 4.1.2). Input
/// types need not be sorted or unique.
pub fn type_bitmap(types: &[u16]) -> Vec<u8> {
    let mut sorted: Vec<u16> = types.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = Vec::new();
    let mut window: Option<(u8, [u8; 32], usize)> = None;

    for t in sorted {
        let win = (t >> 8) as u8;
        let low = (t & 0xFF) as u8;
        match window {
            Some((cur, ref mut bits, ref mut max)) if cur == win => {
                bits[(low / 8) as usize] |= 0x80 >> (low % 8);
                *max = (*max).max((low / 8) as usize);
            }
            _ => {
                if let Some((cur, bits, max)) = window.take() {
                    out.push(cur);
                    out.push((max + 1) as u8);
                    out.extend_from_slice(&bits[..=max]);
                }
                let mut bits = [0u8; 32];
                bits[(low / 8) as usize] |= 0x80 >> (low % 8);
                window = Some((win, bits, (low / 8) as usize));
            }
        }
    }
    if let Some((cur, bits, max)) = window {
        out.push(cur);
        out.push((max + 1) as u8);
        out.extend_from_slice(&bits[..=max]);
    }
    out
}

/// A single resource record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub name: Name,
    pub ttl: u32,
    pub rdata: Rdata,
}

impl Record {
    pub fn new(name: Name, ttl: u32, rdata: Rdata) -> Record {
        Record { name, ttl, rdata }
    }

    pub fn rtype(&self) -> RecordType {
        self.rdata.rtype()
    }

    /// The canonical RR wire form used in signature computation: owner
    /// (lowercased), type, class, TTL, rdlength, rdata
    pub fn to_canonical_wire(&self, original_ttl: u32) -> Vec<u8> {
        let rdata = self.rdata.to_canonical_wire();
        let mut out = Vec::with_capacity(self.name.wire_len() + 10 + rdata.len());
        out.extend_from_slice(&self.name.to_canonical_wire());
        out.extend_from_slice(&self.rtype().to_num().to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&original_ttl.to_be_bytes());
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
        out
    }
}

/// All records sharing an owner and type
///
/// Invariant: members share one TTL, the lesser of the member TTLs on
/// ingest; the configured maximum TTL caps it on output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rrset {
    pub name: Name,
    pub rtype: RecordType,
    pub ttl: u32,
    pub rdatas: Vec<Rdata>,
}

impl Rrset {
    pub fn new(name: Name, rtype: RecordType, ttl: u32) -> Rrset {
        Rrset {
            name,
            rtype,
            ttl,
            rdatas: Vec::new(),
        }
    }

    /// Add one rdata, unifying the TTL downwards
    pub fn push(&mut self, ttl: u32, rdata: Rdata) {
        if self.rdatas.is_empty() {
            self.ttl = ttl;
        } else if ttl < self.ttl {
            self.ttl = ttl;
        }
        if !self.rdatas.contains(&rdata) {
            self.rdatas.push(rdata);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rdatas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rdatas.len()
    }

    /// Members in canonical rdata order, as the signing buffer needs them
    pub fn sorted_rdatas(&self) -> Vec<&Rdata> {
        let mut refs: Vec<&Rdata> = self.rdatas.iter().collect();
        refs.sort_by(|a, b| canonical_rdata_cmp(a, b));
        refs
    }

    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        let name = self.name.clone();
        let ttl = self.ttl;
        self.rdatas
            .iter()
            .map(move |r| Record::new(name.clone(), ttl, r.clone()))
    }
}
