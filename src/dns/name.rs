//! Owner names
//!
//! Names are label sequences with case-insensitive equality and DNSSEC
//! canonical ordering (RFC 4034 section 6.1): labels are compared from the
//! rightmost label leftwards, case-folded, with a missing label sorting
//! before any present label. `Ord` on `Name` is exactly that order, so a
//! `BTreeMap<Name, _>` iterates a zone in chain order natively.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use derive_more::{Display, Error};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Largest wire form of a name, per RFC 1035
pub const MAX_NAME_WIRE_LEN: usize = 255;

/// Largest single label
pub const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[display(fmt = "empty label in name")]
    EmptyLabel,
    #[display(fmt = "label exceeds 63 octets")]
    LabelTooLong,
    #[display(fmt = "name exceeds 255 octets in wire form")]
    NameTooLong,
}

/// An owner name: a sequence of labels, stored root-last, original case
/// preserved. The root name has no labels.
#[derive(Debug, Clone, Default)]
pub struct Name {
    labels: Vec<Vec<u8>>,
}

fn fold(b: u8) -> u8 {
    if (b'A'..=b'Z').contains(&b) {
        b + 32
    } else {
        b
    }
}

impl Name {
    /// The root name `.`
    pub fn root() -> Name {
        Name { labels: Vec::new() }
    }

    pub fn from_labels(labels: Vec<Vec<u8>>) -> Result<Name, NameError> {
        let name = Name { labels };
        name.check()?;
        Ok(name)
    }

    fn check(&self) -> Result<(), NameError> {
        let mut wire_len = 1;
        for label in &self.labels {
            if label.is_empty() {
                return Err(NameError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(NameError::LabelTooLong);
            }
            wire_len += 1 + label.len();
        }
        if wire_len > MAX_NAME_WIRE_LEN {
            return Err(NameError::NameTooLong);
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of labels, excluding the implicit root
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    /// True if the leftmost label is `*`
    pub fn is_wildcard(&self) -> bool {
        self.labels.first().map(|l| l.as_slice()) == Some(b"*")
    }

    /// The RRSIG label count: non-root labels, not counting a leading `*`
    pub fn rrsig_label_count(&self) -> u8 {
        let count = if self.is_wildcard() {
            self.labels.len() - 1
        } else {
            self.labels.len()
        };
        count as u8
    }

    /// The name with the leftmost label removed; `None` at the root
    pub fn parent(&self) -> Option<Name> {
        if self.labels.is_empty() {
            None
        } else {
            Some(Name {
                labels: self.labels[1..].to_vec(),
            })
        }
    }

    /// Prepend one label
    pub fn child(&self, label: &[u8]) -> Result<Name, NameError> {
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push(label.to_vec());
        labels.extend_from_slice(&self.labels);
        Name::from_labels(labels)
    }

    /// The wildcard child `*.self`
    pub fn wildcard_child(&self) -> Name {
        // a single extra label never overflows a valid parent
        self.child(b"*").unwrap_or_else(|_| self.clone())
    }

    /// True if `self` is `other` or lies below it
    pub fn is_subdomain_of(&self, other: &Name) -> bool {
        if other.labels.len() > self.labels.len() {
            return false;
        }
        let skip = self.labels.len() - other.labels.len();
        self.labels[skip..]
            .iter()
            .zip(other.labels.iter())
            .all(|(a, b)| label_eq(a, b))
    }

    /// Number of trailing labels shared with `other`
    pub fn common_label_count(&self, other: &Name) -> usize {
        self.labels
            .iter()
            .rev()
            .zip(other.labels.iter().rev())
            .take_while(|(a, b)| label_eq(a, b))
            .count()
    }

    /// The name formed by the rightmost `count` labels
    pub fn suffix(&self, count: usize) -> Name {
        let skip = self.labels.len().saturating_sub(count);
        Name {
            labels: self.labels[skip..].to_vec(),
        }
    }

    /// Uncompressed wire form, original case
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        for label in &self.labels {
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
        out
    }

    /// Uncompressed wire form, case-folded to lower case, as DNSSEC
    /// canonical form requires for signing and hashing
    pub fn to_canonical_wire(&self) -> Vec<u8> {
        let mut out = self.to_wire();
        for b in out.iter_mut() {
            *b = fold(*b);
        }
        out
    }

    pub fn wire_len(&self) -> usize {
        1 + self.labels.iter().map(|l| 1 + l.len()).sum::<usize>()
    }
}

fn label_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| fold(*x) == fold(*y))
}

fn label_cmp(a: &[u8], b: &[u8]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match fold(*x).cmp(&fold(*y)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

impl PartialEq for Name {
    fn eq(&self, other: &Name) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(other.labels.iter())
                .all(|(a, b)| label_eq(a, b))
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in &self.labels {
            state.write_usize(label.len());
            for b in label {
                state.write_u8(fold(*b));
            }
        }
    }
}

impl Ord for Name {
    /// DNSSEC canonical order: compare rightmost labels first
    fn cmp(&self, other: &Name) -> Ordering {
        let mut a = self.labels.iter().rev();
        let mut b = other.labels.iter().rev();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(x), Some(y)) => match label_cmp(x, y) {
                    Ordering::Equal => continue,
                    other => return other,
                },
            }
        }
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Name) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Name, NameError> {
        let trimmed = s.trim_end_matches('.');
        if trimmed.is_empty() {
            return Ok(Name::root());
        }
        let labels = trimmed
            .split('.')
            .map(|l| l.as_bytes().to_vec())
            .collect::<Vec<_>>();
        Name::from_labels(labels)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, ".");
        }
        for label in &self.labels {
            for &b in label {
                if b == b'.' || b == b'\\' {
                    write!(f, "\\{}", b as char)?;
                } else if (0x21..=0x7e).contains(&b) {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{:03}", b)?;
                }
            }
            write!(f, ".")?;
        }
        Ok(())
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Name, D::Error> {
        let s = String::deserialize(deserializer)?;
        Name::from_str(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(name("example.com").to_string(), "example.com.");
        assert_eq!(name("example.com.").to_string(), "example.com.");
        assert_eq!(name(".").to_string(), ".");
        assert_eq!(name("").to_string(), ".");
        assert_eq!(name("*.example.com").to_string(), "*.example.com.");
    }

    #[test]
    fn test_case_insensitive_equality() {
        assert_eq!(name("EXAMPLE.com"), name("example.COM"));
        assert_ne!(name("example.com"), name("example.org"));
    }

    #[test]
    fn test_canonical_order_rfc4034() {
        // the ordered example list from RFC 4034 section 6.1
        let ordered = vec![
            name("example"),
            name("a.example"),
            name("yljkjljk.a.example"),
            name("Z.a.example"),
            name("zABC.a.EXAMPLE"),
            name("z.example"),
            name("*.z.example"),
            name("zz.example"),
        ];
        let mut shuffled = ordered.clone();
        shuffled.reverse();
        shuffled.sort();
        assert_eq!(shuffled, ordered);
    }

    #[test]
    fn test_subdomain() {
        assert!(name("www.example.com").is_subdomain_of(&name("example.com")));
        assert!(name("example.com").is_subdomain_of(&name("example.com")));
        assert!(!name("example.com").is_subdomain_of(&name("www.example.com")));
        assert!(!name("notexample.com").is_subdomain_of(&name("example.com")));
        assert!(name("anything.at.all").is_subdomain_of(&Name::root()));
    }

    #[test]
    fn test_wildcard() {
        assert!(name("*.example.com").is_wildcard());
        assert!(!name("a.example.com").is_wildcard());
        assert_eq!(name("*.example.com").rrsig_label_count(), 2);
        assert_eq!(name("a.example.com").rrsig_label_count(), 3);
    }

    #[test]
    fn test_wire_form() {
        assert_eq!(
            name("Example.com").to_wire(),
            b"\x07Example\x03com\x00".to_vec()
        );
        assert_eq!(
            name("Example.com").to_canonical_wire(),
            b"\x07example\x03com\x00".to_vec()
        );
        assert_eq!(Name::root().to_wire(), vec![0]);
    }

    #[test]
    fn test_limits() {
        let long_label = "a".repeat(64);
        assert!(Name::from_str(&long_label).is_err());
        let ok_label = "a".repeat(63);
        assert!(Name::from_str(&ok_label).is_ok());

        let many = vec!["abcdefghijklmnop"; 16].join(".");
        assert!(Name::from_str(&many).is_err());
    }

    #[test]
    fn test_parent_child() {
        let n = name("www.example.com");
        assert_eq!(n.parent().unwrap(), name("example.com"));
        assert_eq!(Name::root().parent(), None);
        assert_eq!(
            name("example.com").child(b"sub").unwrap(),
            name("sub.example.com")
        );
        assert_eq!(
            name("example.com").wildcard_child(),
            name("*.example.com")
        );
    }

    #[test]
    fn test_common_label_count() {
        assert_eq!(
            name("a.b.example.com").common_label_count(&name("x.example.com")),
            2
        );
        assert_eq!(name("a.b.c").common_label_count(&name("a.b.c")), 3);
        assert_eq!(name("com").common_label_count(&name("org")), 0);
    }
}
