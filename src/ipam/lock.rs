//! IPLock names and their parsed form.
//!
//! A lock's name is `v1-<decimalVNI>-<b0>-<b1>-<b2>-<b3>`, octets big-endian,
//! so whether an address is locked is a point query by name.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::api::{controller_owner, IPLock, ATTACHMENT_KIND};
use crate::netutil::u32_to_ipv4;

#[derive(Debug, Error)]
pub enum LockNameError {
    #[error("lock name {0:?} is malformed")]
    Malformed(String),
    #[error("VNI in lock name {0:?} is malformed")]
    BadVni(String),
    #[error("lock name {0:?} is malformed at address byte {1}")]
    BadOctet(String, usize),
}

pub fn make_lock_name(vni: u32, ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("v1-{}-{}-{}-{}-{}", vni, o[0], o[1], o[2], o[3])
}

/// Parses a lock name back into its VNI and address. Rejects anything that
/// `make_lock_name` would not produce.
pub fn parse_lock_name(name: &str) -> Result<(u32, u32), LockNameError> {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() != 6 || parts[0] != "v1" {
        return Err(LockNameError::Malformed(name.to_owned()));
    }
    let vni: u32 = parts[1]
        .parse()
        .ok()
        .filter(|v| *v <= crate::api::VNI_MAX)
        .ok_or_else(|| LockNameError::BadVni(name.to_owned()))?;
    let mut addr: u32 = 0;
    for (i, part) in parts[2..].iter().enumerate() {
        let octet: u8 = part
            .parse()
            .map_err(|_| LockNameError::BadOctet(name.to_owned(), i))?;
        addr = addr << 8 | u32::from(octet);
    }
    Ok((vni, addr))
}

/// An IPLock whose name has been decoded, plus the identifying metadata the
/// reconciler works with.
#[derive(Clone, Debug)]
pub struct ParsedLock {
    pub namespace: String,
    pub name: String,
    pub vni: u32,
    pub addr: u32,
    pub uid: String,
    pub creation: Option<DateTime<Utc>>,
}

impl ParsedLock {
    pub fn from_lock(lock: &IPLock) -> Result<Self, LockNameError> {
        let name = lock.metadata.name.clone().unwrap_or_default();
        let (vni, addr) = parse_lock_name(&name)?;
        Ok(Self {
            namespace: lock.metadata.namespace.clone().unwrap_or_default(),
            name,
            vni,
            addr,
            uid: lock.metadata.uid.clone().unwrap_or_default(),
            creation: lock.metadata.creation_timestamp.as_ref().map(|t| t.0),
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        u32_to_ipv4(self.addr)
    }

    /// Preference order for picking among usable locks: oldest first, ties
    /// broken towards the larger UID. Deterministic, so replicated
    /// controllers tend to converge on the same choice.
    pub fn is_better_than(&self, other: &ParsedLock) -> bool {
        if self.creation != other.creation {
            // None sorts first, like the zero time it stands for.
            self.creation < other.creation
        } else {
            self.uid > other.uid
        }
    }

    /// Whether the lock's controller-owner is the attachment with the given
    /// name and UID.
    pub fn owned_by(lock: &IPLock, att_name: &str, att_uid: &str) -> bool {
        controller_owner(&lock.metadata, ATTACHMENT_KIND)
            .is_some_and(|(name, uid)| name == att_name && uid == att_uid)
    }
}

impl fmt::Display for ParsedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}/{:x}={}", self.vni, self.addr, self.uid)
    }
}

pub fn best(locks: &[ParsedLock]) -> Option<&ParsedLock> {
    let mut it = locks.iter();
    let mut ans = it.next()?;
    for lock in it {
        if lock.is_better_than(ans) {
            ans = lock;
        }
    }
    Some(ans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        for (vni, ip) in [
            (1u32, "0.0.0.0"),
            (7, "192.168.0.3"),
            ((1 << 21) - 1, "255.255.255.255"),
        ] {
            let ip: Ipv4Addr = ip.parse().unwrap();
            let name = make_lock_name(vni, ip);
            let (v, a) = parse_lock_name(&name).unwrap();
            assert_eq!((v, u32_to_ipv4(a)), (vni, ip));
        }
        assert_eq!(make_lock_name(7, "10.0.0.2".parse().unwrap()), "v1-7-10-0-0-2");
    }

    #[test]
    fn parse_rejects_malformed_names() {
        for bad in [
            "",
            "v1-7-10-0-0",
            "v1-7-10-0-0-2-9",
            "v2-7-10-0-0-2",
            "v1-2097152-10-0-0-2", // VNI does not fit in 21 bits
            "v1-7-256-0-0-2",
            "v1-7-a-0-0-2",
            "v1--10-0-0-2",
        ] {
            assert!(parse_lock_name(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn best_prefers_oldest_then_larger_uid() {
        let t0 = Utc::now();
        let mk = |uid: &str, creation| ParsedLock {
            namespace: "default".into(),
            name: "v1-7-10-0-0-2".into(),
            vni: 7,
            addr: 0x0a000002,
            uid: uid.into(),
            creation,
        };
        let older = mk("aaa", Some(t0));
        let newer = mk("zzz", Some(t0 + chrono::Duration::seconds(5)));
        assert_eq!(best(&[newer.clone(), older.clone()]).unwrap().uid, "aaa");
        let tied_small = mk("aaa", Some(t0));
        let tied_large = mk("bbb", Some(t0));
        assert_eq!(best(&[tied_small, tied_large]).unwrap().uid, "bbb");
        assert!(best(&[]).is_none());
    }
}
