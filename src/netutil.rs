//! Address arithmetic and naming helpers shared by both controllers.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use kube::{Resource, ResourceExt};

pub fn ipv4_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

pub fn u32_to_ipv4(n: u32) -> Ipv4Addr {
    Ipv4Addr::from(n)
}

/// Inclusive `[base, last]` bounds of a CIDR block.
pub fn cidr_bounds(net: &Ipv4Net) -> (u32, u32) {
    (u32::from(net.network()), u32::from(net.broadcast()))
}

/// Signed seconds from `earlier` to `later`, at microsecond resolution.
pub fn secs_between(
    later: chrono::DateTime<chrono::Utc>,
    earlier: chrono::DateTime<chrono::Utc>,
) -> f64 {
    let delta = later - earlier;
    delta
        .num_microseconds()
        .map(|us| us as f64 / 1e6)
        .unwrap_or_else(|| delta.num_milliseconds() as f64 / 1e3)
}

/// Derives a locally-administered unicast MAC address from a VNI and guest
/// address. Deterministic so that an agent restart reproduces the MAC of a
/// surviving interface.
pub fn derive_mac(vni: u32, guest_ip: Ipv4Addr) -> String {
    let o = guest_ip.octets();
    format!(
        "0a:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        (vni & 0xff) as u8,
        o[0],
        o[1],
        o[2],
        o[3]
    )
}

/// Namespace-qualified object name, the unit of work for both workqueues.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nsn {
    pub namespace: String,
    pub name: String,
}

impl Nsn {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self
    where
        K::DynamicType: Default,
    {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }

    /// Parses the `namespace/name` form produced by index keys.
    pub fn parse(key: &str) -> Option<Self> {
        let (ns, name) = key.split_once('/')?;
        Some(Self::new(ns, name))
    }
}

impl fmt::Display for Nsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
