//! Interfaces the agent has linked to attachment keys.

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::api::{ExecReport, NetworkAttachment};

/// Name of the index used to match pre-existing interfaces to the
/// attachment that can own them. Indexed values are `<vni>/<guestIP>` in
/// the local informer and `<hostIP>/<guestIP>` in remote informers.
pub const IFC_OWNER_DATA_INDEX: &str = "ifcOwnerData";

/// An interface carrying a guest on this host.
#[derive(Clone, Debug)]
pub struct LocalInterface {
    pub name: String,
    pub vni: u32,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: String,
    /// Captured at link time, for the post-delete hook.
    pub post_delete_exec: Vec<String>,
    /// Whether the post-create command has been launched for this
    /// interface (at most once per interface, not per attachment).
    pub post_create_launched: Arc<AtomicBool>,
    /// Filled in by the exec task when the command finishes.
    pub post_create_report: Arc<Mutex<Option<ExecReport>>>,
}

/// A tunnel endpoint towards a guest on another host.
#[derive(Clone, Debug)]
pub struct RemoteInterface {
    pub name: String,
    pub vni: u32,
    pub guest_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub enum NetworkInterface {
    Local(LocalInterface),
    Remote(RemoteInterface),
}

impl NetworkInterface {
    pub fn name(&self) -> &str {
        match self {
            NetworkInterface::Local(ifc) => &ifc.name,
            NetworkInterface::Remote(ifc) => &ifc.name,
        }
    }

    /// Whether the attachment, as currently written, is implemented by
    /// this interface.
    pub fn can_be_owned_by(&self, att: Option<&NetworkAttachment>, node: &str) -> bool {
        let Some(att) = att else {
            return false;
        };
        match self {
            NetworkInterface::Local(ifc) => {
                att.spec.node == node
                    && att.status.address_vni == ifc.vni
                    && att.status.ipv4 == ifc.guest_ip.to_string()
            }
            NetworkInterface::Remote(ifc) => {
                att.spec.node != node
                    && att.status.address_vni == ifc.vni
                    && att.status.ipv4 == ifc.guest_ip.to_string()
                    && att.status.host_ip == ifc.host_ip.to_string()
            }
        }
    }
}

/// Index function for the local-attachments informer.
pub fn local_ifc_owner_keys(att: &NetworkAttachment) -> Vec<String> {
    if att.status.ipv4.is_empty() {
        return Vec::new();
    }
    vec![format!("{}/{}", att.status.address_vni, att.status.ipv4)]
}

/// Index function for remote-attachments informers.
pub fn remote_ifc_owner_keys(att: &NetworkAttachment) -> Vec<String> {
    if att.status.ipv4.is_empty() || att.status.host_ip.is_empty() {
        return Vec::new();
    }
    vec![format!("{}/{}", att.status.host_ip, att.status.ipv4)]
}
