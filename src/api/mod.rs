//! The three kinds of the `network.example.com/v1alpha1` group.
//!
//! A **Subnet** binds an IPv4 CIDR to a virtual-network identifier (VNI). A
//! **NetworkAttachment** asks for one interface on a particular node inside a
//! subnet. An **IPLock** reserves one IPv4 address inside a VNI, cluster-wide,
//! and is owned by the attachment that claimed it.
//!
//! The kinds carry `extendedMetadata` next to the standard object metadata,
//! so `kube::Resource` is implemented by hand instead of through the
//! `CustomResource` derive.

use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use serde::{Deserialize, Serialize};

pub mod meta;
pub use meta::*;

pub const API_GROUP: &str = "network.example.com";
pub const API_VERSION: &str = "v1alpha1";

/// Smallest valid VNI.
pub const VNI_MIN: u32 = 1;
/// Largest valid VNI (21 bits).
pub const VNI_MAX: u32 = (1 << 21) - 1;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// CIDR notation for the v4 address range. Immutable.
    pub ipv4: String,
    /// Virtual network identifier, in `[1, 2097151]`. Immutable.
    pub vni: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubnetStatus {
    /// Set by the subnet validator once the spec has passed validation;
    /// guaranteed to stay true afterwards.
    pub validated: bool,
    /// Validator complaints; non-empty iff validation failed on conflicts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, rename = "extendedMetadata")]
    pub extended: ExtendedObjectMeta,
    pub spec: SubnetSpec,
    #[serde(default)]
    pub status: SubnetStatus,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentSpec {
    /// Name of the node where the attachment should appear. Immutable.
    pub node: String,
    /// Object name of the attachment's subnet. Immutable.
    pub subnet: String,
    /// Command to exec on the attachment's host after a new interface is
    /// created for it. argv[0] must be in the agent's allow-list; arguments
    /// admit `${ifname}`, `${ipv4}` and `${mac}` expansion, nothing else.
    /// Not guaranteed to run when an existing interface is recycled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_create_exec: Vec<String>,
    /// Command to exec after the attachment's interface is deleted, provided
    /// the post-create command had been launched for that interface. The
    /// outcome is not reported in status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_delete_exec: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkAttachmentErrors {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ipam: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkAttachmentStatus {
    pub errors: NetworkAttachmentErrors,
    /// Whether address assignment was delayed because no address was
    /// available at first.
    pub address_contention: bool,
    /// UID of the IPLock holding this attachment's address, or empty.
    #[serde(rename = "lockUID", skip_serializing_if = "String::is_empty")]
    pub lock_uid: String,
    /// VNI of the address assignment, or zero when there is no address.
    #[serde(rename = "addressVNI")]
    pub address_vni: u32,
    /// Non-empty once an address has been assigned.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ipv4: String,
    /// Non-empty while a corresponding interface exists on the host.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mac_address: String,
    /// Name of the interface implementing this attachment, or empty.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ifc_name: String,
    /// IP address of the node the attachment is bound to.
    #[serde(rename = "hostIP", skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
    /// Report on the post-create exec launched when the attachment's
    /// interface was created, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_create_exec_report: Option<ExecReport>,
}

/// What happened when a post-create command was execd.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecReport {
    pub command: Vec<String>,
    /// Linux exit status, or a negative number to signal a prior problem
    /// (detailed in `stdErr`).
    pub exit_status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<chrono::DateTime<chrono::Utc>>,
    pub std_out: String,
    pub std_err: String,
}

impl ExecReport {
    /// Whether the two reports say the same thing within the stored time
    /// precision. The apiservers keep seconds precision.
    pub fn equiv(&self, other: &ExecReport) -> bool {
        fn secs(t: Option<chrono::DateTime<chrono::Utc>>) -> Option<i64> {
            t.map(|t| t.timestamp())
        }
        self.exit_status == other.exit_status
            && self.std_out == other.std_out
            && self.std_err == other.std_err
            && secs(self.start_time) == secs(other.start_time)
            && secs(self.stop_time) == secs(other.stop_time)
    }
}

pub fn exec_reports_equiv(a: Option<&ExecReport>, b: Option<&ExecReport>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.equiv(b),
        _ => false,
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, rename = "extendedMetadata")]
    pub extended: ExtendedObjectMeta,
    pub spec: NetworkAttachmentSpec,
    #[serde(default)]
    pub status: NetworkAttachmentStatus,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPLockSpec {
    pub subnet_name: String,
}

/// Cluster-wide reservation of one IPv4 address inside a VNI. The name
/// encodes the VNI and the address; the sole controller-owner reference
/// points to the claiming NetworkAttachment, which bounds the lock's
/// lifetime through cascade deletion.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPLock {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, rename = "extendedMetadata")]
    pub extended: ExtendedObjectMeta,
    pub spec: IPLockSpec,
}

macro_rules! impl_resource {
    ($kind:ty, $kind_str:literal, $plural:literal) => {
        impl kube::Resource for $kind {
            type DynamicType = ();
            type Scope = NamespaceResourceScope;

            fn kind(_: &()) -> Cow<'_, str> {
                $kind_str.into()
            }
            fn group(_: &()) -> Cow<'_, str> {
                API_GROUP.into()
            }
            fn version(_: &()) -> Cow<'_, str> {
                API_VERSION.into()
            }
            fn plural(_: &()) -> Cow<'_, str> {
                $plural.into()
            }
            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_resource!(Subnet, "Subnet", "subnets");
impl_resource!(NetworkAttachment, "NetworkAttachment", "networkattachments");
impl_resource!(IPLock, "IPLock", "iplocks");

pub const ATTACHMENT_KIND: &str = "NetworkAttachment";

/// Returns the name and UID of the controller-owner of the given kind, if
/// one is recorded.
pub fn controller_owner<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<(&'a str, &'a str)> {
    let mut found = None;
    for oref in meta.owner_references.iter().flatten() {
        if oref.kind == kind && oref.controller == Some(true) {
            found = Some((oref.name.as_str(), oref.uid.as_str()));
        }
    }
    found
}

/// Index keys (`namespace/name`) of the attachments that controller-own the
/// given lock.
pub fn owning_attachment_keys(lock: &IPLock) -> Vec<String> {
    let ns = lock.metadata.namespace.as_deref().unwrap_or_default();
    lock.metadata
        .owner_references
        .iter()
        .flatten()
        .filter(|o| o.kind == ATTACHMENT_KIND && o.controller == Some(true))
        .map(|o| format!("{ns}/{}", o.name))
        .collect()
}

/// An owner reference marking `att` as the controller of a dependent object.
pub fn attachment_owner_ref(att: &NetworkAttachment) -> OwnerReference {
    OwnerReference {
        api_version: format!("{API_GROUP}/{API_VERSION}"),
        kind: ATTACHMENT_KIND.to_owned(),
        name: att.metadata.name.clone().unwrap_or_default(),
        uid: att.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}
