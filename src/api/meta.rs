//! Extended object metadata maintained by the apiserver.
//!
//! Every kind in the `network.example.com` group carries, next to the
//! standard object metadata, a record of when each section of the object was
//! last written (server-stamped microtime), the most upstream client write
//! the object depends on, and the latest controller restart involved in
//! producing it. Controllers read these to compute end-to-end latencies and
//! to attribute delay to downtime; only the server writes `writes`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Write sections of a NetworkAttachment.
pub const NA_SECTION_SPEC: &str = "spec";
pub const NA_SECTION_ADDR: &str = "status.address";
pub const NA_SECTION_IMPL: &str = "status.impl";
pub const NA_SECTION_EXEC_REPORT: &str = "status.execReport";

// Write sections of a Subnet.
pub const SUBNET_SECTION_SPEC: &str = "spec";
pub const SUBNET_SECTION_STATUS: &str = "status";

// Write sections of an IPLock.
pub const IPLOCK_SECTION_SPEC: &str = "spec";

// Client-write names.
pub const NA_CLIENT_WRITE: &str = "na";
pub const SUBNET_CLIENT_WRITE: &str = "subnet";

// Controller names recorded in `lastControllerStart`.
pub const SUBNET_VALIDATOR_START: &str = "subnet_validator";
pub const IPAM_CONTROLLER_START: &str = "ipam_controller";
pub const LOCAL_AGENT_START: &str = "local_connection_agent";

/// A write to one section of an object, stamped with the server clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectWrite {
    pub section: String,
    pub server_time: DateTime<Utc>,
}

/// The latest write to each section of an object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteSet(pub Vec<ObjectWrite>);

impl WriteSet {
    pub fn get(&self, section: &str) -> Option<&ObjectWrite> {
        self.0.iter().find(|w| w.section == section)
    }

    /// Server time of the last write to `section`, if any.
    pub fn server_write_time(&self, section: &str) -> Option<DateTime<Utc>> {
        self.get(section).map(|w| w.server_time)
    }

    pub fn set(&mut self, section: &str, server_time: DateTime<Utc>) {
        if let Some(w) = self.0.iter_mut().find(|w| w.section == section) {
            w.server_time = server_time;
        } else {
            self.0.push(ObjectWrite {
                section: section.to_owned(),
                server_time,
            });
        }
    }
}

/// A write by a client, i.e. any entity outside this control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientWrite {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// The start of a controller, as recorded by the controller itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerStart {
    pub controller: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtendedObjectMeta {
    pub writes: WriteSet,
    pub last_client_write: ClientWrite,
    pub last_controller_start: ControllerStart,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_set_get_and_replace() {
        let mut ws = WriteSet::default();
        assert_eq!(ws.server_write_time("spec"), None);
        let t1 = Utc::now();
        ws.set("spec", t1);
        assert_eq!(ws.server_write_time("spec"), Some(t1));
        let t2 = t1 + chrono::Duration::seconds(1);
        ws.set("spec", t2);
        ws.set("status", t1);
        assert_eq!(ws.server_write_time("spec"), Some(t2));
        assert_eq!(ws.server_write_time("status"), Some(t1));
        assert_eq!(ws.0.len(), 2);
    }
}
