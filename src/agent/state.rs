//! The two-stage bookkeeping behind the dynamic informer fleet.
//!
//! Stage 1 routes attachment keys to the informer cache that currently
//! holds them and tracks the remote attachments per virtual network; it is
//! written by notification handlers, so operations on it must be brief.
//! Stage 2 tracks relevance: which local attachments belong to each virtual
//! network, and the remote informer whose lifetime that membership gates;
//! it is written by queue workers.
//!
//! When both locks are needed, stage 2 is acquired first, then stage 1.
//! The other order deadlocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::api::NetworkAttachment;
use crate::cache::CacheCore;
use crate::netutil::Nsn;

/// Stand-in VNI identifying the local-attachments informer in the stage-1
/// routing table. Not a valid VNI, so it cannot collide with a remote
/// informer's.
pub const LOCAL_INFORMER_VNI: u32 = 0;

/// Stops the watch task feeding an informer cache when stopped or dropped.
pub struct InformerHandle {
    stop: Option<watch::Sender<bool>>,
}

impl InformerHandle {
    pub fn new(stop: watch::Sender<bool>) -> Self {
        Self { stop: Some(stop) }
    }

    /// A handle with nothing to stop; used by informers fed directly.
    pub fn noop() -> Self {
        Self { stop: None }
    }

    pub fn stop(&self) {
        if let Some(stop) = &self.stop {
            let _ = stop.send(true);
        }
    }
}

/// Creates informers scoped to this agent's slices of the attachment space.
/// A seam so the agent can run against caches fed directly in tests.
pub trait InformerFactory: Send + Sync {
    /// Starts the informer on attachments local to this node that have an
    /// address.
    fn start_local_informer(&self, cache: Arc<CacheCore<NetworkAttachment>>) -> InformerHandle;

    /// Starts the informer on remote attachments of one virtual network
    /// that have an address and a known host.
    fn start_remote_informer(
        &self,
        namespace: &str,
        vni: u32,
        cache: Arc<CacheCore<NetworkAttachment>>,
    ) -> InformerHandle;
}

/// Stage-1 state of one relevant virtual network.
pub struct Stage1VnState {
    /// Identifies the VN lifecycle this state belongs to. Handlers bound
    /// to a remote informer carry the generation they were created for and
    /// must not touch state of a newer lifecycle with the same VNI.
    pub generation: u64,
    /// Remote attachments whose add notification has run and whose delete
    /// notification has not.
    pub remote_atts: HashSet<String>,
    /// Cache workers read the attachment from.
    pub cache: Arc<CacheCore<NetworkAttachment>>,
    /// The event that made the VN relevant: the attachment's recorded last
    /// client write. Watch notifications are unordered, so this is an
    /// estimate; `relevance_delay_secs` tracks how far off it turned out
    /// to be.
    pub relevance_trigger: String,
    pub relevance_time: Option<DateTime<Utc>>,
    pub relevance_last_controller_start: Option<DateTime<Utc>>,
    pub relevance_delay_secs: f64,
}

#[derive(Default)]
pub struct Stage1State {
    /// For a namespaced name, the VNIs of the informers whose cache holds
    /// an attachment by that name. Maintained by notification handlers, so
    /// it lags the caches slightly.
    pub att_to_vnis: HashMap<Nsn, HashSet<u32>>,
    pub vni_to_state: HashMap<u32, Stage1VnState>,
}

/// Stage-2 state of one relevant virtual network.
pub struct Stage2VnState {
    /// Namespace of the virtual network (the namespace of the first local
    /// attachment recorded in it).
    pub namespace: String,
    /// Names of the local attachments in the VN; relevance ends when the
    /// last one leaves.
    pub local_atts: HashSet<String>,
    pub cache: Arc<CacheCore<NetworkAttachment>>,
    pub informer: InformerHandle,
}

#[derive(Default)]
pub struct Stage2State {
    pub local_att_to_vni: HashMap<Nsn, u32>,
    pub vni_to_state: HashMap<u32, Stage2VnState>,
}
