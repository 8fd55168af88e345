//! The connection agent.
//!
//! Runs on every node. For each attachment placed on this node it creates
//! the local interface and writes the implementation details back into the
//! attachment's status; for every other host with an attachment in a VNI
//! also present locally, it maintains a tunnel endpoint. Interest in a VNI
//! is dynamic: the first local attachment in a VNI starts a remote-
//! attachments informer for it, the last one leaving stops it and tears
//! the remote interfaces down.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::api::Api;
use kube_runtime::watcher;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{
    exec_reports_equiv, ClientWrite, ControllerStart, ExecReport, NetworkAttachment,
    LOCAL_AGENT_START, NA_SECTION_IMPL,
};
use crate::cache::{spawn_watcher, CacheCore, CacheEvent, WorkQueue};
use crate::fabric::{FabricError, InterfaceDescriptor, InterfaceManager};
use crate::netutil::{derive_mac, secs_between, Nsn};
use crate::observability::metrics::{fmt_err_bool, AgentMetrics, OP_DELETE, OP_LIST};
use crate::store::{NetApi, StoreError};

pub mod exec;
pub mod interfaces;
pub mod state;

pub use interfaces::{
    local_ifc_owner_keys, remote_ifc_owner_keys, LocalInterface, NetworkInterface,
    RemoteInterface, IFC_OWNER_DATA_INDEX,
};
pub use state::{
    InformerFactory, InformerHandle, Stage1State, Stage1VnState, Stage2State, Stage2VnState,
    LOCAL_INFORMER_VNI,
};

const OP_CREATE_LOCAL: &str = "create_local";
const OP_CREATE_REMOTE: &str = "create_remote";

/// Wait between attempts to delete an orphaned pre-existing interface.
const FABRIC_RETRY_PERIOD: Duration = Duration::from_secs(1);

const RELEVANCE_DELAY_GRACE_SECS: f64 = 0.01;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Transient(String),
}

/// When the virtual network of a remote attachment became relevant here,
/// and why. Feeds the remote-interface latency metrics.
#[derive(Clone, Debug, Default)]
pub struct VnRelevance {
    pub trigger: String,
    pub time: Option<DateTime<Utc>>,
    pub last_controller_start: Option<DateTime<Utc>>,
}

pub struct ConnectionAgent {
    me: Weak<Self>,
    node: String,
    host_ip: Ipv4Addr,
    api: Arc<dyn NetApi>,
    factory: Arc<dyn InformerFactory>,
    fabric: Arc<dyn InterfaceManager>,
    queue: Arc<WorkQueue<Nsn>>,
    workers: usize,
    start_time: DateTime<Utc>,
    local_atts: Arc<CacheCore<NetworkAttachment>>,
    s1: RwLock<Stage1State>,
    s2: Mutex<Stage2State>,
    interfaces: RwLock<HashMap<Nsn, NetworkInterface>>,
    allowed_programs: HashSet<String>,
    next_generation: AtomicU64,
    metrics: AgentMetrics,
}

impl ConnectionAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: String,
        host_ip: Ipv4Addr,
        api: Arc<dyn NetApi>,
        factory: Arc<dyn InformerFactory>,
        fabric: Arc<dyn InterfaceManager>,
        queue: Arc<WorkQueue<Nsn>>,
        workers: usize,
        allowed_programs: HashSet<String>,
        metrics: AgentMetrics,
    ) -> Arc<Self> {
        let agent = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node,
            host_ip,
            api,
            factory,
            fabric,
            queue,
            workers,
            start_time: Utc::now(),
            local_atts: CacheCore::new(),
            s1: RwLock::new(Stage1State::default()),
            s2: Mutex::new(Stage2State::default()),
            interfaces: RwLock::new(HashMap::new()),
            allowed_programs,
            next_generation: AtomicU64::new(0),
            metrics,
        });
        agent.register_local_handlers();
        agent
    }

    pub fn local_cache(&self) -> Arc<CacheCore<NetworkAttachment>> {
        Arc::clone(&self.local_atts)
    }

    fn register_local_handlers(self: &Arc<Self>) {
        self.local_atts
            .add_index(IFC_OWNER_DATA_INDEX, local_ifc_owner_keys);
        let me = Arc::downgrade(self);
        self.local_atts
            .add_handler(move |ev: &CacheEvent<NetworkAttachment>| {
                let Some(agent) = me.upgrade() else { return };
                match ev {
                    CacheEvent::Add(att) => {
                        let nsn = Nsn::of(att.as_ref());
                        agent.update_s1(&nsn, LOCAL_INFORMER_VNI, None, true);
                        agent.queue.add(nsn);
                    }
                    CacheEvent::Update { old, new } => {
                        // A replaced attachment (new UID) loses its hostIP
                        // and must be re-processed; otherwise only address
                        // or VNI changes affect local interface handling.
                        if old.metadata.uid != new.metadata.uid
                            || old.status.ipv4 != new.status.ipv4
                            || old.status.address_vni != new.status.address_vni
                        {
                            agent.queue.add(Nsn::of(new.as_ref()));
                        }
                    }
                    CacheEvent::Delete(att) => {
                        let nsn = Nsn::of(att.as_ref());
                        agent.update_s1(&nsn, LOCAL_INFORMER_VNI, None, false);
                        agent.queue.add(nsn);
                    }
                }
            });
    }

    /// Runs the agent until `stop` signals shutdown: starts the local
    /// informer, adopts pre-existing interfaces, then processes the queue.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(node = %self.node, "starting connection agent");

        let local_informer = self.factory.start_local_informer(self.local_cache());
        self.local_atts.wait_synced().await;
        debug!("local attachments informer synced");

        self.sync_pre_existing_interfaces().await?;
        debug!("pre-existing network interfaces synced");

        for _ in 0..self.workers {
            let agent = Arc::clone(&self);
            tokio::spawn(async move { agent.worker().await });
        }
        debug!(workers = self.workers, "launched workers");

        let _ = stop.changed().await;
        self.queue.shut_down();
        local_informer.stop();
        info!("shutting down connection agent");
        Ok(())
    }

    async fn worker(self: Arc<Self>) {
        while let Some(nsn) = self.queue.get().await {
            let result = self.process_attachment(&nsn).await;
            let requeues = self.queue.num_requeues(&nsn);
            match result {
                Ok(()) => {
                    debug!(attachment = %nsn, requeues, "finished attachment");
                    self.queue.forget(&nsn);
                }
                Err(err) => {
                    warn!(attachment = %nsn, requeues, error = %err, "failed processing attachment, requeuing");
                    self.queue.add_rate_limited(nsn.clone());
                }
            }
            self.queue.done(&nsn);
        }
    }

    /// Reconciles one attachment key.
    pub async fn process_attachment(&self, nsn: &Nsn) -> Result<(), ReconcileError> {
        let (att, relevance, halt) = self.get_attachment(nsn);
        if halt {
            return Ok(());
        }

        self.sync_s2_state(nsn, att.as_deref())?;

        let (ifc, status_errs) = self
            .sync_network_interface(nsn, att.as_deref(), &relevance)
            .await?;

        let Some(att) = att else { return Ok(()) };
        if att.spec.node != self.node {
            return Ok(());
        }
        // A live local attachment has a local interface after the sync
        // above.
        let Some(NetworkInterface::Local(local_ifc)) = ifc else {
            return Ok(());
        };
        let report = local_ifc.post_create_report.lock().unwrap().clone();
        if self.local_attachment_up_to_date(&att, &local_ifc, &status_errs, report.as_ref()) {
            return Ok(());
        }
        self.update_local_attachment_status(nsn, &att, &local_ifc, status_errs, report)
            .await
    }

    /// Resolves the univocal version of the attachment through the stage-1
    /// routing table. The third return value asks the caller to halt: the
    /// key is currently in more than one informer and the pending delete
    /// notification will disambiguate it.
    fn get_attachment(&self, nsn: &Nsn) -> (Option<Arc<NetworkAttachment>>, VnRelevance, bool) {
        let s1 = self.s1.read().unwrap();
        let Some(vnis) = s1.att_to_vnis.get(nsn) else {
            return (None, VnRelevance::default(), false);
        };
        if vnis.len() > 1 {
            debug!(attachment = %nsn, "seen in more than one informer, halting until deletes resolve the ambiguity");
            return (None, VnRelevance::default(), true);
        }
        let Some(&vni) = vnis.iter().next() else {
            return (None, VnRelevance::default(), false);
        };
        if vni == LOCAL_INFORMER_VNI {
            (
                self.local_atts.get(&nsn.namespace, &nsn.name),
                VnRelevance::default(),
                false,
            )
        } else {
            match s1.vni_to_state.get(&vni) {
                Some(vn) => (
                    vn.cache.get(&nsn.namespace, &nsn.name),
                    VnRelevance {
                        trigger: vn.relevance_trigger.clone(),
                        time: vn.relevance_time,
                        last_controller_start: vn.relevance_last_controller_start,
                    },
                    false,
                ),
                None => (None, VnRelevance::default(), false),
            }
        }
    }

    fn sync_s2_state(
        &self,
        nsn: &Nsn,
        att: Option<&NetworkAttachment>,
    ) -> Result<(), ReconcileError> {
        let mut s2 = self.s2.lock().unwrap();
        let old_vni = s2.local_att_to_vni.get(nsn).copied();
        if let Some(vni) = old_vni {
            let leaves = match att {
                None => true,
                Some(att) => vni != att.status.address_vni || att.spec.node != self.node,
            };
            if leaves {
                self.remove_local_att_from_s2(&mut s2, nsn, vni);
            }
        }
        if let Some(att) = att {
            if att.spec.node == self.node && old_vni != Some(att.status.address_vni) {
                self.add_local_att_to_s2(&mut s2, att, false)
                    .map_err(ReconcileError::Transient)?;
            }
        }
        Ok(())
    }

    /// Adds a local attachment to its VN's stage-2 state, initialising the
    /// VN (and its remote informer) if this is its first local attachment.
    fn add_local_att_to_s2(
        &self,
        s2: &mut Stage2State,
        att: &NetworkAttachment,
        initial_sync: bool,
    ) -> Result<(), String> {
        let nsn = Nsn::of(att);
        let vni = att.status.address_vni;
        let trigger = att.extended.last_client_write.clone();
        let last_controller_start = att.extended.last_controller_start.controller_time;

        let existed = s2.vni_to_state.contains_key(&vni);
        if !existed {
            self.init_vn_state(s2, vni, &nsn.namespace, &trigger, last_controller_start);
            info!(
                vni = %format!("{vni:06x}"),
                attachment = %nsn,
                "virtual network became relevant with its first local attachment"
            );
        }
        let vn = s2.vni_to_state.get_mut(&vni).expect("just ensured");
        if vn.namespace != nsn.namespace {
            // A VN with this VNI was deleted and recreated under another
            // namespace and not all notifications have landed yet. The
            // older attachments will drain out of the informer first;
            // retry later.
            return Err(format!(
                "attachment is local but the namespace recorded for VNI {vni:06x} ({}) does not match the attachment's",
                vn.namespace
            ));
        }
        if existed {
            self.touch_stage1(&nsn, vni, &trigger, last_controller_start, initial_sync);
        }
        s2.local_att_to_vni.insert(nsn.clone(), vni);
        vn.local_atts.insert(nsn.name);
        Ok(())
    }

    /// Removes a local attachment from its VN's stage-2 state; the VN
    /// becomes irrelevant when its last local attachment leaves.
    fn remove_local_att_from_s2(&self, s2: &mut Stage2State, nsn: &Nsn, vni: u32) {
        s2.local_att_to_vni.remove(nsn);
        let Some(vn) = s2.vni_to_state.get_mut(&vni) else {
            return;
        };
        vn.local_atts.remove(&nsn.name);
        if vn.local_atts.is_empty() {
            let vn = s2.vni_to_state.remove(&vni).expect("present");
            vn.informer.stop();
            self.clear_stage1(vni, &vn.namespace);
            info!(
                vni = %format!("{vni:06x}"),
                attachment = %nsn,
                "virtual network became irrelevant with its last local attachment"
            );
        }
    }

    /// Builds the remote informer for a newly relevant VN and the stage-1
    /// entry routing its attachments.
    fn init_vn_state(
        &self,
        s2: &mut Stage2State,
        vni: u32,
        namespace: &str,
        trigger: &ClientWrite,
        last_controller_start: Option<DateTime<Utc>>,
    ) {
        let cache: Arc<CacheCore<NetworkAttachment>> = CacheCore::new();
        cache.add_index(IFC_OWNER_DATA_INDEX, remote_ifc_owner_keys);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.register_remote_handlers(&cache, vni, generation);
        let informer = self
            .factory
            .start_remote_informer(namespace, vni, Arc::clone(&cache));
        s2.vni_to_state.insert(
            vni,
            Stage2VnState {
                namespace: namespace.to_owned(),
                local_atts: HashSet::new(),
                cache: Arc::clone(&cache),
                informer,
            },
        );

        let mut s1 = self.s1.write().unwrap();
        s1.vni_to_state.insert(
            vni,
            Stage1VnState {
                generation,
                remote_atts: HashSet::new(),
                cache,
                relevance_trigger: trigger.name.clone(),
                relevance_time: trigger.time,
                relevance_last_controller_start: last_controller_start,
                relevance_delay_secs: 0.0,
            },
        );
    }

    fn register_remote_handlers(
        &self,
        cache: &Arc<CacheCore<NetworkAttachment>>,
        vni: u32,
        generation: u64,
    ) {
        let me = self.me.clone();
        cache.add_handler(move |ev: &CacheEvent<NetworkAttachment>| {
            let Some(agent) = me.upgrade() else { return };
            match ev {
                CacheEvent::Add(att) => {
                    let nsn = Nsn::of(att.as_ref());
                    if agent.update_s1(&nsn, vni, Some(generation), true) {
                        agent.queue.add(nsn);
                    }
                }
                CacheEvent::Update { old, new } => {
                    // Only the address and host matter for remote
                    // interfaces.
                    if old.status.ipv4 != new.status.ipv4
                        || old.status.host_ip != new.status.host_ip
                    {
                        agent.queue.add(Nsn::of(new.as_ref()));
                    }
                }
                CacheEvent::Delete(att) => {
                    let nsn = Nsn::of(att.as_ref());
                    if agent.update_s1(&nsn, vni, Some(generation), false) {
                        agent.queue.add(nsn);
                    }
                }
            }
        });
    }

    /// Maintains the stage-1 routing table from a notification. Handlers
    /// bound to a remote informer pass their generation; if the VN
    /// lifecycle they were created for is over (or replaced by a newer one
    /// with the same VNI), the notification must not touch current state.
    fn update_s1(&self, nsn: &Nsn, vni: u32, generation: Option<u64>, exists: bool) -> bool {
        let mut s1 = self.s1.write().unwrap();
        if let Some(generation) = generation {
            match s1.vni_to_state.get(&vni) {
                Some(vn) if vn.generation == generation => {}
                _ => return false,
            }
        }
        if exists {
            s1.att_to_vnis.entry(nsn.clone()).or_default().insert(vni);
            if generation.is_some() {
                if let Some(vn) = s1.vni_to_state.get_mut(&vni) {
                    vn.remote_atts.insert(nsn.name.clone());
                }
            }
        } else {
            if let Some(vnis) = s1.att_to_vnis.get_mut(nsn) {
                vnis.remove(&vni);
                if vnis.is_empty() {
                    s1.att_to_vnis.remove(nsn);
                }
            }
            if generation.is_some() {
                if let Some(vn) = s1.vni_to_state.get_mut(&vni) {
                    vn.remote_atts.remove(&nsn.name);
                }
            }
        }
        true
    }

    /// Drops the stage-1 entry of a VN that became irrelevant and queues
    /// its remote attachments so workers tear their interfaces down.
    fn clear_stage1(&self, vni: u32, namespace: &str) {
        let mut s1 = self.s1.write().unwrap();
        let Some(vn) = s1.vni_to_state.remove(&vni) else {
            return;
        };
        for name in &vn.remote_atts {
            let remote = Nsn::new(namespace, name.clone());
            if let Some(vnis) = s1.att_to_vnis.get_mut(&remote) {
                vnis.remove(&vni);
                if vnis.is_empty() {
                    s1.att_to_vnis.remove(&remote);
                }
            }
            self.queue.add(remote);
        }
        self.metrics
            .vn_relevance_aggregate_delay
            .sub(vn.relevance_delay_secs);
    }

    /// Corrects a VN's recorded relevance data when a local attachment
    /// reveals an earlier relevance time. During the initial sync the
    /// earlier time simply wins; afterwards the recorded data stays (it
    /// has been used for metrics already) and the delay is accounted.
    fn touch_stage1(
        &self,
        nsn: &Nsn,
        vni: u32,
        trigger: &ClientWrite,
        last_controller_start: Option<DateTime<Utc>>,
        pick_early_time: bool,
    ) {
        let mut s1 = self.s1.write().unwrap();
        let Some(vn) = s1.vni_to_state.get_mut(&vni) else {
            return;
        };
        if trigger.time > vn.relevance_time {
            return;
        }
        if pick_early_time {
            vn.relevance_trigger = trigger.name.clone();
            vn.relevance_time = trigger.time;
            vn.relevance_last_controller_start = last_controller_start;
            return;
        }
        let (Some(recorded), Some(real)) = (vn.relevance_time, trigger.time) else {
            return;
        };
        let dt = secs_between(recorded, real);
        if dt - vn.relevance_delay_secs > RELEVANCE_DELAY_GRACE_SECS {
            warn!(
                vni = %format!("{vni:06x}"),
                attachment = %nsn,
                recorded_trigger = %vn.relevance_trigger,
                real_trigger = %trigger.name,
                delay_secs = dt,
                "recorded VN relevance time is later than the real one"
            );
            self.metrics
                .vn_relevance_aggregate_delay
                .add(dt - vn.relevance_delay_secs);
            vn.relevance_delay_secs = dt;
        }
    }

    /// Creates, keeps, or deletes the interface for the attachment so it
    /// matches the attachment's current state.
    async fn sync_network_interface(
        &self,
        nsn: &Nsn,
        att: Option<&NetworkAttachment>,
        relevance: &VnRelevance,
    ) -> Result<(Option<NetworkInterface>, Vec<String>), ReconcileError> {
        let old = self.interfaces.read().unwrap().get(nsn).cloned();
        let old_usable = old
            .as_ref()
            .is_some_and(|ifc| ifc.can_be_owned_by(att, &self.node));

        if let Some(old_ifc) = &old {
            if !old_usable {
                self.delete_interface(nsn, old_ifc).await?;
                self.interfaces.write().unwrap().remove(nsn);
                debug!(attachment = %nsn, interface = old_ifc.name(), "deleted interface");
            }
        }

        let Some(att) = att else {
            return Ok((None, Vec::new()));
        };

        if old_usable {
            let old_ifc = old.expect("usable implies present");
            let status_errs = match &old_ifc {
                NetworkInterface::Local(local) => self.maybe_launch_post_create(nsn, att, local),
                NetworkInterface::Remote(_) => Vec::new(),
            };
            debug!(attachment = %nsn, interface = old_ifc.name(), "keeping existing interface");
            return Ok((Some(old_ifc), status_errs));
        }

        let (ifc, status_errs) = if att.spec.node == self.node {
            self.create_local_interface(nsn, att).await?
        } else {
            (self.create_remote_interface(nsn, att, relevance).await?, Vec::new())
        };
        self.interfaces
            .write()
            .unwrap()
            .insert(nsn.clone(), ifc.clone());
        debug!(attachment = %nsn, interface = ifc.name(), "created interface");
        Ok((Some(ifc), status_errs))
    }

    async fn delete_interface(
        &self,
        nsn: &Nsn,
        ifc: &NetworkInterface,
    ) -> Result<(), ReconcileError> {
        self.delete_fabric_interface(ifc.name())
            .await
            .map_err(|err| {
                ReconcileError::Transient(format!(
                    "failed to delete interface {}: {err}",
                    ifc.name()
                ))
            })?;
        match ifc {
            NetworkInterface::Local(local) => {
                self.metrics.local_attachments.dec();
                self.maybe_launch_post_delete(nsn, local);
            }
            NetworkInterface::Remote(_) => self.metrics.remote_attachments.dec(),
        }
        Ok(())
    }

    async fn create_local_interface(
        &self,
        nsn: &Nsn,
        att: &NetworkAttachment,
    ) -> Result<(NetworkInterface, Vec<String>), ReconcileError> {
        let guest_ip: Ipv4Addr = att.status.ipv4.parse().map_err(|_| {
            ReconcileError::Transient(format!(
                "attachment {nsn} has unparseable status.ipv4 {:?}",
                att.status.ipv4
            ))
        })?;
        let vni = att.status.address_vni;
        let guest_mac = derive_mac(vni, guest_ip);

        let before = Instant::now();
        let created = self
            .fabric
            .create_local(vni, guest_ip, &guest_mac, self.host_ip)
            .await;
        self.metrics
            .fabric_latency
            .with_label_values(&[OP_CREATE_LOCAL, fmt_err_bool(created.is_err())])
            .observe(before.elapsed().as_secs_f64());
        let name = created.map_err(|err| {
            ReconcileError::Transient(format!("failed to create local interface for {nsn}: {err}"))
        })?;

        if att.status.host_ip.is_empty() {
            // First implementation of this attachment.
            let now = Utc::now();
            let lcw = &att.extended.last_client_write;
            if let Some(t0) = lcw.time {
                self.metrics
                    .last_client_write_to_local_ifc
                    .with_label_values(&[&lcw.name])
                    .observe(secs_between(now, t0));
            }
            if let (Some(started), Some(t0)) =
                (att.extended.last_controller_start.controller_time, lcw.time)
            {
                let delay = secs_between(started, t0);
                if delay > 0.0 {
                    self.metrics
                        .local_ifc_delay_due_to_downtime
                        .with_label_values(&[&lcw.name])
                        .observe(delay);
                }
            }
        }

        let ifc = LocalInterface {
            name,
            vni,
            guest_ip,
            guest_mac,
            post_delete_exec: att.spec.post_delete_exec.clone(),
            post_create_launched: Arc::default(),
            post_create_report: Arc::default(),
        };
        self.metrics.local_attachments.inc();
        let status_errs = self.maybe_launch_post_create(nsn, att, &ifc);
        Ok((NetworkInterface::Local(ifc), status_errs))
    }

    async fn create_remote_interface(
        &self,
        nsn: &Nsn,
        att: &NetworkAttachment,
        relevance: &VnRelevance,
    ) -> Result<NetworkInterface, ReconcileError> {
        let guest_ip: Ipv4Addr = att.status.ipv4.parse().map_err(|_| {
            ReconcileError::Transient(format!(
                "attachment {nsn} has unparseable status.ipv4 {:?}",
                att.status.ipv4
            ))
        })?;
        let host_ip: Ipv4Addr = att.status.host_ip.parse().map_err(|_| {
            ReconcileError::Transient(format!(
                "attachment {nsn} has unparseable status.hostIP {:?}",
                att.status.host_ip
            ))
        })?;
        let vni = att.status.address_vni;

        let before = Instant::now();
        let created = self.fabric.create_remote(vni, guest_ip, host_ip).await;
        self.metrics
            .fabric_latency
            .with_label_values(&[OP_CREATE_REMOTE, fmt_err_bool(created.is_err())])
            .observe(before.elapsed().as_secs_f64());
        let name = created.map_err(|err| {
            ReconcileError::Transient(format!(
                "failed to create remote interface for {nsn}: {err}"
            ))
        })?;

        let now = Utc::now();
        // The relevant client write is the later of the attachment's own
        // and the event that made the VN relevant here.
        let (trigger_name, trigger_time) = if relevance.time > att.extended.last_client_write.time {
            (relevance.trigger.clone(), relevance.time)
        } else {
            (
                att.extended.last_client_write.name.clone(),
                att.extended.last_client_write.time,
            )
        };
        if let Some(t0) = trigger_time {
            self.metrics
                .last_client_write_to_remote_ifc
                .with_label_values(&[&trigger_name])
                .observe(secs_between(now, t0));
        }
        if let Some(impl_time) = att.extended.writes.server_write_time(NA_SECTION_IMPL) {
            self.metrics
                .local_impl_to_remote_ifc
                .with_label_values(&[&trigger_name])
                .observe(secs_between(now, impl_time));
        }
        let latest_start = att
            .extended
            .last_controller_start
            .controller_time
            .max(relevance.last_controller_start);
        if let (Some(started), Some(t0)) = (latest_start, trigger_time) {
            let delay = secs_between(started, t0);
            if delay > 0.0 {
                self.metrics
                    .remote_ifc_delay_due_to_remote_ca_downtime
                    .with_label_values(&[&trigger_name])
                    .observe(delay);
            }
        }

        self.metrics.remote_attachments.inc();
        Ok(NetworkInterface::Remote(RemoteInterface {
            name,
            vni,
            guest_ip,
            host_ip,
        }))
    }

    fn local_attachment_up_to_date(
        &self,
        att: &NetworkAttachment,
        ifc: &LocalInterface,
        status_errs: &[String],
        report: Option<&ExecReport>,
    ) -> bool {
        ifc.guest_mac == att.status.mac_address
            && ifc.name == att.status.ifc_name
            && self.host_ip.to_string() == att.status.host_ip
            && status_errs == att.status.errors.host
            && exec_reports_equiv(report, att.status.post_create_exec_report.as_ref())
    }

    async fn update_local_attachment_status(
        &self,
        nsn: &Nsn,
        att: &NetworkAttachment,
        ifc: &LocalInterface,
        status_errs: Vec<String>,
        report: Option<ExecReport>,
    ) -> Result<(), ReconcileError> {
        if self.local_atts.get(&nsn.namespace, &nsn.name).is_none() {
            debug!(attachment = %nsn, "not updating status of deleted attachment");
            return Ok(());
        }
        let mut updated = att.clone();
        updated.status.mac_address = ifc.guest_mac.clone();
        updated.status.ifc_name = ifc.name.clone();
        updated.status.host_ip = self.host_ip.to_string();
        updated.status.errors.host = status_errs.clone();
        updated.status.post_create_exec_report = report;
        if att.status.ifc_name != ifc.name
            && Some(self.start_time) > att.extended.last_controller_start.controller_time
        {
            updated.extended.last_controller_start = ControllerStart {
                controller: LOCAL_AGENT_START.to_owned(),
                controller_time: Some(self.start_time),
            };
        }

        let before = Instant::now();
        let result = self.api.update_attachment_status(&updated).await;
        self.metrics
            .attachment_status
            .with_label_values(&[
                fmt_err_bool(!status_errs.is_empty()),
                StoreError::summarize(result.as_ref().err()),
            ])
            .observe(before.elapsed().as_secs_f64());

        match result {
            Ok(written) => {
                debug!(
                    attachment = %nsn,
                    interface = %ifc.name,
                    mac = %ifc.guest_mac,
                    "updated local attachment status"
                );
                if att.status.host_ip.is_empty() {
                    if let (Some(stamp), Some(t0)) = (
                        written.extended.writes.server_write_time(NA_SECTION_IMPL),
                        att.extended.last_client_write.time,
                    ) {
                        self.metrics
                            .last_client_write_to_status
                            .with_label_values(&[&att.extended.last_client_write.name])
                            .observe(secs_between(stamp, t0));
                    }
                }
                Ok(())
            }
            Err(StoreError::NotFound) => {
                debug!(attachment = %nsn, "attachment deleted before status update");
                Ok(())
            }
            Err(err) => Err(ReconcileError::Transient(format!(
                "status update for {nsn} failed: {err}"
            ))),
        }
    }

    /// Startup pass: link interfaces that survived an agent restart to
    /// their attachments and delete the rest as orphans.
    pub async fn sync_pre_existing_interfaces(&self) -> anyhow::Result<()> {
        // Picking an owner for a remote interface needs the remote
        // informer of its VNI, so bring them all up first.
        for att in self.local_atts.list() {
            let cache = {
                let mut s2 = self.s2.lock().unwrap();
                if let Err(err) = self.add_local_att_to_s2(&mut s2, &att, true) {
                    // Two namespaces currently claim this VNI. Keep the one
                    // already recorded; the pending delete notifications
                    // will settle which namespace survives.
                    warn!(attachment = %Nsn::of(att.as_ref()), error = %err, "skipping attachment during initial sync");
                    continue;
                }
                s2.vni_to_state
                    .get(&att.status.address_vni)
                    .map(|vn| Arc::clone(&vn.cache))
            };
            if let Some(cache) = cache {
                cache.wait_synced().await;
            }
        }

        let before = Instant::now();
        let listed = self.fabric.list().await;
        self.metrics
            .fabric_latency
            .with_label_values(&[OP_LIST, fmt_err_bool(listed.is_err())])
            .observe(before.elapsed().as_secs_f64());
        let interfaces =
            listed.map_err(|err| anyhow::anyhow!("failed to list pre-existing interfaces: {err}"))?;

        for descriptor in interfaces {
            self.sync_pre_existing_interface(descriptor).await;
        }
        Ok(())
    }

    async fn sync_pre_existing_interface(&self, descriptor: InterfaceDescriptor) {
        if let Some(owner) = self.find_interface_owner(&descriptor) {
            let owner_nsn = Nsn::of(owner.as_ref());
            let owner_has_interface = self.interfaces.read().unwrap().contains_key(&owner_nsn);
            // On collision the first linked interface wins; the reconcile
            // of the attachment corrects any mis-linkage afterwards.
            if !owner_has_interface {
                let ifc = self.adopt_interface(&descriptor, &owner);
                self.interfaces
                    .write()
                    .unwrap()
                    .insert(owner_nsn.clone(), ifc);
                if descriptor.local {
                    self.metrics.local_attachments.inc();
                } else {
                    self.metrics.remote_attachments.inc();
                }
                debug!(
                    interface = %descriptor.name,
                    attachment = %owner_nsn,
                    "linked pre-existing interface"
                );
                return;
            }
        }
        self.delete_orphan_interface(&descriptor).await;
    }

    fn find_interface_owner(
        &self,
        descriptor: &InterfaceDescriptor,
    ) -> Option<Arc<NetworkAttachment>> {
        if descriptor.local {
            let key = format!("{}/{}", descriptor.vni, descriptor.guest_ip);
            self.local_atts
                .by_index(IFC_OWNER_DATA_INDEX, &key)
                .ok()?
                .into_iter()
                .next()
        } else {
            let cache = {
                let s2 = self.s2.lock().unwrap();
                s2.vni_to_state
                    .get(&descriptor.vni)
                    .map(|vn| Arc::clone(&vn.cache))
            }?;
            let key = format!("{}/{}", descriptor.host_ip, descriptor.guest_ip);
            cache
                .by_index(IFC_OWNER_DATA_INDEX, &key)
                .ok()?
                .into_iter()
                .next()
        }
    }

    fn adopt_interface(
        &self,
        descriptor: &InterfaceDescriptor,
        owner: &NetworkAttachment,
    ) -> NetworkInterface {
        if descriptor.local {
            NetworkInterface::Local(LocalInterface {
                name: descriptor.name.clone(),
                vni: descriptor.vni,
                guest_ip: descriptor.guest_ip,
                guest_mac: descriptor.guest_mac.clone(),
                post_delete_exec: owner.spec.post_delete_exec.clone(),
                // The post-create command ran, if ever, in the life that
                // created this interface; recycling does not re-run it.
                post_create_launched: Arc::new(std::sync::atomic::AtomicBool::new(true)),
                post_create_report: Arc::new(Mutex::new(
                    owner.status.post_create_exec_report.clone(),
                )),
            })
        } else {
            NetworkInterface::Remote(RemoteInterface {
                name: descriptor.name.clone(),
                vni: descriptor.vni,
                guest_ip: descriptor.guest_ip,
                host_ip: descriptor.host_ip,
            })
        }
    }

    async fn delete_orphan_interface(&self, descriptor: &InterfaceDescriptor) {
        let mut attempt = 1u64;
        loop {
            match self.delete_fabric_interface(&descriptor.name).await {
                Ok(()) => {
                    debug!(interface = %descriptor.name, attempt, "deleted pre-existing orphan interface");
                    return;
                }
                Err(err) => {
                    error!(
                        interface = %descriptor.name,
                        attempt,
                        error = %err,
                        "failed to delete pre-existing orphan interface"
                    );
                    tokio::time::sleep(FABRIC_RETRY_PERIOD).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn delete_fabric_interface(&self, name: &str) -> Result<(), FabricError> {
        let before = Instant::now();
        let result = match self.fabric.delete(name).await {
            // Already gone is as deleted as it gets.
            Err(FabricError::NoSuchInterface(_)) => Ok(()),
            other => other,
        };
        self.metrics
            .fabric_latency
            .with_label_values(&[OP_DELETE, fmt_err_bool(result.is_err())])
            .observe(before.elapsed().as_secs_f64());
        result
    }
}

/// `InformerFactory` backed by watches on the object store.
pub struct KubeInformerFactory {
    client: kube::Client,
    node: String,
    stop: watch::Receiver<bool>,
}

impl KubeInformerFactory {
    pub fn new(client: kube::Client, node: String, stop: watch::Receiver<bool>) -> Self {
        Self { client, node, stop }
    }

    fn spawn(
        &self,
        api: Api<NetworkAttachment>,
        config: watcher::Config,
        cache: Arc<CacheCore<NetworkAttachment>>,
    ) -> InformerHandle {
        let (stop_tx, mut local_stop) = watch::channel(false);
        let mut global_stop = self.stop.clone();
        let stop = async move {
            tokio::select! {
                _ = global_stop.changed() => {}
                _ = local_stop.changed() => {}
            }
        };
        spawn_watcher(api, config, cache, stop);
        InformerHandle::new(stop_tx)
    }
}

impl InformerFactory for KubeInformerFactory {
    fn start_local_informer(&self, cache: Arc<CacheCore<NetworkAttachment>>) -> InformerHandle {
        let api: Api<NetworkAttachment> = Api::all(self.client.clone());
        let config = watcher::Config::default()
            .fields(&format!("spec.node={},status.ipv4!=", self.node));
        self.spawn(api, config, cache)
    }

    fn start_remote_informer(
        &self,
        namespace: &str,
        vni: u32,
        cache: Arc<CacheCore<NetworkAttachment>>,
    ) -> InformerHandle {
        let api: Api<NetworkAttachment> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().fields(&format!(
            "spec.node!={},status.addressVNI={vni},status.ipv4!=,status.hostIP!=",
            self.node
        ));
        self.spawn(api, config, cache)
    }
}
