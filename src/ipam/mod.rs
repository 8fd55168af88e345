//! The IPAM controller.
//!
//! Assigns an IPv4 address to each NetworkAttachment: picks a free address
//! in the attachment's subnet, records the assignment by creating an IPLock
//! owned by the attachment, and writes the chosen address into the
//! attachment's status. Contention between replicas is resolved by the lock
//! create: whoever loses re-picks. Because a status write takes a while to
//! come back through the watch stream, the controller keeps per-attachment
//! anticipation state so an already-performed write is not repeated.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{
    attachment_owner_ref, controller_owner, owning_attachment_keys, ClientWrite, ControllerStart,
    IPLock, IPLockSpec, NetworkAttachment, Subnet, ATTACHMENT_KIND, IPAM_CONTROLLER_START,
    IPLOCK_SECTION_SPEC, NA_CLIENT_WRITE, NA_SECTION_ADDR, NA_SECTION_SPEC,
};
use crate::cache::{CacheCore, CacheEvent, WorkQueue};
use crate::netutil::{cidr_bounds, secs_between, u32_to_ipv4, Nsn};
use crate::observability::metrics::{fmt_err_bool, IpamMetrics, OP_CREATE, OP_DELETE};
use crate::store::{NetApi, StoreError};

pub mod addrset;
pub mod lock;

pub use addrset::VniAddressCache;
pub use lock::{best, make_lock_name, parse_lock_name, ParsedLock};

pub const OWNING_ATTACHMENT_INDEX: &str = "owningAttachment";
pub const ATTACHMENT_SUBNET_INDEX: &str = "subnet";

/// Stable message recorded in `status.errors.ipam` when the subnet is
/// saturated.
pub const FULL_SUBNET_STATUS_MSG: &str = "Referenced subnet has run out of IPs";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Transient(String),
}

/// Local memory for one attachment. Only the worker currently holding the
/// attachment's key mutates an entry; the map mutex covers insert and
/// delete only.
///
/// When the attachment's ResourceVersion equals either recorded version,
/// the subnet UID still matches, and `anticipated_ipv4` is set, then that
/// address has already been written into the attachment's status and a
/// supporting IPLock exists, even if neither has come back through the
/// watch stream yet.
#[derive(Clone, Debug, Default)]
struct AttachmentData {
    anticipated_ipv4: Option<Ipv4Addr>,
    anticipating_resource_version: String,
    anticipated_resource_version: String,
    anticipation_subnet_uid: String,
    address_contention: bool,
}

/// What `analyze_and_release` learned about an attachment and its locks.
#[derive(Default)]
struct Analysis {
    /// False when processing should stop here (waiting for the subnet
    /// validator, or an indexer failure).
    proceed: bool,
    subnet_name: String,
    subnet_uid: String,
    subnet_last_client_write: ClientWrite,
    subnet_last_controller_start: ControllerStart,
    vni: u32,
    base: u32,
    last: u32,
    /// The usable lock already reflected in the attachment's status.
    lock_in_status: Option<ParsedLock>,
    /// The usable lock chosen to go into the status next.
    lock_for_status: Option<ParsedLock>,
    status_errs: Vec<String>,
}

enum PickOutcome {
    Locked(ParsedLock, Ipv4Addr),
    /// The range is saturated; carries the detailed message.
    FullSubnet(String),
    /// The lock create failed permanently (already logged). The picked
    /// address still goes into status, with no lock UID and no requeue.
    Unlocked(ParsedLock, Ipv4Addr),
}

pub struct IpamController {
    api: Arc<dyn NetApi>,
    subnets: Arc<CacheCore<Subnet>>,
    attachments: Arc<CacheCore<NetworkAttachment>>,
    locks: Arc<CacheCore<IPLock>>,
    queue: Arc<WorkQueue<Nsn>>,
    workers: usize,
    start_time: DateTime<Utc>,
    atts: Mutex<HashMap<Nsn, AttachmentData>>,
    addr_cache: VniAddressCache,
    metrics: IpamMetrics,
}

impl IpamController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn NetApi>,
        subnets: Arc<CacheCore<Subnet>>,
        attachments: Arc<CacheCore<NetworkAttachment>>,
        locks: Arc<CacheCore<IPLock>>,
        queue: Arc<WorkQueue<Nsn>>,
        workers: usize,
        metrics: IpamMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            subnets,
            attachments,
            locks,
            queue,
            workers,
            start_time: Utc::now(),
            atts: Mutex::new(HashMap::new()),
            addr_cache: VniAddressCache::new(),
            metrics,
        })
    }

    /// Registers the indexes and notification handlers on the caches. Must
    /// run before the cache drivers start delivering.
    pub fn register(self: &Arc<Self>) {
        self.attachments
            .add_index(ATTACHMENT_SUBNET_INDEX, |att: &NetworkAttachment| {
                vec![format!(
                    "{}/{}",
                    att.metadata.namespace.as_deref().unwrap_or_default(),
                    att.spec.subnet
                )]
            });
        self.locks
            .add_index(OWNING_ATTACHMENT_INDEX, owning_attachment_keys);

        let ctlr = Arc::downgrade(self);
        self.subnets.add_handler(move |ev: &CacheEvent<Subnet>| {
            if let Some(ctlr) = ctlr.upgrade() {
                ctlr.on_subnet_event(ev);
            }
        });
        let queue = Arc::clone(&self.queue);
        self.attachments
            .add_handler(move |ev: &CacheEvent<NetworkAttachment>| {
                let att = match ev {
                    CacheEvent::Add(att) | CacheEvent::Delete(att) => att,
                    CacheEvent::Update { new, .. } => new,
                };
                queue.add(Nsn::of(att.as_ref()));
            });
        let ctlr = Arc::downgrade(self);
        self.locks.add_handler(move |ev: &CacheEvent<IPLock>| {
            if let Some(ctlr) = ctlr.upgrade() {
                ctlr.on_lock_event(ev);
            }
        });
    }

    /// Runs workers until `stop` signals shutdown. The caches must be
    /// driven by watchers started by the caller.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!("starting IPAM controller");
        self.subnets.wait_synced().await;
        self.attachments.wait_synced().await;
        self.locks.wait_synced().await;
        debug!("informer caches synced");

        for _ in 0..self.workers {
            let ctlr = Arc::clone(&self);
            tokio::spawn(async move { ctlr.worker().await });
        }
        debug!(workers = self.workers, "launched workers");

        let _ = stop.changed().await;
        self.queue.shut_down();
        info!("shutting down IPAM controller");
    }

    async fn worker(self: Arc<Self>) {
        while let Some(nsn) = self.queue.get().await {
            let qlen = self.queue.len();
            let result = self.process_attachment(&nsn).await;
            let requeues = self.queue.num_requeues(&nsn);
            match result {
                Ok(()) => {
                    debug!(attachment = %nsn, requeues, qlen, "finished attachment");
                    self.queue.forget(&nsn);
                }
                Err(err) => {
                    warn!(attachment = %nsn, requeues, qlen, error = %err, "failed processing attachment, requeuing");
                    self.queue.add_rate_limited(nsn.clone());
                }
            }
            self.queue.done(&nsn);
        }
    }

    fn on_subnet_event(&self, ev: &CacheEvent<Subnet>) {
        let (subnet, deleted) = match ev {
            CacheEvent::Add(s) => (s, false),
            CacheEvent::Update { new, .. } => (new, false),
            CacheEvent::Delete(s) => (s, true),
        };
        if !deleted && !subnet.status.validated && subnet.status.errors.is_empty() {
            // Not examined by the subnet validator yet; the validation
            // outcome will arrive as another notification.
            debug!(subnet = %Nsn::of(subnet.as_ref()), "ignoring notification of unexamined subnet");
            return;
        }
        let subnet_key = Nsn::of(subnet.as_ref()).to_string();
        match self.attachments.by_index(ATTACHMENT_SUBNET_INDEX, &subnet_key) {
            Ok(atts) => {
                debug!(subnet = %subnet_key, attachments = atts.len(), "queuing attachments for subnet");
                for att in atts {
                    self.queue.add(Nsn::of(att.as_ref()));
                }
            }
            Err(err) => {
                error!(subnet = %subnet_key, error = %err, "attachment index lookup failed");
            }
        }
    }

    fn on_lock_event(&self, ev: &CacheEvent<IPLock>) {
        let (ipl, exists) = match ev {
            CacheEvent::Add(l) => (l, true),
            CacheEvent::Update { new, .. } => (new, true),
            CacheEvent::Delete(l) => (l, false),
        };
        let name = ipl.metadata.name.as_deref().unwrap_or_default();
        let (vni, addr) = match parse_lock_name(name) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(lock = name, error = %err, "cannot parse IPLock name");
                return;
            }
        };
        let changed = if exists {
            self.addr_cache.take(vni, addr)
        } else {
            self.addr_cache.release(vni, addr)
        };
        debug!(
            lock = name,
            vni,
            address = %u32_to_ipv4(addr),
            exists,
            changed,
            "address cache maintained from lock notification"
        );
        for owner_key in owning_attachment_keys(ipl) {
            if let Some(owner) = Nsn::parse(&owner_key) {
                self.queue.add(owner);
            }
        }
    }

    fn attachment_data(&self, nsn: &Nsn, add_if_missing: bool) -> Option<AttachmentData> {
        let mut atts = self.atts.lock().unwrap();
        match atts.get(nsn) {
            Some(data) => Some(data.clone()),
            None if add_if_missing => {
                atts.insert(nsn.clone(), AttachmentData::default());
                Some(AttachmentData::default())
            }
            None => None,
        }
    }

    fn put_attachment_data(&self, nsn: &Nsn, data: AttachmentData) {
        self.atts.lock().unwrap().insert(nsn.clone(), data);
    }

    fn clear_attachment_data(&self, nsn: &Nsn) {
        self.atts.lock().unwrap().remove(nsn);
    }

    /// Reconciles one attachment key. Transient failures come back as
    /// errors so the worker requeues with backoff.
    pub async fn process_attachment(&self, nsn: &Nsn) -> Result<(), ReconcileError> {
        let att = self.attachments.get(&nsn.namespace, &nsn.name);
        let mut nadat = self.attachment_data(nsn, att.is_some());
        if let (Some(data), Some(att)) = (nadat.as_mut(), att.as_ref()) {
            data.address_contention |= att.status.address_contention;
        }
        let result = self.reconcile(nsn, att.as_deref(), nadat.as_mut()).await;
        match (att.is_some(), nadat) {
            (false, Some(_)) => self.clear_attachment_data(nsn),
            (true, Some(data)) => self.put_attachment_data(nsn, data),
            _ => {}
        }
        result
    }

    async fn reconcile(
        &self,
        nsn: &Nsn,
        att: Option<&NetworkAttachment>,
        mut nadat: Option<&mut AttachmentData>,
    ) -> Result<(), ReconcileError> {
        let analysis = self
            .analyze_and_release(nsn, att, nadat.as_deref_mut())
            .await?;
        if !analysis.proceed {
            return Ok(());
        }
        let Some(att) = att else {
            return Ok(());
        };
        let Some(nadat) = nadat else {
            return Ok(());
        };
        if analysis.lock_in_status.is_some() {
            // The status already names a usable lock; nothing to write.
            return Ok(());
        }

        let last_client_write =
            effective_last_client_write(att, &analysis.subnet_last_client_write);
        let mut status_errs = analysis.status_errs.clone();
        let mut lock_for_status = analysis.lock_for_status.clone();
        let mut ip_for_status: Option<Ipv4Addr> = None;
        let mut full_subnet_detail: Option<String> = None;

        let mut needs_pick = false;
        if !status_errs.is_empty() {
            // The errors go into status below; no address work.
        } else if let Some(chosen) = &lock_for_status {
            let ip = chosen.ip();
            if nadat.anticipated_ipv4 == Some(ip) {
                self.metrics.anticipation_used.observe(1.0);
                debug!(attachment = %nsn, %ip, "anticipated address confirmed by usable lock, skipping update");
                return Ok(());
            }
            ip_for_status = Some(ip);
        } else if nadat.anticipated_ipv4.is_some() {
            self.metrics.anticipation_used.observe(2.0);
            debug!(attachment = %nsn, "status write still in flight, skipping update");
            return Ok(());
        } else {
            needs_pick = true;
        }
        // Every outcome from here on counts as no anticipation use,
        // whether the pick or the status write succeeds or not.
        self.metrics.anticipation_used.observe(0.0);

        if needs_pick {
            match self
                .pick_and_lock_address(nsn, att, &analysis, nadat.address_contention, &last_client_write)
                .await?
            {
                PickOutcome::Locked(chosen, ip) | PickOutcome::Unlocked(chosen, ip) => {
                    lock_for_status = Some(chosen);
                    ip_for_status = Some(ip);
                }
                PickOutcome::FullSubnet(detail) => {
                    nadat.address_contention = true;
                    if att
                        .status
                        .errors
                        .ipam
                        .iter()
                        .any(|m| m == FULL_SUBNET_STATUS_MSG)
                    {
                        // The status already says so; just retry later.
                        return Err(ReconcileError::Transient(detail));
                    }
                    status_errs = vec![FULL_SUBNET_STATUS_MSG.to_owned()];
                    full_subnet_detail = Some(detail);
                }
            }
        }

        let update_result = self
            .update_attachment_status(
                nsn,
                att,
                nadat,
                status_errs,
                &analysis,
                lock_for_status.as_ref(),
                ip_for_status,
                &last_client_write,
            )
            .await;
        match (full_subnet_detail, update_result) {
            (Some(detail), Ok(())) => Err(ReconcileError::Transient(detail)),
            (Some(detail), Err(err)) => Err(ReconcileError::Transient(format!("{detail}; {err}"))),
            (None, result) => result,
        }
    }

    /// Resolves the attachment's subnet, classifies the locks it owns, and
    /// releases the ones it should not keep.
    async fn analyze_and_release(
        &self,
        nsn: &Nsn,
        att: Option<&NetworkAttachment>,
        nadat: Option<&mut AttachmentData>,
    ) -> Result<Analysis, ReconcileError> {
        let mut analysis = Analysis::default();

        if let Some(att) = att {
            analysis.subnet_name = att.spec.subnet.clone();
            match self.subnets.get(&nsn.namespace, &analysis.subnet_name) {
                Some(subnet) if subnet.status.validated => {
                    analysis.vni = subnet.spec.vni;
                    analysis.subnet_uid = subnet.metadata.uid.clone().unwrap_or_default();
                    analysis.subnet_last_client_write = subnet.extended.last_client_write.clone();
                    analysis.subnet_last_controller_start =
                        subnet.extended.last_controller_start.clone();
                    match subnet.spec.ipv4.parse::<Ipv4Net>() {
                        Ok(net) => {
                            (analysis.base, analysis.last) = cidr_bounds(&net);
                        }
                        Err(err) => {
                            warn!(
                                attachment = %nsn,
                                subnet = %analysis.subnet_name,
                                cidr = %subnet.spec.ipv4,
                                error = %err,
                                "referenced subnet has malformed CIDR"
                            );
                            // A subnet update will requeue this attachment.
                            analysis.status_errs = vec![format!(
                                "Subnet {} has malformed IPv4 CIDR block ({})",
                                analysis.subnet_name, subnet.spec.ipv4
                            )];
                            analysis.proceed = true;
                            return Ok(analysis);
                        }
                    }
                }
                Some(subnet) => {
                    if subnet.status.errors.is_empty() {
                        // Validation pending; its outcome will requeue us.
                        warn!(
                            attachment = %nsn,
                            subnet = %analysis.subnet_name,
                            "referenced subnet has not been examined for validity yet"
                        );
                        return Ok(analysis);
                    }
                    warn!(
                        attachment = %nsn,
                        subnet = %analysis.subnet_name,
                        "referenced subnet has not passed validation"
                    );
                    analysis.status_errs = vec![format!(
                        "Subnet {} has not passed validation",
                        analysis.subnet_name
                    )];
                    analysis.proceed = true;
                    return Ok(analysis);
                }
                None => {
                    warn!(
                        attachment = %nsn,
                        subnet = %analysis.subnet_name,
                        "referenced subnet does not exist now"
                    );
                    analysis.status_errs =
                        vec![format!("Subnet {} does not exist", analysis.subnet_name)];
                    analysis.proceed = true;
                    return Ok(analysis);
                }
            }
        }

        let att_key = nsn.to_string();
        let owned = match self.locks.by_index(OWNING_ATTACHMENT_INDEX, &att_key) {
            Ok(owned) => owned,
            Err(err) => {
                // Never expected; a retry would not help.
                error!(attachment = %att_key, error = %err, "lock index lookup failed");
                return Ok(analysis);
            }
        };

        let mut time_slippers = 0usize;
        let mut undesired: Vec<ParsedLock> = Vec::new();
        let mut usable: Vec<ParsedLock> = Vec::new();
        for lock in &owned {
            consider_lock(lock, att, &mut analysis, &mut undesired, &mut usable, &mut time_slippers);
        }

        if let Some(att) = att {
            if !att.status.ipv4.is_empty() && analysis.lock_in_status.is_none() {
                // The lock backing the status address may simply not have
                // reached our cache yet; its name is deterministic, so ask
                // the store directly.
                if let Ok(status_ip) = att.status.ipv4.parse::<Ipv4Addr>() {
                    let mut status_used = 0.0;
                    let lock_name = make_lock_name(analysis.vni, status_ip);
                    match self.api.get_ip_lock(&nsn.namespace, &lock_name).await {
                        Ok(found) => {
                            let owner = controller_owner(&found.metadata, ATTACHMENT_KIND);
                            if owner.is_some_and(|(name, _)| name == nsn.name) {
                                status_used = 1.0;
                                consider_lock(
                                    &found,
                                    Some(att),
                                    &mut analysis,
                                    &mut undesired,
                                    &mut usable,
                                    &mut time_slippers,
                                );
                            }
                        }
                        Err(err) => {
                            info!(
                                attachment = %nsn,
                                lock = %lock_name,
                                error = %err,
                                "failed to fetch lock for IP in status"
                            );
                        }
                    }
                    self.metrics.status_used.observe(status_used);
                }
            }
        }

        if let Some(nadat) = nadat {
            let stale = match att {
                None => true,
                Some(att) => {
                    let rv = att.metadata.resource_version.as_deref().unwrap_or_default();
                    (nadat.anticipating_resource_version != rv
                        && nadat.anticipated_resource_version != rv)
                        || nadat.anticipation_subnet_uid != analysis.subnet_uid
                }
            };
            if stale {
                nadat.anticipated_ipv4 = None;
                nadat.anticipating_resource_version.clear();
                nadat.anticipated_resource_version.clear();
                nadat.anticipation_subnet_uid.clear();
            }
        }

        let mut to_release = undesired;
        match (att, &analysis.lock_in_status) {
            (None, _) => to_release.append(&mut usable),
            (Some(_), Some(in_status)) => {
                let keep = (in_status.uid.clone(), in_status.name.clone());
                to_release.extend(
                    usable
                        .into_iter()
                        .filter(|l| (l.uid.as_str(), l.name.as_str()) != (keep.0.as_str(), keep.1.as_str())),
                );
            }
            (Some(_), None) => {
                // Deterministic choice, so replicated controllers have a
                // fighting chance of agreeing: the oldest lock wins.
                if let Some(chosen) = best(&usable).cloned() {
                    let keep = (chosen.uid.clone(), chosen.name.clone());
                    analysis.lock_for_status = Some(chosen);
                    to_release.extend(
                        usable
                            .into_iter()
                            .filter(|l| (l.uid.as_str(), l.name.as_str()) != (keep.0.as_str(), keep.1.as_str())),
                    );
                }
            }
        }

        debug!(
            attachment = %att_key,
            exists = att.is_some(),
            vni = analysis.vni,
            base = %format!("{:x}", analysis.base),
            last = %format!("{:x}", analysis.last),
            lock_in_status = ?analysis.lock_in_status.as_ref().map(ToString::to_string),
            lock_for_status = ?analysis.lock_for_status.as_ref().map(ToString::to_string),
            releasing = to_release.len(),
            time_slippers,
            "analyzed attachment locks"
        );

        for lock in &to_release {
            self.delete_lock_object(lock).await?;
        }

        analysis.proceed = true;
        Ok(analysis)
    }

    async fn delete_lock_object(&self, lock: &ParsedLock) -> Result<(), ReconcileError> {
        let before = Instant::now();
        let result = self
            .api
            .delete_ip_lock(&lock.namespace, &lock.name, &lock.uid)
            .await;
        let failed = matches!(&result, Err(err) if !err.is_not_found());
        self.metrics
            .lock_op
            .with_label_values(&[OP_DELETE, fmt_err_bool(failed)])
            .observe(before.elapsed().as_secs_f64());
        match result {
            Ok(()) => {
                debug!(lock = %lock, "deleted IPLock");
                Ok(())
            }
            Err(StoreError::NotFound) => {
                debug!(lock = %lock, "undesired IPLock already gone");
                Ok(())
            }
            Err(err) => Err(ReconcileError::Transient(format!(
                "failed to delete IPLock {}/{}: {err}",
                lock.namespace, lock.name
            ))),
        }
    }

    async fn pick_and_lock_address(
        &self,
        nsn: &Nsn,
        att: &NetworkAttachment,
        analysis: &Analysis,
        prev_contention: bool,
        last_client_write: &ClientWrite,
    ) -> Result<PickOutcome, ReconcileError> {
        let (mut min, mut max) = (analysis.base, analysis.last);
        if max - min >= 4 {
            // Leave the network and broadcast addresses (and the gateway
            // slot) out of play.
            min = analysis.base + 2;
            max = analysis.last - 1;
        }
        let Some(addr) = self.addr_cache.pick(analysis.vni, min, max) else {
            self.metrics.address_contention.observe(1.0);
            return Ok(PickOutcome::FullSubnet(format!(
                "no IP address available in subnet {}/{} ({:06x}/{:x}-{:x})",
                nsn.namespace, analysis.subnet_name, analysis.vni, analysis.base, analysis.last
            )));
        };
        self.metrics.address_contention.observe(0.0);
        let ip = u32_to_ipv4(addr);
        debug!(
            attachment = %nsn,
            address = %ip,
            vni = analysis.vni,
            subnet = %analysis.subnet_name,
            prev_contention,
            "picked address"
        );

        let lock_name = make_lock_name(analysis.vni, ip);
        let new_lock = IPLock {
            metadata: ObjectMeta {
                namespace: Some(nsn.namespace.clone()),
                name: Some(lock_name.clone()),
                owner_references: Some(vec![attachment_owner_ref(att)]),
                ..Default::default()
            },
            extended: Default::default(),
            spec: IPLockSpec {
                subnet_name: analysis.subnet_name.clone(),
            },
        };
        let att_uid = att.metadata.uid.as_deref().unwrap_or_default();

        loop {
            let before = Instant::now();
            let created = self.api.create_ip_lock(&nsn.namespace, &new_lock).await;
            self.metrics
                .lock_op
                .with_label_values(&[OP_CREATE, fmt_err_bool(created.is_err())])
                .observe(before.elapsed().as_secs_f64());
            match created {
                Ok(created) => {
                    self.api.record_address_assigned(att, ip).await;
                    debug!(
                        attachment = %nsn,
                        address = %ip,
                        lock = %lock_name,
                        lock_uid = created.metadata.uid.as_deref().unwrap_or_default(),
                        "locked address"
                    );
                    if att.status.ipv4.is_empty() {
                        if let (Some(stamp), Some(t0)) = (
                            created.extended.writes.server_write_time(IPLOCK_SECTION_SPEC),
                            last_client_write.time,
                        ) {
                            self.metrics
                                .last_client_write_to_lock
                                .with_label_values(&[
                                    &last_client_write.name,
                                    &prev_contention.to_string(),
                                ])
                                .observe(secs_between(stamp, t0));
                        }
                    }
                    let parsed = ParsedLock::from_lock(&created)
                        .map_err(|err| ReconcileError::Transient(err.to_string()))?;
                    return Ok(PickOutcome::Locked(parsed, ip));
                }
                Err(StoreError::AlreadyExists) => {
                    // Maybe it is ours.
                    match self.api.get_ip_lock(&nsn.namespace, &lock_name).await {
                        Ok(existing) => {
                            if ParsedLock::owned_by(&existing, &nsn.name, att_uid) {
                                debug!(
                                    attachment = %nsn,
                                    lock = %lock_name,
                                    "recovered existing lock on picked address"
                                );
                                let parsed = ParsedLock::from_lock(&existing)
                                    .map_err(|err| ReconcileError::Transient(err.to_string()))?;
                                return Ok(PickOutcome::Locked(parsed, ip));
                            }
                            debug!(
                                attachment = %nsn,
                                lock = %lock_name,
                                "collision: another attachment holds the lock"
                            );
                            // The winner holds the address, so the cache
                            // bit stays set; the retry picks afresh.
                            return Err(ReconcileError::Transient(format!(
                                "cache incoherence at {lock_name}"
                            )));
                        }
                        Err(StoreError::NotFound) => {
                            warn!(lock = %lock_name, "IPLock disappeared before our eyes");
                            continue;
                        }
                        Err(err) => {
                            return Err(ReconcileError::Transient(format!(
                                "failed to fetch allegedly existing IPLock {lock_name} for {nsn}: {err}"
                            )));
                        }
                    }
                }
                Err(StoreError::Invalid(msg)) => {
                    let released = self.addr_cache.release(analysis.vni, addr);
                    error!(
                        attachment = %nsn,
                        lock = %lock_name,
                        released,
                        message = %msg,
                        "permanent error creating IPLock; recording the address without a lock, no requeue"
                    );
                    // The picked address still goes into status, with no
                    // lock UID backing it.
                    return Ok(PickOutcome::Unlocked(
                        ParsedLock {
                            namespace: nsn.namespace.clone(),
                            name: lock_name.clone(),
                            vni: analysis.vni,
                            addr,
                            uid: String::new(),
                            creation: None,
                        },
                        ip,
                    ));
                }
                Err(err) => {
                    let released = self.addr_cache.release(analysis.vni, addr);
                    warn!(
                        attachment = %nsn,
                        lock = %lock_name,
                        released,
                        error = %err,
                        "transient error creating IPLock"
                    );
                    return Err(ReconcileError::Transient(format!(
                        "create of IPLock {lock_name} for {nsn} failed: {err}"
                    )));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_attachment_status(
        &self,
        nsn: &Nsn,
        att: &NetworkAttachment,
        nadat: &mut AttachmentData,
        status_errs: Vec<String>,
        analysis: &Analysis,
        lock_for_status: Option<&ParsedLock>,
        ip_for_status: Option<Ipv4Addr>,
        last_client_write: &ClientWrite,
    ) -> Result<(), ReconcileError> {
        if self.attachments.get(&nsn.namespace, &nsn.name).is_none() {
            debug!(attachment = %nsn, "not updating status of deleted attachment");
            return Ok(());
        }
        let mut updated = att.clone();
        updated.status.errors.ipam = status_errs.clone();
        updated.status.address_contention = nadat.address_contention;
        updated.status.lock_uid = lock_for_status.map(|l| l.uid.clone()).unwrap_or_default();
        updated.status.address_vni = lock_for_status.map(|l| l.vni).unwrap_or_default();
        updated.status.ipv4 = ip_for_status.map(|ip| ip.to_string()).unwrap_or_default();
        updated.extended.last_client_write = last_client_write.clone();
        set_last_controller_start(
            &mut updated,
            self.start_time,
            &analysis.subnet_last_controller_start,
        );

        let before = Instant::now();
        let result = self.api.update_attachment_status(&updated).await;
        self.metrics
            .attachment_update
            .with_label_values(&[
                fmt_err_bool(!status_errs.is_empty()),
                StoreError::summarize(result.as_ref().err()),
            ])
            .observe(before.elapsed().as_secs_f64());

        match result {
            Ok(written) => {
                if ip_for_status.is_some() {
                    if let (Some(stamp), Some(t0)) = (
                        written.extended.writes.server_write_time(NA_SECTION_ADDR),
                        last_client_write.time,
                    ) {
                        self.metrics
                            .last_client_write_to_address
                            .with_label_values(&[
                                &last_client_write.name,
                                &nadat.address_contention.to_string(),
                            ])
                            .observe(secs_between(stamp, t0));
                    }
                    if let (Some(started), Some(t0)) = (
                        written.extended.last_controller_start.controller_time,
                        last_client_write.time,
                    ) {
                        let delay = secs_between(started, t0);
                        if delay > 0.0 {
                            self.metrics
                                .address_delay_due_to_downtime
                                .with_label_values(&[
                                    &last_client_write.name,
                                    &written.extended.last_controller_start.controller,
                                ])
                                .observe(delay);
                        }
                    }
                }
                if status_errs.is_empty() {
                    nadat.anticipating_resource_version =
                        att.metadata.resource_version.clone().unwrap_or_default();
                    nadat.anticipated_resource_version =
                        written.metadata.resource_version.clone().unwrap_or_default();
                    nadat.anticipation_subnet_uid = analysis.subnet_uid.clone();
                    nadat.anticipated_ipv4 = ip_for_status;
                    debug!(
                        attachment = %nsn,
                        address = %updated.status.ipv4,
                        old_rv = att.metadata.resource_version.as_deref().unwrap_or_default(),
                        new_rv = written.metadata.resource_version.as_deref().unwrap_or_default(),
                        "recorded locked address in status"
                    );
                } else {
                    debug!(attachment = %nsn, errors = ?status_errs, "recorded errors in status");
                }
                Ok(())
            }
            Err(StoreError::NotFound) => {
                debug!(attachment = %nsn, "attachment deleted before status update");
                Ok(())
            }
            Err(err) => Err(ReconcileError::Transient(format!(
                "failed to write status of NetworkAttachment {nsn}: {err}"
            ))),
        }
    }
}

fn consider_lock(
    lock: &IPLock,
    att: Option<&NetworkAttachment>,
    analysis: &mut Analysis,
    undesired: &mut Vec<ParsedLock>,
    usable: &mut Vec<ParsedLock>,
    time_slippers: &mut usize,
) {
    let Ok(parsed) = ParsedLock::from_lock(lock) else {
        return;
    };
    if let Some(att) = att {
        let owner_uid = controller_owner(&lock.metadata, ATTACHMENT_KIND)
            .map(|(_, uid)| uid)
            .unwrap_or_default();
        if owner_uid != att.metadata.uid.as_deref().unwrap_or_default() {
            // Held by an older or newer edition of the attachment: leave
            // it to the garbage collector rather than risk deleting a lock
            // of a more recent edition.
            *time_slippers += 1;
            return;
        }
    }
    if parsed.vni != analysis.vni || parsed.addr < analysis.base || parsed.addr > analysis.last {
        undesired.push(parsed);
        return;
    }
    if let Some(att) = att {
        if parsed.uid == att.status.lock_uid
            && !att.status.ipv4.is_empty()
            && att.status.ipv4 == parsed.ip().to_string()
        {
            analysis.lock_in_status = Some(parsed.clone());
        }
    }
    usable.push(parsed);
}

/// The most upstream client write this attachment's address depends on:
/// the subnet's recorded one, unless the attachment itself was created
/// later.
fn effective_last_client_write(
    att: &NetworkAttachment,
    subnet_last_client_write: &ClientWrite,
) -> ClientWrite {
    let att_spec_time = att.extended.writes.server_write_time(NA_SECTION_SPEC);
    if subnet_last_client_write.time.is_none() || subnet_last_client_write.time < att_spec_time {
        ClientWrite {
            name: NA_CLIENT_WRITE.to_owned(),
            time: att_spec_time,
        }
    } else {
        subnet_last_client_write.clone()
    }
}

fn set_last_controller_start(
    att: &mut NetworkAttachment,
    ipam_start: DateTime<Utc>,
    subnet_last_controller_start: &ControllerStart,
) {
    let current = att.extended.last_controller_start.controller_time;
    if current.is_none() || current < Some(ipam_start) {
        att.extended.last_controller_start = ControllerStart {
            controller: IPAM_CONTROLLER_START.to_owned(),
            controller_time: Some(ipam_start),
        };
    }
    if let Some(subnet_started) = subnet_last_controller_start.controller_time {
        if att.extended.last_controller_start.controller_time < Some(subnet_started) {
            att.extended.last_controller_start = subnet_last_controller_start.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SUBNET_CLIENT_WRITE;

    fn att_with_spec_time(t: Option<DateTime<Utc>>) -> NetworkAttachment {
        let mut att = NetworkAttachment::default();
        if let Some(t) = t {
            att.extended.writes.set(NA_SECTION_SPEC, t);
        }
        att
    }

    #[test]
    fn last_client_write_prefers_later_of_subnet_and_attachment() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        // Attachment created after the subnet's client write.
        let got = effective_last_client_write(
            &att_with_spec_time(Some(t1)),
            &ClientWrite {
                name: SUBNET_CLIENT_WRITE.into(),
                time: Some(t0),
            },
        );
        assert_eq!((got.name.as_str(), got.time), (NA_CLIENT_WRITE, Some(t1)));

        // Subnet written after the attachment.
        let got = effective_last_client_write(
            &att_with_spec_time(Some(t0)),
            &ClientWrite {
                name: SUBNET_CLIENT_WRITE.into(),
                time: Some(t1),
            },
        );
        assert_eq!((got.name.as_str(), got.time), (SUBNET_CLIENT_WRITE, Some(t1)));

        // No subnet write recorded at all.
        let got = effective_last_client_write(&att_with_spec_time(Some(t0)), &ClientWrite::default());
        assert_eq!((got.name.as_str(), got.time), (NA_CLIENT_WRITE, Some(t0)));
    }

    #[test]
    fn controller_start_takes_latest_involved() {
        let t0 = Utc::now();
        let later = t0 + chrono::Duration::seconds(30);

        let mut att = NetworkAttachment::default();
        set_last_controller_start(&mut att, t0, &ControllerStart::default());
        assert_eq!(att.extended.last_controller_start.controller, IPAM_CONTROLLER_START);
        assert_eq!(att.extended.last_controller_start.controller_time, Some(t0));

        // A later subnet-validator start wins.
        let mut att = NetworkAttachment::default();
        set_last_controller_start(
            &mut att,
            t0,
            &ControllerStart {
                controller: crate::api::SUBNET_VALIDATOR_START.into(),
                controller_time: Some(later),
            },
        );
        assert_eq!(
            att.extended.last_controller_start.controller,
            crate::api::SUBNET_VALIDATOR_START
        );

        // An attachment already stamped later than this controller keeps
        // its stamp.
        let mut att = NetworkAttachment::default();
        att.extended.last_controller_start = ControllerStart {
            controller: "x".into(),
            controller_time: Some(later),
        };
        set_last_controller_start(&mut att, t0, &ControllerStart::default());
        assert_eq!(att.extended.last_controller_start.controller, "x");
    }
}
