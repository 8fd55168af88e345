//! Shared fixtures: an in-memory object store implementing the server-side
//! stamping contract, builders for the three kinds, and an informer
//! factory whose caches the tests feed directly.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use tokio::sync::watch;

use netattach_controller::agent::{InformerFactory, InformerHandle};
use netattach_controller::api::{
    IPLock, NetworkAttachment, NetworkAttachmentSpec, Subnet, SubnetSpec, SubnetStatus,
    IPLOCK_SECTION_SPEC, NA_SECTION_ADDR, NA_SECTION_EXEC_REPORT, NA_SECTION_IMPL,
    NA_SECTION_SPEC,
};
use netattach_controller::cache::CacheCore;
use netattach_controller::store::{NetApi, StoreError};

/// In-memory object store. Stamps write sections with the server clock the
/// way the real store does: `spec` on create, the status sections on the
/// status writes that changed them.
#[derive(Default)]
pub struct MemStore {
    locks: Mutex<HashMap<(String, String), IPLock>>,
    attachments: Mutex<HashMap<(String, String), NetworkAttachment>>,
    pub events: Mutex<Vec<String>>,
    counter: AtomicU64,
    lock_creates: AtomicU64,
    status_updates: AtomicU64,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Seeds (or wholesale replaces) an attachment, stamping its spec
    /// write; returns the stored copy.
    pub fn put_attachment(&self, mut att: NetworkAttachment) -> NetworkAttachment {
        if att.metadata.uid.is_none() {
            att.metadata.uid = Some(self.next("uid"));
        }
        if att.metadata.resource_version.is_none() {
            att.metadata.resource_version = Some("1".to_owned());
        }
        if att.extended.writes.server_write_time(NA_SECTION_SPEC).is_none() {
            att.extended.writes.set(NA_SECTION_SPEC, Utc::now());
        }
        let key = (
            att.metadata.namespace.clone().unwrap_or_default(),
            att.metadata.name.clone().unwrap_or_default(),
        );
        self.attachments.lock().unwrap().insert(key, att.clone());
        att
    }

    pub fn get_attachment(&self, namespace: &str, name: &str) -> Option<NetworkAttachment> {
        self.attachments
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn remove_attachment(&self, namespace: &str, name: &str) {
        self.attachments
            .lock()
            .unwrap()
            .remove(&(namespace.to_owned(), name.to_owned()));
    }

    pub fn list_locks(&self, namespace: &str) -> Vec<IPLock> {
        self.locks
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect()
    }

    pub fn lock_creates(&self) -> u64 {
        self.lock_creates.load(Ordering::Relaxed)
    }

    pub fn status_updates(&self) -> u64 {
        self.status_updates.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NetApi for MemStore {
    async fn get_ip_lock(&self, namespace: &str, name: &str) -> Result<IPLock, StoreError> {
        self.locks
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_ip_lock(&self, namespace: &str, lock: &IPLock) -> Result<IPLock, StoreError> {
        let key = (
            namespace.to_owned(),
            lock.metadata.name.clone().unwrap_or_default(),
        );
        let mut locks = self.locks.lock().unwrap();
        if locks.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        let mut stored = lock.clone();
        stored.metadata.namespace = Some(namespace.to_owned());
        stored.metadata.uid = Some(self.next("lock-uid"));
        stored.metadata.resource_version = Some("1".to_owned());
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.extended.writes.set(IPLOCK_SECTION_SPEC, Utc::now());
        locks.insert(key, stored.clone());
        self.lock_creates.fetch_add(1, Ordering::Relaxed);
        Ok(stored)
    }

    async fn delete_ip_lock(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> Result<(), StoreError> {
        let key = (namespace.to_owned(), name.to_owned());
        let mut locks = self.locks.lock().unwrap();
        match locks.get(&key) {
            None => Err(StoreError::NotFound),
            Some(stored) if stored.metadata.uid.as_deref() != Some(uid) => {
                // Failed UID precondition reads as "the lock we knew is
                // gone".
                Err(StoreError::NotFound)
            }
            Some(_) => {
                locks.remove(&key);
                Ok(())
            }
        }
    }

    async fn update_attachment_status(
        &self,
        att: &NetworkAttachment,
    ) -> Result<NetworkAttachment, StoreError> {
        let key = (
            att.metadata.namespace.clone().unwrap_or_default(),
            att.metadata.name.clone().unwrap_or_default(),
        );
        let mut attachments = self.attachments.lock().unwrap();
        let Some(stored) = attachments.get(&key) else {
            return Err(StoreError::NotFound);
        };
        let mut next = stored.clone();
        let now = Utc::now();
        if (att.status.ipv4.as_str(), att.status.address_vni, att.status.lock_uid.as_str())
            != (
                stored.status.ipv4.as_str(),
                stored.status.address_vni,
                stored.status.lock_uid.as_str(),
            )
        {
            next.extended.writes.set(NA_SECTION_ADDR, now);
        }
        if (
            att.status.host_ip.as_str(),
            att.status.mac_address.as_str(),
            att.status.ifc_name.as_str(),
        ) != (
            stored.status.host_ip.as_str(),
            stored.status.mac_address.as_str(),
            stored.status.ifc_name.as_str(),
        ) {
            next.extended.writes.set(NA_SECTION_IMPL, now);
        }
        if att.status.post_create_exec_report != stored.status.post_create_exec_report {
            next.extended.writes.set(NA_SECTION_EXEC_REPORT, now);
        }
        next.status = att.status.clone();
        next.extended.last_client_write = att.extended.last_client_write.clone();
        next.extended.last_controller_start = att.extended.last_controller_start.clone();
        let rv: u64 = next
            .metadata
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse().ok())
            .unwrap_or(1);
        next.metadata.resource_version = Some((rv + 1).to_string());
        attachments.insert(key, next.clone());
        self.status_updates.fetch_add(1, Ordering::Relaxed);
        Ok(next)
    }

    async fn record_address_assigned(&self, att: &NetworkAttachment, ip: Ipv4Addr) {
        self.events.lock().unwrap().push(format!(
            "AddressAssigned {}/{} {ip}",
            att.metadata.namespace.as_deref().unwrap_or_default(),
            att.metadata.name.as_deref().unwrap_or_default()
        ));
    }
}

pub fn subnet(namespace: &str, name: &str, cidr: &str, vni: u32, validated: bool) -> Subnet {
    Subnet {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_owned()),
            name: Some(name.to_owned()),
            uid: Some(format!("subnet-uid-{name}")),
            ..Default::default()
        },
        spec: SubnetSpec {
            ipv4: cidr.to_owned(),
            vni,
        },
        status: SubnetStatus {
            validated,
            errors: Vec::new(),
        },
        ..Default::default()
    }
}

pub fn attachment(namespace: &str, name: &str, node: &str, subnet: &str) -> NetworkAttachment {
    NetworkAttachment {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_owned()),
            name: Some(name.to_owned()),
            ..Default::default()
        },
        spec: NetworkAttachmentSpec {
            node: node.to_owned(),
            subnet: subnet.to_owned(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Informer factory whose caches are fed by the test instead of a watch.
#[derive(Default)]
pub struct TestInformerFactory {
    remote_caches: Mutex<HashMap<u32, Arc<CacheCore<NetworkAttachment>>>>,
    remote_stops: Mutex<HashMap<u32, watch::Receiver<bool>>>,
}

impl TestInformerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn remote_cache(&self, vni: u32) -> Option<Arc<CacheCore<NetworkAttachment>>> {
        self.remote_caches.lock().unwrap().get(&vni).cloned()
    }

    /// Whether the remote informer for the VNI has been told to stop.
    pub fn remote_informer_stopped(&self, vni: u32) -> bool {
        self.remote_stops
            .lock()
            .unwrap()
            .get(&vni)
            .is_some_and(|rx| *rx.borrow() || rx.has_changed().is_err())
    }
}

impl InformerFactory for TestInformerFactory {
    fn start_local_informer(&self, cache: Arc<CacheCore<NetworkAttachment>>) -> InformerHandle {
        cache.mark_synced();
        InformerHandle::noop()
    }

    fn start_remote_informer(
        &self,
        _namespace: &str,
        vni: u32,
        cache: Arc<CacheCore<NetworkAttachment>>,
    ) -> InformerHandle {
        cache.mark_synced();
        let (stop_tx, stop_rx) = watch::channel(false);
        self.remote_caches.lock().unwrap().insert(vni, cache);
        self.remote_stops.lock().unwrap().insert(vni, stop_rx);
        InformerHandle::new(stop_tx)
    }
}
