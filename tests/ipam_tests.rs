//! IPAM reconciler behavior against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;

use netattach_controller::api::{
    attachment_owner_ref, controller_owner, IPLock, IPLockSpec, NetworkAttachment, Subnet,
    ATTACHMENT_KIND,
};
use netattach_controller::cache::{CacheCore, RateLimiter, WorkQueue};
use netattach_controller::ipam::{
    make_lock_name, parse_lock_name, IpamController, FULL_SUBNET_STATUS_MSG,
};
use netattach_controller::netutil::{u32_to_ipv4, Nsn};
use netattach_controller::observability::IpamMetrics;
use netattach_controller::store::NetApi;

use common::{attachment, subnet, MemStore};

struct Harness {
    store: Arc<MemStore>,
    subnets: Arc<CacheCore<Subnet>>,
    attachments: Arc<CacheCore<NetworkAttachment>>,
    locks: Arc<CacheCore<IPLock>>,
    controller: Arc<IpamController>,
}

fn harness_with_api(store: Arc<MemStore>, api: Arc<dyn NetApi>) -> Harness {
    let subnets: Arc<CacheCore<Subnet>> = CacheCore::new();
    let attachments: Arc<CacheCore<NetworkAttachment>> = CacheCore::new();
    let locks: Arc<CacheCore<IPLock>> = CacheCore::new();
    let queue = WorkQueue::new(RateLimiter::new(
        Duration::from_millis(1),
        Duration::from_millis(10),
    ));
    let metrics = IpamMetrics::new(&Registry::new(), 1).unwrap();
    let controller = IpamController::new(
        api,
        Arc::clone(&subnets),
        Arc::clone(&attachments),
        Arc::clone(&locks),
        queue,
        1,
        metrics,
    );
    controller.register();
    Harness {
        store,
        subnets,
        attachments,
        locks,
        controller,
    }
}

fn harness() -> Harness {
    let store = MemStore::new();
    let api = Arc::clone(&store) as Arc<dyn NetApi>;
    harness_with_api(store, api)
}

#[tokio::test]
async fn assigns_address_creates_lock_and_skips_repeat_work() {
    let h = harness();
    h.subnets
        .apply(subnet("default", "s1", "192.168.0.0/29", 7, true));
    let att = h
        .store
        .put_attachment(attachment("default", "a1", "n1", "s1"));
    h.attachments.apply(att.clone());
    let nsn = Nsn::new("default", "a1");

    h.controller.process_attachment(&nsn).await.unwrap();

    // One lock, named from the VNI and the chosen address; first free
    // address with network/broadcast (and gateway) excluded is .2.
    let locks = h.store.list_locks("default");
    assert_eq!(locks.len(), 1);
    let lock_name = locks[0].metadata.name.clone().unwrap();
    let (vni, addr) = parse_lock_name(&lock_name).unwrap();
    assert_eq!(vni, 7);
    assert_eq!(u32_to_ipv4(addr).to_string(), "192.168.0.2");
    let att_uid = att.metadata.uid.as_deref().unwrap();
    assert_eq!(
        controller_owner(&locks[0].metadata, ATTACHMENT_KIND),
        Some(("a1", att_uid))
    );

    // Status reflects the assignment and the event fired.
    let stored = h.store.get_attachment("default", "a1").unwrap();
    assert_eq!(stored.status.ipv4, "192.168.0.2");
    assert_eq!(stored.status.address_vni, 7);
    assert_eq!(
        stored.status.lock_uid,
        locks[0].metadata.uid.clone().unwrap()
    );
    assert!(stored.status.errors.ipam.is_empty());
    assert!(h.store.events.lock().unwrap()[0].contains("AddressAssigned default/a1"));

    // Reconciling again while the status write has not come back through
    // the watch stream must not issue new API calls (anticipation).
    let (creates, updates) = (h.store.lock_creates(), h.store.status_updates());
    h.controller.process_attachment(&nsn).await.unwrap();
    assert_eq!(h.store.lock_creates(), creates);
    assert_eq!(h.store.status_updates(), updates);

    // Once the updated attachment and its lock are visible in the caches,
    // the lock-in-status shortcut keeps the reconcile write-free.
    h.attachments.apply(stored.clone());
    h.locks.apply(locks[0].clone());
    h.controller.process_attachment(&nsn).await.unwrap();
    assert_eq!(h.store.lock_creates(), creates);
    assert_eq!(h.store.status_updates(), updates);
}

#[tokio::test]
async fn small_subnet_uses_full_range_and_reports_saturation() {
    let h = harness();
    // A /30 has 4 addresses, below the threshold for excluding network
    // and broadcast: all four are assignable.
    h.subnets.apply(subnet("default", "s1", "10.0.0.0/30", 9, true));

    let mut assigned = Vec::new();
    for i in 1..=4 {
        let name = format!("a{i}");
        let att = h
            .store
            .put_attachment(attachment("default", &name, "n1", "s1"));
        h.attachments.apply(att);
        h.controller
            .process_attachment(&Nsn::new("default", name.as_str()))
            .await
            .unwrap();
        assigned.push(h.store.get_attachment("default", &name).unwrap().status.ipv4);
    }
    assigned.sort();
    assert_eq!(assigned, vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]);

    // The fifth attachment finds the subnet saturated.
    let att = h
        .store
        .put_attachment(attachment("default", "a5", "n1", "s1"));
    h.attachments.apply(att);
    let result = h
        .controller
        .process_attachment(&Nsn::new("default", "a5"))
        .await;
    assert!(result.is_err(), "saturation retries with backoff");
    let stored = h.store.get_attachment("default", "a5").unwrap();
    assert_eq!(stored.status.errors.ipam, vec![FULL_SUBNET_STATUS_MSG]);
    assert!(stored.status.address_contention);
    assert!(stored.status.ipv4.is_empty());
}

#[tokio::test]
async fn create_collision_repicks_a_fresh_address() {
    let h = harness();
    h.subnets
        .apply(subnet("default", "s1", "10.1.0.0/29", 11, true));

    // Another attachment already locked 10.1.0.2 (the first address this
    // controller's empty cache will pick).
    let other = h
        .store
        .put_attachment(attachment("default", "b1", "n1", "s1"));
    let colliding = IPLock {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            namespace: Some("default".into()),
            name: Some(make_lock_name(11, "10.1.0.2".parse().unwrap())),
            owner_references: Some(vec![attachment_owner_ref(&other)]),
            ..Default::default()
        },
        spec: IPLockSpec {
            subnet_name: "s1".into(),
        },
        ..Default::default()
    };
    h.store.create_ip_lock("default", &colliding).await.unwrap();

    let att = h
        .store
        .put_attachment(attachment("default", "a1", "n1", "s1"));
    h.attachments.apply(att);
    let nsn = Nsn::new("default", "a1");

    // First pass loses the create race and comes back transient; the
    // colliding address stays marked in the cache.
    assert!(h.controller.process_attachment(&nsn).await.is_err());

    // The retry picks afresh and succeeds with a different address.
    h.controller.process_attachment(&nsn).await.unwrap();
    let stored = h.store.get_attachment("default", "a1").unwrap();
    assert_eq!(stored.status.ipv4, "10.1.0.3");
    let mut held: Vec<String> = h
        .store
        .list_locks("default")
        .into_iter()
        .map(|l| l.metadata.name.unwrap())
        .collect();
    held.sort();
    assert_eq!(held, vec!["v1-11-10-1-0-2", "v1-11-10-1-0-3"]);
}

#[tokio::test]
async fn subnet_problems_land_in_status() {
    let h = harness();
    let nsn = Nsn::new("default", "a1");

    // Referenced subnet does not exist.
    let att = h
        .store
        .put_attachment(attachment("default", "a1", "n1", "s1"));
    h.attachments.apply(att.clone());
    h.controller.process_attachment(&nsn).await.unwrap();
    let stored = h.store.get_attachment("default", "a1").unwrap();
    assert_eq!(stored.status.errors.ipam, vec!["Subnet s1 does not exist"]);

    // Subnet exists but is not validated yet and carries no errors: wait
    // silently for the validator.
    let updates = h.store.status_updates();
    h.subnets
        .apply(subnet("default", "s1", "10.0.0.0/29", 7, false));
    h.controller.process_attachment(&nsn).await.unwrap();
    assert_eq!(h.store.status_updates(), updates);

    // Subnet failed validation.
    let mut failed = subnet("default", "s1", "10.0.0.0/29", 7, false);
    failed.status.errors = vec!["conflicts with another subnet".into()];
    h.subnets.apply(failed);
    h.controller.process_attachment(&nsn).await.unwrap();
    let stored = h.store.get_attachment("default", "a1").unwrap();
    assert_eq!(
        stored.status.errors.ipam,
        vec!["Subnet s1 has not passed validation"]
    );

    // Subnet validated but with a malformed CIDR.
    h.subnets
        .apply(subnet("default", "s1", "not-a-cidr", 7, true));
    h.controller.process_attachment(&nsn).await.unwrap();
    let stored = h.store.get_attachment("default", "a1").unwrap();
    assert_eq!(stored.status.errors.ipam.len(), 1);
    assert!(stored.status.errors.ipam[0].contains("malformed IPv4 CIDR"));
}

#[tokio::test]
async fn deleting_the_attachment_releases_its_locks() {
    let h = harness();
    h.subnets
        .apply(subnet("default", "s1", "10.2.0.0/29", 13, true));
    let att = h
        .store
        .put_attachment(attachment("default", "a1", "n1", "s1"));
    h.attachments.apply(att.clone());
    let nsn = Nsn::new("default", "a1");
    h.controller.process_attachment(&nsn).await.unwrap();
    let lock = h.store.list_locks("default").remove(0);
    h.locks.apply(lock);

    // The attachment disappears from the cache (deletion); its lock must
    // be released.
    h.attachments.remove(att);
    h.controller.process_attachment(&nsn).await.unwrap();
    assert!(h.store.list_locks("default").is_empty());
}

/// Store whose IPLock creates are rejected as invalid; everything else
/// delegates to the in-memory store.
struct InvalidLockStore {
    inner: Arc<MemStore>,
}

#[async_trait::async_trait]
impl NetApi for InvalidLockStore {
    async fn get_ip_lock(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<IPLock, netattach_controller::store::StoreError> {
        self.inner.get_ip_lock(namespace, name).await
    }

    async fn create_ip_lock(
        &self,
        _namespace: &str,
        _lock: &IPLock,
    ) -> Result<IPLock, netattach_controller::store::StoreError> {
        Err(netattach_controller::store::StoreError::Invalid(
            "IPLock spec rejected".to_owned(),
        ))
    }

    async fn delete_ip_lock(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> Result<(), netattach_controller::store::StoreError> {
        self.inner.delete_ip_lock(namespace, name, uid).await
    }

    async fn update_attachment_status(
        &self,
        att: &netattach_controller::api::NetworkAttachment,
    ) -> Result<netattach_controller::api::NetworkAttachment, netattach_controller::store::StoreError>
    {
        self.inner.update_attachment_status(att).await
    }

    async fn record_address_assigned(
        &self,
        att: &netattach_controller::api::NetworkAttachment,
        ip: std::net::Ipv4Addr,
    ) {
        self.inner.record_address_assigned(att, ip).await;
    }
}

#[tokio::test]
async fn invalid_lock_create_still_records_the_picked_address() {
    let store = MemStore::new();
    let api = Arc::new(InvalidLockStore {
        inner: Arc::clone(&store),
    });
    let h = harness_with_api(Arc::clone(&store), api);
    h.subnets.apply(subnet("default", "s1", "10.4.0.0/29", 19, true));
    let att = h
        .store
        .put_attachment(attachment("default", "a1", "n1", "s1"));
    h.attachments.apply(att);
    let nsn = Nsn::new("default", "a1");

    // The create is rejected permanently: no lock exists afterwards, but
    // the picked address still lands in status with no lock UID, and the
    // key is not retried.
    h.controller.process_attachment(&nsn).await.unwrap();
    assert!(h.store.list_locks("default").is_empty());
    let stored = h.store.get_attachment("default", "a1").unwrap();
    assert_eq!(stored.status.ipv4, "10.4.0.2");
    assert_eq!(stored.status.address_vni, 19);
    assert!(stored.status.lock_uid.is_empty());
    assert!(stored.status.errors.ipam.is_empty());

    // The address was released from the cache, so another attachment
    // picks the very same one.
    let other = h
        .store
        .put_attachment(attachment("default", "b1", "n1", "s1"));
    h.attachments.apply(other);
    h.controller
        .process_attachment(&Nsn::new("default", "b1"))
        .await
        .unwrap();
    assert_eq!(
        h.store.get_attachment("default", "b1").unwrap().status.ipv4,
        "10.4.0.2"
    );

    // Anticipation covers the written address: reconciling the unchanged
    // attachment again issues no further writes.
    let updates = h.store.status_updates();
    h.controller.process_attachment(&nsn).await.unwrap();
    assert_eq!(h.store.status_updates(), updates);
}

#[tokio::test]
async fn adopts_the_lock_named_in_status_before_picking() {
    let h = harness();
    h.subnets
        .apply(subnet("default", "s1", "10.3.0.0/29", 17, true));

    // The attachment's status names an address and lock, but the lock has
    // not reached the lock cache: a point lookup by deterministic name
    // must find and keep it instead of picking a new address.
    let mut att = attachment("default", "a1", "n1", "s1");
    att = h.store.put_attachment(att);
    let lock = IPLock {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            namespace: Some("default".into()),
            name: Some(make_lock_name(17, "10.3.0.2".parse().unwrap())),
            owner_references: Some(vec![attachment_owner_ref(&att)]),
            ..Default::default()
        },
        spec: IPLockSpec {
            subnet_name: "s1".into(),
        },
        ..Default::default()
    };
    let lock = h.store.create_ip_lock("default", &lock).await.unwrap();
    att.status.ipv4 = "10.3.0.2".into();
    att.status.address_vni = 17;
    att.status.lock_uid = lock.metadata.uid.clone().unwrap();
    let att = h.store.put_attachment(att);
    h.attachments.apply(att);

    let (creates, updates) = (h.store.lock_creates(), h.store.status_updates());
    h.controller
        .process_attachment(&Nsn::new("default", "a1"))
        .await
        .unwrap();
    // Already bound: no new lock, no status write.
    assert_eq!(h.store.lock_creates(), creates);
    assert_eq!(h.store.status_updates(), updates);
    assert_eq!(h.store.list_locks("default").len(), 1);
}
