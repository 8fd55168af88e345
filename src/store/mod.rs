//! The slice of the object-store API the reconcilers actually use.
//!
//! Reading happens through the watch-caches; this trait carries only the
//! writes (plus the one point lookup the IPAM controller needs) so the
//! reconcilers can run against the real apiserver or an in-memory stand-in.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::warn;

use crate::api::{IPLock, NetworkAttachment, API_GROUP, API_VERSION, ATTACHMENT_KIND};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("conflict")]
    Conflict,
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("api error: {0}")]
    Api(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    /// Short classification for metric labels.
    pub fn summarize(err: Option<&StoreError>) -> &'static str {
        match err {
            None => "ok",
            Some(StoreError::NotFound) => "nf",
            Some(_) => "err",
        }
    }
}

fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.reason.as_str() {
            "NotFound" => StoreError::NotFound,
            "AlreadyExists" => StoreError::AlreadyExists,
            "Conflict" => {
                // A failed UID precondition means the named object is not
                // the one we knew: treat it as gone.
                if resp.message.contains("UID") {
                    StoreError::NotFound
                } else {
                    StoreError::Conflict
                }
            }
            "Invalid" => StoreError::Invalid(resp.message),
            _ => match resp.code {
                404 => StoreError::NotFound,
                409 => StoreError::Conflict,
                422 => StoreError::Invalid(resp.message),
                _ => StoreError::Api(resp.message),
            },
        },
        other => StoreError::Api(other.to_string()),
    }
}

#[async_trait]
pub trait NetApi: Send + Sync {
    async fn get_ip_lock(&self, namespace: &str, name: &str) -> Result<IPLock, StoreError>;

    async fn create_ip_lock(&self, namespace: &str, lock: &IPLock) -> Result<IPLock, StoreError>;

    /// Deletes the named lock iff its UID still matches.
    async fn delete_ip_lock(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> Result<(), StoreError>;

    async fn update_attachment_status(
        &self,
        att: &NetworkAttachment,
    ) -> Result<NetworkAttachment, StoreError>;

    /// Emits an `AddressAssigned` event for the attachment. Failures are
    /// not propagated; events are advisory.
    async fn record_address_assigned(&self, att: &NetworkAttachment, ip: Ipv4Addr);
}

/// `NetApi` against the real object store.
pub struct KubeNetApi {
    client: Client,
    recorder: Recorder,
}

impl KubeNetApi {
    pub fn new(client: Client, component: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: component.to_owned(),
            instance,
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    fn locks(&self, namespace: &str) -> Api<IPLock> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl NetApi for KubeNetApi {
    async fn get_ip_lock(&self, namespace: &str, name: &str) -> Result<IPLock, StoreError> {
        self.locks(namespace).get(name).await.map_err(classify)
    }

    async fn create_ip_lock(&self, namespace: &str, lock: &IPLock) -> Result<IPLock, StoreError> {
        self.locks(namespace)
            .create(&PostParams::default(), lock)
            .await
            .map_err(classify)
    }

    async fn delete_ip_lock(
        &self,
        namespace: &str,
        name: &str,
        uid: &str,
    ) -> Result<(), StoreError> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(uid.to_owned()),
                resource_version: None,
            }),
            ..Default::default()
        };
        self.locks(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn update_attachment_status(
        &self,
        att: &NetworkAttachment,
    ) -> Result<NetworkAttachment, StoreError> {
        let namespace = att.namespace().unwrap_or_default();
        let name = att.name_any();
        let api: Api<NetworkAttachment> = Api::namespaced(self.client.clone(), &namespace);
        let body = serde_json::to_vec(att).map_err(|e| StoreError::Api(e.to_string()))?;
        api.replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(classify)
    }

    async fn record_address_assigned(&self, att: &NetworkAttachment, ip: Ipv4Addr) {
        let reference = ObjectReference {
            api_version: Some(format!("{API_GROUP}/{API_VERSION}")),
            kind: Some(ATTACHMENT_KIND.to_owned()),
            namespace: att.namespace(),
            name: att.metadata.name.clone(),
            uid: att.metadata.uid.clone(),
            ..Default::default()
        };
        let event = Event {
            type_: EventType::Normal,
            reason: "AddressAssigned".to_owned(),
            note: Some(format!("Assigned IPv4 address {ip}")),
            action: "Assign".to_owned(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            warn!(error = %err, attachment = %att.name_any(), "failed to record event");
        }
    }
}
