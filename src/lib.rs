//! # netattach-controller
//!
//! Control plane for virtual network attachments on a cluster of hosts.
//!
//! Tenants declare three kinds of desired state through the
//! `network.example.com` API group: **Subnets** (a CIDR bound to a VNI),
//! **NetworkAttachments** (a request for one interface on a particular node
//! inside a subnet), and **IPLocks** (cluster-wide reservations of one IPv4
//! address inside a VNI). Two controller families bring that state to life:
//!
//! - the **IPAM controller** (`ipam`, binary `ipam-controller`) assigns an
//!   address to each attachment, records the assignment as an IPLock, and
//!   writes the address into the attachment's status;
//! - the **connection agent** (`agent`, binary `connection-agent`) runs on
//!   every node, creates the local interface for each attachment placed on
//!   its node, and keeps a tunnel endpoint towards every other host with an
//!   attachment in a locally relevant VNI.
//!
//! Both follow the watch/cache/workqueue reconciliation pattern: caches
//! (`cache`) mirror the object store, handlers enqueue keys, workers
//! reconcile one key at a time and write results back through `store`.

pub mod agent;
pub mod api;
pub mod cache;
pub mod fabric;
pub mod ipam;
pub mod netutil;
pub mod observability;
pub mod server;
pub mod store;
