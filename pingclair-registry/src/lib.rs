//! OCI Distribution v2 registry core (spec §4.4): content-addressed blob
//! storage with resumable uploads, manifest storage with a content-type
//! sidecar and tag index, served over the wire contract spec §6 names.
//! Independent leaf: only publishes to the Event Bus, never subscribes.

pub mod blob_store;
pub mod manifest_store;
pub mod server;

pub use blob_store::{BlobStore, BlobStoreError};
pub use manifest_store::{ManifestStore, ManifestStoreError, StoredManifest};
pub use server::{run_registry_server, Registry};
