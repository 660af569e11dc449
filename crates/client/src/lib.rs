//! Konverge managed-system clients.
//!
//! The executor talks to the managed system through [`ResourceClient`] only;
//! payloads stay opaque JSON. `KubeClient` drives a real cluster through
//! dynamic-object CRUD, `MemoryClient` backs tests and offline planning.

#![forbid(unsafe_code)]

pub mod kube_client;
pub mod memory;

use async_trait::async_trait;
use konverge_core::{ApiError, ObservedState, ResourceId};
use serde_json::Value as Json;

pub use kube_client::KubeClient;
pub use memory::MemoryClient;

/// CRUD surface of the managed system, keyed by resource identity.
///
/// `create` and `update` return the resulting observed payload, including
/// server-assigned outputs (generated identifiers and the like) that
/// dependent resources may reference.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, id: &ResourceId) -> Result<Option<Json>, ApiError>;
    async fn create(&self, id: &ResourceId, payload: &Json) -> Result<Json, ApiError>;
    async fn update(&self, id: &ResourceId, payload: &Json) -> Result<Json, ApiError>;
    /// Deleting an absent resource is not an error; the desired end-state
    /// already holds.
    async fn delete(&self, id: &ResourceId) -> Result<(), ApiError>;

    /// Snapshot current state for a set of identities.
    async fn observe(&self, ids: &[ResourceId]) -> Result<ObservedState, ApiError> {
        let mut out = ObservedState::new();
        for id in ids {
            if let Some(payload) = self.get(id).await? {
                out.insert(id.clone(), payload);
            }
        }
        Ok(out)
    }
}
