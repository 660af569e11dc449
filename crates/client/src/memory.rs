//! In-memory [`ResourceClient`](crate::ResourceClient) with failure
//! injection. Backs the engine tests and offline planning; behaves like a
//! well-mannered API server (generated uids, conflict on double-create,
//! idempotent delete).

use async_trait::async_trait;
use konverge_core::{ApiError, ResourceId};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryClient {
    objects: Mutex<BTreeMap<ResourceId, Json>>,
    /// Scripted failures, consumed one per mutating call on that id.
    failures: Mutex<HashMap<ResourceId, VecDeque<ApiError>>>,
    /// Every call made, in order. Tests assert on this.
    calls: Mutex<Vec<(String, ResourceId)>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an existing object (as if created out of band).
    pub fn seed(&self, id: ResourceId, payload: Json) {
        self.objects.lock().unwrap().insert(id, payload);
    }

    /// Queue an error for the next mutating call on `id`.
    pub fn inject_failure(&self, id: ResourceId, err: ApiError) {
        self.failures.lock().unwrap().entry(id).or_default().push_back(err);
    }

    /// Full call log: `(op, id)` in call order.
    pub fn calls(&self) -> Vec<(String, ResourceId)> {
        self.calls.lock().unwrap().clone()
    }

    /// Only the mutating calls (create/update/delete).
    pub fn mutations(&self) -> Vec<(String, ResourceId)> {
        self.calls().into_iter().filter(|(op, _)| op != "get").collect()
    }

    pub fn contents(&self) -> BTreeMap<ResourceId, Json> {
        self.objects.lock().unwrap().clone()
    }

    fn record(&self, op: &str, id: &ResourceId) {
        self.calls.lock().unwrap().push((op.to_string(), id.clone()));
    }

    fn take_failure(&self, id: &ResourceId) -> Option<ApiError> {
        self.failures.lock().unwrap().get_mut(id).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl crate::ResourceClient for MemoryClient {
    async fn get(&self, id: &ResourceId) -> Result<Option<Json>, ApiError> {
        self.record("get", id);
        Ok(self.objects.lock().unwrap().get(id).cloned())
    }

    async fn create(&self, id: &ResourceId, payload: &Json) -> Result<Json, ApiError> {
        self.record("create", id);
        if let Some(err) = self.take_failure(id) {
            return Err(err);
        }
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(id) {
            return Err(ApiError::DriftConflict(format!("{id} already exists")));
        }
        let mut stored = payload.clone();
        if let Some(meta) = stored
            .as_object_mut()
            .map(|o| o.entry("metadata").or_insert_with(|| Json::Object(Default::default())))
            .and_then(|m| m.as_object_mut())
        {
            meta.insert("uid".into(), Json::String(Uuid::new_v4().to_string()));
        }
        objects.insert(id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: &ResourceId, payload: &Json) -> Result<Json, ApiError> {
        self.record("update", id);
        if let Some(err) = self.take_failure(id) {
            return Err(err);
        }
        let mut objects = self.objects.lock().unwrap();
        let Some(existing) = objects.get(id) else {
            return Err(ApiError::DriftConflict(format!("{id} vanished before update")));
        };
        // Server-assigned identity survives updates.
        let uid = existing.pointer("/metadata/uid").cloned();
        let mut stored = payload.clone();
        if let (Some(uid), Some(meta)) = (
            uid,
            stored
                .as_object_mut()
                .map(|o| o.entry("metadata").or_insert_with(|| Json::Object(Default::default())))
                .and_then(|m| m.as_object_mut()),
        ) {
            meta.insert("uid".into(), uid);
        }
        objects.insert(id.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ApiError> {
        self.record("delete", id);
        if let Some(err) = self.take_failure(id) {
            return Err(err);
        }
        self.objects.lock().unwrap().remove(id);
        Ok(())
    }
}
