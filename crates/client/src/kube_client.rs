//! Kube-backed [`ResourceClient`](crate::ResourceClient) using dynamic
//! objects and API discovery.

use async_trait::async_trait;
use konverge_core::{ApiError, ResourceId};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, warn};

const FIELD_MANAGER: &str = "konverge";

/// Shared, read-only handle to the cluster. Clone-cheap; workers never hold
/// mutable state here.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn api_for(&self, id: &ResourceId) -> Result<Api<DynamicObject>, ApiError> {
        let gvk = parse_kind_key(&id.kind)?;
        let (ar, namespaced) = self.find_api_resource(&gvk).await?;
        if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(ApiError::Permanent(format!("namespace required for namespaced kind {}", id.kind))),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    async fn find_api_resource(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(kube::core::ApiResource, bool), ApiError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| ApiError::Transient(format!("api discovery failed: {e}")))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok((ar.clone(), namespaced));
                }
            }
        }
        Err(ApiError::Permanent(format!("kind not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
    }

    /// Fill identity fields the API server requires on the wire.
    fn to_object(&self, id: &ResourceId, payload: &Json) -> Result<DynamicObject, ApiError> {
        let gvk = parse_kind_key(&id.kind)?;
        let mut v = payload.clone();
        let obj = v
            .as_object_mut()
            .ok_or_else(|| ApiError::Permanent(format!("payload for {id} is not an object")))?;
        let api_version = if gvk.group.is_empty() {
            gvk.version.clone()
        } else {
            format!("{}/{}", gvk.group, gvk.version)
        };
        obj.insert("apiVersion".into(), Json::String(api_version));
        obj.insert("kind".into(), Json::String(gvk.kind.clone()));
        let meta = obj
            .entry("metadata")
            .or_insert_with(|| Json::Object(Default::default()));
        if let Some(m) = meta.as_object_mut() {
            m.insert("name".into(), Json::String(id.name.clone()));
            if let Some(ns) = &id.namespace {
                m.insert("namespace".into(), Json::String(ns.clone()));
            }
        }
        serde_json::from_value(v).map_err(|e| ApiError::Permanent(format!("payload for {id} rejected: {e}")))
    }
}

#[async_trait]
impl crate::ResourceClient for KubeClient {
    async fn get(&self, id: &ResourceId) -> Result<Option<Json>, ApiError> {
        counter!("api_get_total", 1u64);
        let api = self.api_for(id).await?;
        match api.get_opt(&id.name).await.map_err(map_kube_err)? {
            Some(obj) => {
                let v = serde_json::to_value(&obj)
                    .map_err(|e| ApiError::Permanent(format!("serializing live {id}: {e}")))?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn create(&self, id: &ResourceId, payload: &Json) -> Result<Json, ApiError> {
        counter!("api_create_total", 1u64);
        let api = self.api_for(id).await?;
        let obj = self.to_object(id, payload)?;
        debug!(id = %id, "create");
        let created = api.create(&PostParams::default(), &obj).await.map_err(map_kube_err)?;
        serde_json::to_value(&created).map_err(|e| ApiError::Permanent(format!("serializing created {id}: {e}")))
    }

    async fn update(&self, id: &ResourceId, payload: &Json) -> Result<Json, ApiError> {
        counter!("api_update_total", 1u64);
        let api = self.api_for(id).await?;
        let obj = self.to_object(id, payload)?;
        debug!(id = %id, "server-side apply");
        let pp = PatchParams::apply(FIELD_MANAGER);
        let updated = api
            .patch(&id.name, &pp, &Patch::Apply(&obj))
            .await
            .map_err(map_kube_err)?;
        serde_json::to_value(&updated).map_err(|e| ApiError::Permanent(format!("serializing updated {id}: {e}")))
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ApiError> {
        counter!("api_delete_total", 1u64);
        let api = self.api_for(id).await?;
        match api.delete(&id.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(id = %id, "delete target already gone");
                Ok(())
            }
            Err(e) => Err(map_kube_err(e)),
        }
    }
}

/// Classify kube failures into the retry taxonomy: 409 means the live object
/// moved under us, 429/5xx are worth retrying, other 4xx are not.
fn map_kube_err(e: kube::Error) -> ApiError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            409 => ApiError::DriftConflict(ae.message),
            429 => ApiError::Transient(ae.message),
            c if c >= 500 => ApiError::Transient(ae.message),
            _ => ApiError::Permanent(ae.message),
        },
        other => ApiError::Transient(other.to_string()),
    }
}

/// `v1/Namespace` or `apps/v1/Deployment` into a GVK.
fn parse_kind_key(key: &str) -> Result<GroupVersionKind, ApiError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(ApiError::Permanent(format!("invalid kind key: {key} (expect v1/Kind or group/v1/Kind)"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_key_parses_both_forms() {
        let g = parse_kind_key("v1/Namespace").unwrap();
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("", "v1", "Namespace"));
        let g = parse_kind_key("apps/v1/Deployment").unwrap();
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("apps", "v1", "Deployment"));
        assert!(parse_kind_key("Namespace").is_err());
    }

    #[test]
    fn kube_errors_map_to_retry_classes() {
        let api_err = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: format!("code {code}"),
                reason: String::new(),
                code,
            })
        };
        assert!(matches!(map_kube_err(api_err(409)), ApiError::DriftConflict(_)));
        assert!(matches!(map_kube_err(api_err(429)), ApiError::Transient(_)));
        assert!(matches!(map_kube_err(api_err(503)), ApiError::Transient(_)));
        assert!(matches!(map_kube_err(api_err(422)), ApiError::Permanent(_)));
    }
}
