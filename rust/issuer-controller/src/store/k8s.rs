use async_trait::async_trait;
use snafu::{OptionExt as _, ResultExt as _};
use stackable_operator::kube::{
    self,
    api::{Api, ApiResource, DynamicObject, Patch, PatchParams},
    runtime::reflector::ObjectRef,
};

use super::{
    object_ref, status_patch, ConflictSnafu, DeserializeSnafu, Error, GetSnafu,
    MissingNameSnafu, ResourceStore, SerializeSnafu, StoredResource, UpdateStatusSnafu,
};
use crate::FIELD_MANAGER;

/// A [`ResourceStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: stackable_operator::client::Client,
}

impl KubeStore {
    pub fn new(client: stackable_operator::client::Client) -> Self {
        Self { client }
    }

    /// Goes through [`DynamicObject`] so that namespaced and cluster-scoped kinds can share one code path.
    fn api<K: StoredResource>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.as_kube_client(), ns, &resource),
            None => Api::all_with(self.client.as_kube_client(), &resource),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: StoredResource>(&self, key: &ObjectRef<K>) -> Result<Option<K>, Error> {
        let object = key.to_string();
        let Some(dynamic) = self
            .api::<K>(key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .context(GetSnafu { object: &object })?
        else {
            return Ok(None);
        };
        let value = serde_json::to_value(dynamic).context(SerializeSnafu { object: &object })?;
        serde_json::from_value(value)
            .map(Some)
            .context(DeserializeSnafu { object })
    }

    async fn update_status<K: StoredResource>(&self, obj: &K) -> Result<K, Error> {
        let key = object_ref(obj).context(MissingNameSnafu)?;
        let object = key.to_string();
        let patch = status_patch(obj, &object)?;
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        // The resourceVersion in the patch turns a stale write into a 409
        let updated = match self
            .api::<K>(key.namespace.as_deref())
            .patch_status(&key.name, &params, &Patch::Merge(patch))
            .await
        {
            Ok(updated) => updated,
            Err(kube::Error::Api(err)) if err.code == 409 => {
                return ConflictSnafu { object }.fail();
            }
            Err(err) => return Err(err).context(UpdateStatusSnafu { object }),
        };
        let value = serde_json::to_value(updated).context(SerializeSnafu { object: &object })?;
        serde_json::from_value(value).context(DeserializeSnafu { object })
    }
}
