use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use snafu::{OptionExt as _, ResultExt as _};
use stackable_operator::kube::runtime::reflector::ObjectRef;

use super::{
    merge_patch, object_ref, status_patch, ConflictSnafu, DeserializeSnafu, Error,
    MissingNameSnafu, NotFoundSnafu, ResourceStore, SerializeSnafu, StoredResource,
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct StoreKey {
    api_version: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

impl StoreKey {
    fn new<K: StoredResource>(key: &ObjectRef<K>) -> Self {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }
}

/// A [`ResourceStore`] that keeps objects in memory.
///
/// Behaves like merge patches against the status subresource of the Kubernetes API. Status updates
/// only touch `status` and bump `resourceVersion`. They are rejected if the caller's
/// `resourceVersion` is outdated.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<StoreKey, serde_json::Value>>,
    last_resource_version: AtomicU64,
    status_writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<BTreeMap<StoreKey, serde_json::Value>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_resource_version(&self) -> String {
        (self.last_resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Creates or overwrites `obj`, including its status.
    pub fn insert<K: StoredResource>(&self, mut obj: K) -> Result<(), Error> {
        let key = object_ref(&obj).context(MissingNameSnafu)?;
        obj.meta_mut().resource_version = Some(self.next_resource_version());
        let value = serde_json::to_value(&obj).context(SerializeSnafu {
            object: key.to_string(),
        })?;
        self.objects().insert(StoreKey::new(&key), value);
        Ok(())
    }

    /// Number of successful [`ResourceStore::update_status`] calls so far.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get<K: StoredResource>(&self, key: &ObjectRef<K>) -> Result<Option<K>, Error> {
        let Some(value) = self.objects().get(&StoreKey::new(key)).cloned() else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .context(DeserializeSnafu {
                object: key.to_string(),
            })
    }

    async fn update_status<K: StoredResource>(&self, obj: &K) -> Result<K, Error> {
        let key = object_ref(obj).context(MissingNameSnafu)?;
        let object = key.to_string();
        let patch = status_patch(obj, &object)?;

        let mut objects = self.objects();
        let stored = objects
            .get_mut(&StoreKey::new(&key))
            .context(NotFoundSnafu { object: &object })?;
        let stored_version = stored["metadata"]["resourceVersion"].as_str();
        if obj.meta().resource_version.as_deref() != stored_version {
            return ConflictSnafu { object }.fail();
        }

        merge_patch(stored, patch);
        stored["metadata"]["resourceVersion"] =
            serde_json::Value::String(self.next_resource_version());
        let updated = stored.clone();
        drop(objects);

        self.status_writes.fetch_add(1, Ordering::SeqCst);
        serde_json::from_value(updated).context(DeserializeSnafu { object })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use stackable_operator::{
        k8s_openapi::{api::core::v1::Secret, ByteString},
        kube::{api::ObjectMeta, runtime::reflector::ObjectRef, CustomResource},
        schemars::{self, JsonSchema},
    };

    use super::InMemoryStore;
    use crate::{
        condition::{ConditionStatus, HasConditions, CONDITION_READY},
        external_crd::cert_manager::{
            CertificateRequest, CertificateRequestSpec, CertificateRequestStatus, ObjectReference,
        },
        store::{Error, ResourceStore},
        utils::k8s_time,
    };

    /// The same resource as [`CertificateRequest`], as seen by a client that also knows about
    /// `status.ca`.
    #[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
    #[kube(
        group = "cert-manager.io",
        version = "v1",
        kind = "CertificateRequest",
        struct = "CertificateRequestWithCa",
        namespaced,
        status = "StatusWithCa",
        crates(
            kube_core = "stackable_operator::kube::core",
            k8s_openapi = "stackable_operator::k8s_openapi",
            schemars = "stackable_operator::schemars"
        )
    )]
    struct SpecWithCa {
        #[serde(flatten)]
        spec: CertificateRequestSpec,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
    struct StatusWithCa {
        #[serde(flatten)]
        status: CertificateRequestStatus,
        ca: Option<ByteString>,
    }

    fn secret(data: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("secret1".to_string()),
                namespace: Some("ns1".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                [("key".to_string(), ByteString(data.as_bytes().to_vec()))]
                    .into_iter()
                    .collect(),
            ),
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn get_returns_inserted_object() {
        let store = InMemoryStore::new();
        store.insert(secret("value1")).unwrap();

        let key = ObjectRef::<Secret>::new("secret1").within("ns1");
        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.data, secret("value1").data);
        assert!(stored.metadata.resource_version.is_some());

        let other_ns = ObjectRef::<Secret>::new("secret1").within("ns2");
        assert!(store.get(&other_ns).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_status_rejects_outdated_versions() {
        let store = InMemoryStore::new();
        store.insert(secret("value1")).unwrap();
        let key = ObjectRef::<Secret>::new("secret1").within("ns1");

        let first = store.get(&key).await.unwrap().unwrap();
        let second = store.get(&key).await.unwrap().unwrap();
        let updated = store.update_status(&first).await.unwrap();
        assert_ne!(
            updated.metadata.resource_version,
            first.metadata.resource_version
        );
        assert!(matches!(
            store.update_status(&second).await,
            Err(Error::Conflict { .. })
        ));
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn update_status_only_touches_status() {
        let store = InMemoryStore::new();
        store.insert(secret("value1")).unwrap();
        let key = ObjectRef::<Secret>::new("secret1").within("ns1");

        // Secrets have no status, so a status update must leave the data alone
        let mut modified = store.get(&key).await.unwrap().unwrap();
        modified.data = secret("value2").data;
        let updated = store.update_status(&modified).await.unwrap();
        assert_eq!(updated.data, secret("value1").data);
    }

    #[tokio::test]
    async fn update_status_keeps_unknown_status_fields() {
        let store = InMemoryStore::new();
        let mut cr = CertificateRequestWithCa::new(
            "cr1",
            SpecWithCa {
                spec: CertificateRequestSpec {
                    request: ByteString(b"csr".to_vec()),
                    issuer_ref: ObjectReference {
                        name: "issuer1".to_string(),
                        kind: None,
                        group: None,
                    },
                    duration: None,
                    usages: Vec::new(),
                    is_ca: false,
                },
            },
        );
        cr.metadata.namespace = Some("ns1".to_string());
        cr.status = Some(StatusWithCa {
            status: CertificateRequestStatus::default(),
            ca: Some(ByteString(b"ca".to_vec())),
        });
        store.insert(cr).unwrap();

        let key = ObjectRef::<CertificateRequest>::new("cr1").within("ns1");
        let mut narrow = store.get(&key).await.unwrap().unwrap();
        let status = narrow.status.get_or_insert_with(CertificateRequestStatus::default);
        status.certificate = Some(ByteString(b"cert".to_vec()));
        status.set_condition(
            CONDITION_READY,
            ConditionStatus::True,
            "Issued",
            "Signed",
            &k8s_time(time::OffsetDateTime::UNIX_EPOCH),
        );
        store.update_status(&narrow).await.unwrap();

        let wide = store
            .get(&ObjectRef::<CertificateRequestWithCa>::new("cr1").within("ns1"))
            .await
            .unwrap()
            .unwrap()
            .status
            .unwrap();
        assert_eq!(wide.ca, Some(ByteString(b"ca".to_vec())));
        assert_eq!(wide.status.certificate, Some(ByteString(b"cert".to_vec())));
        assert!(wide
            .status
            .has_condition(CONDITION_READY, ConditionStatus::True));
    }

    #[tokio::test]
    async fn update_status_of_missing_object_fails() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.update_status(&secret("value1")).await,
            Err(Error::NotFound { .. })
        ));
    }
}
