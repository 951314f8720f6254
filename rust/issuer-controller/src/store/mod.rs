//! Access to the persisted state of the objects that the reconcilers work on
//!
//! Reconcilers only ever read whole objects and merge into their status, so that is all a
//! [`ResourceStore`] needs to support. [`KubeStore`] talks to the Kubernetes API,
//! [`InMemoryStore`] keeps everything in process.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{ResultExt as _, Snafu};
use stackable_operator::kube::{runtime::reflector::ObjectRef, Resource};

use crate::error::{ClassifiedError, Severity};

mod k8s;
mod memory;

pub use self::{k8s::KubeStore, memory::InMemoryStore};

/// Any object that can be loaded from and persisted into a [`ResourceStore`].
pub trait StoredResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoredResource for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    #[snafu(display("failed to get {object}"))]
    Get {
        source: stackable_operator::kube::Error,
        object: String,
    },

    #[snafu(display("failed to update status of {object}"))]
    UpdateStatus {
        source: stackable_operator::kube::Error,
        object: String,
    },

    #[snafu(display("{object} was modified concurrently"))]
    Conflict { object: String },

    #[snafu(display("{object} does not exist"))]
    NotFound { object: String },

    #[snafu(display("object has no name"))]
    MissingName,

    #[snafu(display("failed to serialize {object}"))]
    Serialize {
        source: serde_json::Error,
        object: String,
    },

    #[snafu(display("failed to deserialize {object}"))]
    Deserialize {
        source: serde_json::Error,
        object: String,
    },
}

impl ClassifiedError for Error {
    fn severity(&self) -> Severity {
        // Every store failure may go away once the cache or the API server catches up
        match self {
            Error::Get { .. } => Severity::Transient,
            Error::UpdateStatus { .. } => Severity::Transient,
            Error::Conflict { .. } => Severity::Transient,
            Error::NotFound { .. } => Severity::Transient,
            Error::MissingName => Severity::Transient,
            Error::Serialize { .. } => Severity::Transient,
            Error::Deserialize { .. } => Severity::Transient,
        }
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Returns [`None`] if the object does not exist.
    async fn get<K: StoredResource>(&self, key: &ObjectRef<K>) -> Result<Option<K>, Error>;

    /// Merges the status of `obj` into the stored status, failing with [`Error::Conflict`] if
    /// `obj` is based on an outdated `resourceVersion`.
    ///
    /// Status fields that `K` does not know about are left untouched. Returns the object as it
    /// was persisted.
    async fn update_status<K: StoredResource>(&self, obj: &K) -> Result<K, Error>;
}

/// Builds the JSON merge patch that writes the status of `obj`, guarded by its `resourceVersion`.
fn status_patch<K: StoredResource>(obj: &K, object: &str) -> Result<serde_json::Value, Error> {
    let mut value = serde_json::to_value(obj).context(SerializeSnafu { object })?;
    let mut patch = serde_json::Map::new();
    if let Some(resource_version) = &obj.meta().resource_version {
        patch.insert(
            "metadata".to_string(),
            serde_json::json!({ "resourceVersion": resource_version }),
        );
    }
    patch.insert(
        "status".to_string(),
        value
            .get_mut("status")
            .map(serde_json::Value::take)
            .unwrap_or_default(),
    );
    Ok(serde_json::Value::Object(patch))
}

/// Applies a JSON merge patch (RFC 7386) to `target`.
///
/// Objects are merged key by key and `null` removes a key. Any other value replaces the old one.
fn merge_patch(target: &mut serde_json::Value, patch: serde_json::Value) {
    let serde_json::Value::Object(patch) = patch else {
        *target = patch;
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let Some(target) = target.as_object_mut() {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(&key);
            } else {
                merge_patch(target.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
    }
}

/// Builds the key of an existing object.
pub fn object_ref<K: StoredResource>(obj: &K) -> Option<ObjectRef<K>> {
    let meta = obj.meta();
    let key = ObjectRef::new(meta.name.as_deref()?);
    Some(match &meta.namespace {
        Some(ns) => key.within(ns),
        None => key,
    })
}
