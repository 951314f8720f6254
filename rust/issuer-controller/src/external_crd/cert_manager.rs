//! CRDs owned by [cert-manager](https://cert-manager.io/), see [their API docs](https://cert-manager.io/docs/reference/api-docs/).

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, ByteString},
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

use crate::condition::{Condition, HasConditions};

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequest>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
    namespaced,
    status = "CertificateRequestStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM encoded PKCS#10 certificate signing request.
    pub request: ByteString,
    pub issuer_ref: ObjectReference,
    /// Requested lifetime of the certificate, in Go duration syntax (`"2160h"`).
    pub duration: Option<String>,
    #[serde(default)]
    pub usages: Vec<String>,
    #[serde(default, rename = "isCA")]
    pub is_ca: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// PEM encoded signed certificate, only set once the request has been issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<Time>,
}

impl HasConditions for CertificateRequestStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.ObjectReference>.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    pub kind: Option<String>,
    pub group: Option<String>,
}
