//! The issuer resources owned by this operator
//!
//! [`Issuer`] is namespaced and can only be used by `CertificateRequest`s in the same namespace,
//! [`ClusterIssuer`] is cluster-scoped and can be used from any namespace.

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{runtime::reflector::ObjectRef, CustomResource},
    schemars::{self, JsonSchema},
};

use crate::{
    condition::{Condition, ConditionStatus, HasConditions, CONDITION_READY},
    store::StoredResource,
};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "external-issuer.stackable.tech",
    version = "v1alpha1",
    kind = "Issuer",
    namespaced,
    status = "IssuerStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    /// The base URL of the signing service, for example `https://signer.example.com/api`.
    pub url: String,

    /// Name of the Secret containing the credentials for the signing service.
    ///
    /// For an `Issuer` the Secret must be in the same namespace as the `Issuer`. For a
    /// `ClusterIssuer` it is looked up in the cluster resource namespace configured on the
    /// controller (by default the namespace that the controller runs in).
    pub auth_secret_name: String,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "external-issuer.stackable.tech",
    version = "v1alpha1",
    kind = "ClusterIssuer",
    status = "IssuerStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIssuerSpec {
    #[serde(flatten)]
    pub issuer: IssuerSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerStatus {
    /// Contains a single condition of type `Ready`.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasConditions for IssuerStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum IssuerKind {
    Issuer,
    ClusterIssuer,
}

/// Where the credentials Secret of an issuer is looked up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretNamespace {
    /// The namespace of the issuer itself.
    Own,
    /// A fixed namespace, used for cluster-scoped issuers.
    Fixed(String),
}

impl SecretNamespace {
    /// Returns [`None`] if the Secret should be in the issuer's namespace, but it has none.
    pub fn resolve<'a>(&'a self, issuer_namespace: Option<&'a str>) -> Option<&'a str> {
        match self {
            Self::Own => issuer_namespace,
            Self::Fixed(ns) => Some(ns),
        }
    }
}

/// Common view over [`Issuer`] and [`ClusterIssuer`], so that reconcilers only need to be written once.
pub trait IssuerResource: StoredResource {
    const KIND: IssuerKind;

    fn issuer_spec(&self) -> &IssuerSpec;
    fn issuer_status(&self) -> Option<&IssuerStatus>;
    fn issuer_status_mut(&mut self) -> &mut IssuerStatus;

    fn is_ready(&self) -> bool {
        self.issuer_status()
            .is_some_and(|status| status.has_condition(CONDITION_READY, ConditionStatus::True))
    }

    /// The credentials Secret of this issuer, or [`None`] if it can't be located.
    fn credentials_secret(&self, secret_namespace: &SecretNamespace) -> Option<ObjectRef<Secret>> {
        let ns = secret_namespace.resolve(self.meta().namespace.as_deref())?;
        Some(ObjectRef::new(&self.issuer_spec().auth_secret_name).within(ns))
    }
}

impl IssuerResource for Issuer {
    const KIND: IssuerKind = IssuerKind::Issuer;

    fn issuer_spec(&self) -> &IssuerSpec {
        &self.spec
    }

    fn issuer_status(&self) -> Option<&IssuerStatus> {
        self.status.as_ref()
    }

    fn issuer_status_mut(&mut self) -> &mut IssuerStatus {
        self.status.get_or_insert_with(IssuerStatus::default)
    }
}

impl IssuerResource for ClusterIssuer {
    const KIND: IssuerKind = IssuerKind::ClusterIssuer;

    fn issuer_spec(&self) -> &IssuerSpec {
        &self.spec.issuer
    }

    fn issuer_status(&self) -> Option<&IssuerStatus> {
        self.status.as_ref()
    }

    fn issuer_status_mut(&mut self) -> &mut IssuerStatus {
        self.status.get_or_insert_with(IssuerStatus::default)
    }
}

/// The issuer kinds that `CertificateRequest`s may refer to, the API group they belong to, and
/// where their credentials are kept.
///
/// `CertificateRequest`s referring to any other group belong to some other issuer, and are ignored.
#[derive(Clone, Debug)]
pub struct IssuerRegistry {
    group: String,
    kinds: Vec<(IssuerKind, SecretNamespace)>,
}

impl IssuerRegistry {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kinds: Vec::new(),
        }
    }

    /// Registers `kind`, replacing any earlier registration of it.
    pub fn with_kind(mut self, kind: IssuerKind, secret_namespace: SecretNamespace) -> Self {
        self.kinds.retain(|(registered, _)| *registered != kind);
        self.kinds.push((kind, secret_namespace));
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn owns_group(&self, group: Option<&str>) -> bool {
        group == Some(self.group.as_str())
    }

    /// Resolves the `kind` of an issuer reference.
    ///
    /// An empty kind refers to an [`Issuer`], matching cert-manager's defaulting.
    pub fn lookup(&self, kind: Option<&str>) -> Option<(IssuerKind, &SecretNamespace)> {
        let kind = match kind {
            None | Some("") => IssuerKind::Issuer,
            Some(kind) => kind.parse().ok()?,
        };
        self.kinds
            .iter()
            .find(|(registered, _)| *registered == kind)
            .map(|(kind, secret_namespace)| (*kind, secret_namespace))
    }
}
