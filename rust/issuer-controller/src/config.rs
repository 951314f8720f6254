use std::path::{Path, PathBuf};

use snafu::{ResultExt as _, Snafu};
use stackable_operator::time::Duration;

use crate::{
    crd::{IssuerKind, IssuerRegistry, SecretNamespace},
    OPERATOR_NAME,
};

/// Where Kubernetes mounts the namespace of the Pod's service account.
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "failed to read the controller's namespace from {path:?}, set --cluster-resource-namespace when running outside of Kubernetes"
    ))]
    NotInCluster {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("{path:?} does not contain a namespace"))]
    EmptyNamespace { path: PathBuf },
}

#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Namespace that the credentials Secrets of ClusterIssuers are read from.
    ///
    /// Defaults to the namespace that the controller is running in.
    #[arg(long, env)]
    pub cluster_resource_namespace: Option<String>,

    /// Signing failures are retried until the CertificateRequest is this old, after that they are
    /// considered permanent.
    #[arg(long, env, default_value = "1m")]
    pub max_retry_duration: Duration,

    /// Sign CertificateRequests without waiting for them to be approved.
    #[arg(long, env)]
    pub disable_approved_check: bool,

    /// How often the health of ready issuers is checked again.
    #[arg(long, env, default_value = "1m")]
    pub health_check_interval: Duration,
}

impl ControllerOptions {
    /// Resolves `--cluster-resource-namespace`, falling back to the namespace of the controller's service account.
    pub fn cluster_resource_namespace(&self) -> Result<String, Error> {
        match &self.cluster_resource_namespace {
            Some(ns) => Ok(ns.clone()),
            None => namespace_from_file(Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE)),
        }
    }

    /// Where the credentials Secrets of issuers of `kind` are kept.
    ///
    /// Only cluster-scoped issuers need the cluster resource namespace to be resolvable.
    pub fn secret_namespace(&self, kind: IssuerKind) -> Result<SecretNamespace, Error> {
        Ok(match kind {
            IssuerKind::Issuer => SecretNamespace::Own,
            IssuerKind::ClusterIssuer => SecretNamespace::Fixed(self.cluster_resource_namespace()?),
        })
    }

    /// Registers both issuer kinds of this operator.
    pub fn issuer_registry(&self) -> Result<IssuerRegistry, Error> {
        Ok(IssuerRegistry::new(OPERATOR_NAME)
            .with_kind(
                IssuerKind::Issuer,
                self.secret_namespace(IssuerKind::Issuer)?,
            )
            .with_kind(
                IssuerKind::ClusterIssuer,
                self.secret_namespace(IssuerKind::ClusterIssuer)?,
            ))
    }
}

pub fn namespace_from_file(path: &Path) -> Result<String, Error> {
    let ns = std::fs::read_to_string(path).context(NotInClusterSnafu { path })?;
    let ns = ns.trim();
    if ns.is_empty() {
        return EmptyNamespaceSnafu { path }.fail();
    }
    Ok(ns.to_string())
}
