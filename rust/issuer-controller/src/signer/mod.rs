//! The seam between the reconcilers and whatever actually signs certificates
//!
//! Signers and health checkers are built fresh for each reconcile from the issuer's spec and the
//! contents of its credentials Secret, so they pick up credential rotations without any caching.

use std::collections::BTreeMap;

use async_trait::async_trait;
use stackable_operator::k8s_openapi::ByteString;

use crate::{crd::IssuerSpec, error::BoxedError, utils::Unloggable};

pub mod ca;
pub mod example;
pub mod policy;
pub mod template;

/// Contents of an issuer's credentials Secret.
pub type SecretData = Unloggable<BTreeMap<String, ByteString>>;

/// Everything a signer needs to know about a `CertificateRequest`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequest {
    /// PEM encoded PKCS#10 certificate signing request.
    pub csr_pem: Vec<u8>,
    /// Requested lifetime, if any.
    pub duration: Option<String>,
    pub usages: Vec<String>,
    pub is_ca: bool,
}

/// Signs certificates. Errors are retried unless they are wrapped in a
/// [`PermanentError`](crate::error::PermanentError).
#[async_trait]
pub trait Signer: Send + Sync {
    /// Returns the PEM encoded certificate chain, leaf first.
    async fn sign(&self, request: &SigningRequest) -> Result<Vec<u8>, BoxedError>;
}

/// Checks whether an issuer is able to sign certificates.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self) -> Result<(), BoxedError>;
}

pub trait SignerBuilder: Send + Sync {
    fn build(&self, spec: &IssuerSpec, secret: &SecretData) -> Result<Box<dyn Signer>, BoxedError>;
}

impl<F> SignerBuilder for F
where
    F: Fn(&IssuerSpec, &SecretData) -> Result<Box<dyn Signer>, BoxedError> + Send + Sync,
{
    fn build(&self, spec: &IssuerSpec, secret: &SecretData) -> Result<Box<dyn Signer>, BoxedError> {
        self(spec, secret)
    }
}

pub trait HealthCheckerBuilder: Send + Sync {
    fn build(
        &self,
        spec: &IssuerSpec,
        secret: &SecretData,
    ) -> Result<Box<dyn HealthChecker>, BoxedError>;
}

impl<F> HealthCheckerBuilder for F
where
    F: Fn(&IssuerSpec, &SecretData) -> Result<Box<dyn HealthChecker>, BoxedError> + Send + Sync,
{
    fn build(
        &self,
        spec: &IssuerSpec,
        secret: &SecretData,
    ) -> Result<Box<dyn HealthChecker>, BoxedError> {
        self(spec, secret)
    }
}
