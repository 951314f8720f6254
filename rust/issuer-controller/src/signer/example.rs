//! A [`Signer`] that signs with a CA key pair kept in the issuer's credentials Secret
//!
//! The Secret must contain `tls.crt` and `tls.key`, in the format used by `kubernetes.io/tls`
//! Secrets. This is mostly useful for testing and as a starting point for real integrations.

use std::sync::Arc;

use async_trait::async_trait;
use openssl::{error::ErrorStack, x509::X509};
use snafu::{ResultExt as _, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;

use super::{
    ca::{self, CertificateAuthority},
    policy::{KeyUsage, PermissiveSigningPolicy},
    template::{CertificateTemplate, TemplateError},
    HealthChecker, HealthCheckerBuilder, SecretData, Signer, SignerBuilder, SigningRequest,
};
use crate::{
    clock::{Clock, SystemClock},
    crd::IssuerSpec,
    error::{into_boxed, BoxedError, ClassifiedError, Severity},
};

pub const DEFAULT_CERTIFICATE_LIFETIME: Duration = Duration::from_days_unchecked(365);
pub const DEFAULT_BACKDATE: Duration = Duration::from_minutes_unchecked(5);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load CA from issuer credentials"))]
    LoadCa { source: ca::LoadError },

    #[snafu(display("invalid certificate request"))]
    InvalidRequest { source: TemplateError },

    #[snafu(display("failed to sign certificate"))]
    Sign { source: ca::Error },

    #[snafu(display("failed to encode certificate"))]
    EncodeCertificate { source: ErrorStack },

    #[snafu(display("CA expired at {not_after}"))]
    CaExpired { not_after: OffsetDateTime },
}

impl ClassifiedError for Error {
    fn severity(&self) -> Severity {
        match self {
            Error::LoadCa { source } => source.severity(),
            Error::InvalidRequest { source } => source.severity(),
            Error::Sign { source } => source.severity(),
            Error::EncodeCertificate { .. } => Severity::Transient,
            Error::CaExpired { .. } => Severity::Transient,
        }
    }
}

/// Builds [`CaSigner`]s and health checkers for them.
#[derive(Debug, Clone)]
pub struct CaSignerBuilder {
    pub certificate_lifetime: Duration,
    pub usages: Vec<KeyUsage>,
    pub backdate: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for CaSignerBuilder {
    fn default() -> Self {
        Self {
            certificate_lifetime: DEFAULT_CERTIFICATE_LIFETIME,
            usages: vec![KeyUsage::ServerAuth],
            backdate: DEFAULT_BACKDATE,
            clock: Arc::new(SystemClock),
        }
    }
}

impl CaSignerBuilder {
    fn load_ca(&self, secret: &SecretData) -> Result<CertificateAuthority, Error> {
        Ok(CertificateAuthority::from_secret_data(secret)
            .context(LoadCaSnafu)?
            .with_backdate(self.backdate)
            .with_clock(self.clock.clone()))
    }
}

impl SignerBuilder for CaSignerBuilder {
    fn build(&self, _spec: &IssuerSpec, secret: &SecretData) -> Result<Box<dyn Signer>, BoxedError> {
        Ok(Box::new(CaSigner {
            ca: self.load_ca(secret).map_err(into_boxed)?,
            policy: PermissiveSigningPolicy {
                ttl: self.certificate_lifetime,
                usages: self.usages.clone(),
                backdate: self.backdate,
            },
        }))
    }
}

impl HealthCheckerBuilder for CaSignerBuilder {
    fn build(
        &self,
        _spec: &IssuerSpec,
        secret: &SecretData,
    ) -> Result<Box<dyn HealthChecker>, BoxedError> {
        Ok(Box::new(CaHealthChecker {
            ca: self.load_ca(secret).map_err(into_boxed)?,
            clock: self.clock.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct CaSigner {
    ca: CertificateAuthority,
    policy: PermissiveSigningPolicy,
}

impl CaSigner {
    fn sign_pem(&self, request: &SigningRequest) -> Result<Vec<u8>, Error> {
        let template = CertificateTemplate::from_request(request).context(InvalidRequestSnafu)?;
        let der = self.ca.sign(template, &self.policy).context(SignSnafu)?;
        X509::from_der(&der)
            .and_then(|cert| cert.to_pem())
            .context(EncodeCertificateSnafu)
    }
}

#[async_trait]
impl Signer for CaSigner {
    async fn sign(&self, request: &SigningRequest) -> Result<Vec<u8>, BoxedError> {
        self.sign_pem(request).map_err(into_boxed)
    }
}

/// Reports an issuer as healthy as long as its CA is loadable and not expired.
#[derive(Debug)]
pub struct CaHealthChecker {
    ca: CertificateAuthority,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl HealthChecker for CaHealthChecker {
    async fn check(&self) -> Result<(), BoxedError> {
        let not_after = self.ca.not_after();
        if self.clock.now() >= not_after {
            return Err(into_boxed(Error::CaExpired { not_after }));
        }
        Ok(())
    }
}
