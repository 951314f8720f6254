//! The certificate that a `CertificateRequest` asks for, before a [`SigningPolicy`](super::policy::SigningPolicy) has had its say

use std::{net::IpAddr, str::FromStr};

use openssl::{
    pkey::{PKey, Public},
    x509::{X509Name, X509Req},
};
use snafu::{ResultExt as _, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;
use yasna::{models::ObjectIdentifier, ASN1Error, ASN1ErrorKind, BERReader, Tag};

use super::{
    policy::{KeyUsage, PolicyError},
    SigningRequest,
};
use crate::error::{ClassifiedError, Severity};

/// PKCS#9 `extensionRequest`, carries the extensions that the requester would like to have
const OID_EXTENSION_REQUEST: &[u64] = &[1, 2, 840, 113549, 1, 9, 14];
const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum TemplateError {
    #[snafu(display("failed to parse certificate signing request"))]
    ParseCsr { source: openssl::error::ErrorStack },

    #[snafu(display("failed to read subject of certificate signing request"))]
    ReadSubject { source: openssl::error::ErrorStack },

    #[snafu(display("failed to read public key of certificate signing request"))]
    ReadPublicKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to verify signature of certificate signing request"))]
    VerifySignature { source: openssl::error::ErrorStack },

    #[snafu(display("certificate signing request is not signed by its own key"))]
    InvalidSignature,

    #[snafu(display("failed to parse extensions of certificate signing request"))]
    ParseExtensions { source: ASN1Error },

    #[snafu(display("invalid requested duration {duration:?}"))]
    InvalidDuration {
        source: <Duration as FromStr>::Err,
        duration: String,
    },

    #[snafu(display("invalid requested usages"))]
    InvalidUsages { source: PolicyError },
}

impl ClassifiedError for TemplateError {
    fn severity(&self) -> Severity {
        // The request itself is broken, only a new request can fix that
        Severity::Permanent
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
    Email(String),
    Uri(String),
}

#[derive(Debug)]
pub struct CertificateTemplate {
    pub subject: X509Name,
    pub public_key: PKey<Public>,
    pub subject_alt_names: Vec<SubjectAltName>,
    pub requested_duration: Option<Duration>,
    pub usages: Vec<KeyUsage>,
    pub is_ca: bool,
    /// Defaults to the moment of signing (minus the CA's backdate) if unset.
    pub not_before: Option<OffsetDateTime>,
    /// Defaults to the CA's own expiry if unset.
    pub not_after: Option<OffsetDateTime>,
}

impl CertificateTemplate {
    pub fn from_request(request: &SigningRequest) -> Result<Self, TemplateError> {
        use template_error::*;
        let mut template = Self::from_csr_pem(&request.csr_pem)?;
        template.requested_duration = request
            .duration
            .as_deref()
            .map(|duration| {
                duration
                    .parse::<Duration>()
                    .context(InvalidDurationSnafu { duration })
            })
            .transpose()?;
        template.usages = KeyUsage::parse_all(&request.usages).context(InvalidUsagesSnafu)?;
        template.is_ca = request.is_ca;
        Ok(template)
    }

    /// Parses a PEM encoded PKCS#10 certificate signing request, verifying that it is signed by
    /// the key that it requests a certificate for.
    pub fn from_csr_pem(pem: &[u8]) -> Result<Self, TemplateError> {
        use template_error::*;
        let csr = X509Req::from_pem(pem).context(ParseCsrSnafu)?;
        let public_key = csr.public_key().context(ReadPublicKeySnafu)?;
        if !csr.verify(&public_key).context(VerifySignatureSnafu)? {
            return InvalidSignatureSnafu.fail();
        }
        let subject_alt_names =
            parse_subject_alt_names(&csr.to_der().context(ParseCsrSnafu)?)
                .context(ParseExtensionsSnafu)?;
        Ok(Self {
            subject: csr.subject_name().to_owned().context(ReadSubjectSnafu)?,
            public_key,
            subject_alt_names,
            requested_duration: None,
            usages: Vec::new(),
            is_ca: false,
            not_before: None,
            not_after: None,
        })
    }
}

/// Reads the subject alternative names out of the `extensionRequest` attribute of a DER encoded CSR.
///
/// OpenSSL can build SAN extensions but not read them back out of a request, so the relevant
/// parts of the request are parsed by hand.
fn parse_subject_alt_names(csr_der: &[u8]) -> Result<Vec<SubjectAltName>, ASN1Error> {
    let oid_extension_request = ObjectIdentifier::from_slice(OID_EXTENSION_REQUEST);
    let oid_subject_alt_name = ObjectIdentifier::from_slice(OID_SUBJECT_ALT_NAME);

    let attributes = yasna::parse_ber(csr_der, |r| {
        r.read_sequence(|r| {
            let attributes = r.next().read_sequence(|r| {
                // version, subject, subjectPKInfo
                for _ in 0..3 {
                    r.next().read_der()?;
                }
                r.read_optional(|r| {
                    r.read_tagged_implicit(Tag::context(0), |r| r.collect_set_of(parse_attribute))
                })
            })?;
            // signatureAlgorithm, signature
            r.next().read_der()?;
            r.next().read_der()?;
            Ok(attributes.unwrap_or_default())
        })
    })?;

    let mut names = Vec::new();
    for (_, values) in attributes
        .iter()
        .filter(|(oid, _)| *oid == oid_extension_request)
    {
        for value in values {
            let extensions = yasna::parse_ber(value, |r| r.collect_sequence_of(parse_extension))?;
            for (_, value) in extensions
                .iter()
                .filter(|(oid, _)| *oid == oid_subject_alt_name)
            {
                names.extend(yasna::parse_ber(value, |r| {
                    r.collect_sequence_of(parse_general_name)
                })?);
            }
        }
    }
    Ok(names.into_iter().flatten().collect())
}

fn parse_attribute(r: BERReader) -> Result<(ObjectIdentifier, Vec<Vec<u8>>), ASN1Error> {
    r.read_sequence(|r| {
        let oid = r.next().read_oid()?;
        let values = r.next().collect_set_of(|r| r.read_der())?;
        Ok((oid, values))
    })
}

fn parse_extension(r: BERReader) -> Result<(ObjectIdentifier, Vec<u8>), ASN1Error> {
    r.read_sequence(|r| {
        let oid = r.next().read_oid()?;
        let _critical = r.read_optional(|r| r.read_bool())?;
        let value = r.next().read_bytes()?;
        Ok((oid, value))
    })
}

/// Returns [`None`] for name types that we don't issue certificates for (such as `directoryName`).
fn parse_general_name(r: BERReader) -> Result<Option<SubjectAltName>, ASN1Error> {
    let tagged = r.read_tagged_der()?;
    let value = tagged.value();
    let string = || {
        String::from_utf8(value.to_vec()).map_err(|_| ASN1Error::new(ASN1ErrorKind::Invalid))
    };
    let tag = tagged.tag();
    Ok(Some(if tag == Tag::context(1) {
        SubjectAltName::Email(string()?)
    } else if tag == Tag::context(2) {
        SubjectAltName::Dns(string()?)
    } else if tag == Tag::context(6) {
        SubjectAltName::Uri(string()?)
    } else if tag == Tag::context(7) {
        if let Ok(octets) = <[u8; 4]>::try_from(value) {
            SubjectAltName::Ip(IpAddr::from(octets))
        } else if let Ok(octets) = <[u8; 16]>::try_from(value) {
            SubjectAltName::Ip(IpAddr::from(octets))
        } else {
            return Err(ASN1Error::new(ASN1ErrorKind::Invalid));
        }
    } else {
        return Ok(None);
    }))
}
