//! A certificate authority that signs [`CertificateTemplate`]s with a locally held key

use std::{cmp::min, collections::BTreeMap, sync::Arc};

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{Id, PKey, Private},
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage as KeyUsageExt,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509Extension, X509,
    },
};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{k8s_openapi::ByteString, time::Duration};
use time::OffsetDateTime;

use super::{
    policy::{KeyUsage, PolicyError, SigningPolicy},
    template::{CertificateTemplate, SubjectAltName},
};
use crate::{
    clock::{Clock, SystemClock},
    error::{ClassifiedError, Severity},
    utils::{asn1time_to_offsetdatetime, checked_sub_duration, Asn1TimeParseError, Unloggable},
};

pub const SECRET_KEY_CERT: &str = "tls.crt";
pub const SECRET_KEY_KEY: &str = "tls.key";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the signer has expired: NotAfter={not_after}"))]
    SignerExpired { not_after: OffsetDateTime },

    #[snafu(display("backdate {backdate} is out of range"))]
    BackdateOutOfRange { backdate: Duration },

    #[snafu(display("the request was rejected by the signing policy"))]
    Policy { source: PolicyError },

    #[snafu(display("refusing to sign a certificate that expired in the past"))]
    ExpiredInThePast,

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: ErrorStack },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: ErrorStack },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifiedError for Error {
    fn severity(&self) -> Severity {
        // Signing is deterministic apart from the clock, so retrying the same template won't help
        match self {
            Error::SignerExpired { .. } => Severity::Permanent,
            Error::BackdateOutOfRange { .. } => Severity::Permanent,
            Error::Policy { .. } => Severity::Permanent,
            Error::ExpiredInThePast => Severity::Permanent,
            Error::BuildCertificate { .. } => Severity::Permanent,
            Error::SerializeCertificate { .. } => Severity::Transient,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum LoadError {
    #[snafu(display("CA secret is missing required key {key:?}"))]
    MissingKey { key: String },

    #[snafu(display("failed to load CA certificate"))]
    LoadCertificate { source: ErrorStack },

    #[snafu(display("failed to load CA private key"))]
    LoadPrivateKey { source: ErrorStack },

    #[snafu(display("failed to parse CA lifetime"))]
    ParseLifetime { source: Asn1TimeParseError },

    #[snafu(display("failed to compare CA private key with certificate"))]
    CompareKeys { source: ErrorStack },

    #[snafu(display("CA private key does not belong to the CA certificate"))]
    KeyMismatch,
}

impl ClassifiedError for LoadError {
    fn severity(&self) -> Severity {
        // The credentials Secret may still be in the process of being written
        match self {
            LoadError::MissingKey { .. } => Severity::Transient,
            LoadError::LoadCertificate { .. } => Severity::Transient,
            LoadError::LoadPrivateKey { .. } => Severity::Transient,
            LoadError::ParseLifetime { .. } => Severity::Transient,
            LoadError::CompareKeys { .. } => Severity::Transient,
            LoadError::KeyMismatch => Severity::Transient,
        }
    }
}

#[derive(Debug)]
pub struct CertificateAuthority {
    certificate: X509,
    private_key: Unloggable<PKey<Private>>,
    not_after: OffsetDateTime,
    backdate: Duration,
    clock: Arc<dyn Clock>,
}

impl CertificateAuthority {
    pub fn new(certificate: X509, private_key: PKey<Private>) -> Result<Self, LoadError> {
        use load_error::*;
        if !certificate
            .public_key()
            .context(CompareKeysSnafu)?
            .public_eq(&private_key)
        {
            return KeyMismatchSnafu.fail();
        }
        Ok(Self {
            not_after: asn1time_to_offsetdatetime(certificate.not_after())
                .context(ParseLifetimeSnafu)?,
            certificate,
            private_key: Unloggable(private_key),
            backdate: Duration::from_secs(0),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn from_pem(certificate_pem: &[u8], private_key_pem: &[u8]) -> Result<Self, LoadError> {
        use load_error::*;
        Self::new(
            X509::from_pem(certificate_pem).context(LoadCertificateSnafu)?,
            PKey::private_key_from_pem(private_key_pem).context(LoadPrivateKeySnafu)?,
        )
    }

    /// Loads the CA from a `kubernetes.io/tls` style Secret.
    pub fn from_secret_data(data: &BTreeMap<String, ByteString>) -> Result<Self, LoadError> {
        use load_error::*;
        let get = |key: &str| {
            data.get(key)
                .map(|value| value.0.as_slice())
                .context(MissingKeySnafu { key })
        };
        Self::from_pem(get(SECRET_KEY_CERT)?, get(SECRET_KEY_KEY)?)
    }

    /// Moves the `notBefore` of issued certificates into the past, to tolerate clock skew.
    pub fn with_backdate(mut self, backdate: Duration) -> Self {
        self.backdate = backdate;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Signs `template` after applying `policy` to it, returning the DER encoded certificate.
    ///
    /// The issued certificate never outlives the CA itself.
    pub fn sign(
        &self,
        mut template: CertificateTemplate,
        policy: &dyn SigningPolicy,
    ) -> Result<Vec<u8>> {
        let now = self.clock.now();
        let not_before =
            checked_sub_duration(now, self.backdate).context(BackdateOutOfRangeSnafu {
                backdate: self.backdate,
            })?;
        if not_before >= self.not_after {
            return SignerExpiredSnafu {
                not_after: self.not_after,
            }
            .fail();
        }
        template.not_before = Some(not_before);

        policy.apply(&mut template, now).context(PolicySnafu)?;

        let not_before = template.not_before.unwrap_or(not_before);
        let not_after = template
            .not_after
            .map_or(self.not_after, |not_after| min(not_after, self.not_after));
        if now >= self.not_after {
            return ExpiredInThePastSnafu.fail();
        }

        let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
        let digest = match self.private_key.id() {
            Id::ED25519 | Id::ED448 => MessageDigest::null(),
            _ => MessageDigest::sha256(),
        };
        let certificate = X509Builder::new()
            .and_then(|mut x509| {
                x509.set_subject_name(&template.subject)?;
                x509.set_issuer_name(self.certificate.subject_name())?;
                x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
                x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
                x509.set_pubkey(&template.public_key)?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let mut serial = BigNum::new()?;
                serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
                x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
                let ctx = x509.x509v3_context(Some(&self.certificate), Some(&conf));
                let mut basic_constraints = BasicConstraints::new();
                basic_constraints.critical();
                if template.is_ca {
                    basic_constraints.ca();
                }
                let mut exts = vec![basic_constraints.build()?];
                exts.extend(usage_extensions(&template.usages)?);
                exts.push(SubjectKeyIdentifier::new().build(&ctx)?);
                exts.push(
                    AuthorityKeyIdentifier::new()
                        .keyid(false)
                        .issuer(false)
                        .build(&ctx)?,
                );
                if !template.subject_alt_names.is_empty() {
                    let mut san_ext = SubjectAlternativeName::new();
                    // Without a subject the SANs are the only identity of the certificate
                    if template.subject.entries().next().is_none() {
                        san_ext.critical();
                    }
                    for san in &template.subject_alt_names {
                        match san {
                            SubjectAltName::Dns(dns) => san_ext.dns(dns),
                            SubjectAltName::Ip(ip) => san_ext.ip(&ip.to_string()),
                            SubjectAltName::Email(email) => san_ext.email(email),
                            SubjectAltName::Uri(uri) => san_ext.uri(uri),
                        };
                    }
                    exts.push(san_ext.build(&ctx)?);
                }
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&*self.private_key, digest)?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();
        certificate.to_der().context(SerializeCertificateSnafu)
    }
}

fn usage_extensions(usages: &[KeyUsage]) -> Result<Vec<X509Extension>, ErrorStack> {
    let mut key_usage = KeyUsageExt::new();
    key_usage.critical();
    let mut extended_key_usage = ExtendedKeyUsage::new();
    for usage in usages {
        match usage {
            KeyUsage::Signing | KeyUsage::DigitalSignature => {
                key_usage.digital_signature();
            }
            KeyUsage::ContentCommitment => {
                key_usage.non_repudiation();
            }
            KeyUsage::KeyEncipherment => {
                key_usage.key_encipherment();
            }
            KeyUsage::KeyAgreement => {
                key_usage.key_agreement();
            }
            KeyUsage::DataEncipherment => {
                key_usage.data_encipherment();
            }
            KeyUsage::CertSign => {
                key_usage.key_cert_sign();
            }
            KeyUsage::CrlSign => {
                key_usage.crl_sign();
            }
            KeyUsage::EncipherOnly => {
                key_usage.encipher_only();
            }
            KeyUsage::DecipherOnly => {
                key_usage.decipher_only();
            }
            KeyUsage::Any => {
                extended_key_usage.other("anyExtendedKeyUsage");
            }
            KeyUsage::ServerAuth => {
                extended_key_usage.server_auth();
            }
            KeyUsage::ClientAuth => {
                extended_key_usage.client_auth();
            }
            KeyUsage::CodeSigning => {
                extended_key_usage.code_signing();
            }
            KeyUsage::EmailProtection | KeyUsage::Smime => {
                extended_key_usage.email_protection();
            }
            KeyUsage::IpsecEndSystem => {
                extended_key_usage.other("ipsecEndSystem");
            }
            KeyUsage::IpsecTunnel => {
                extended_key_usage.other("ipsecTunnel");
            }
            KeyUsage::IpsecUser => {
                extended_key_usage.other("ipsecUser");
            }
            KeyUsage::Timestamping => {
                extended_key_usage.time_stamping();
            }
            KeyUsage::OcspSigning => {
                extended_key_usage.other("OCSPSigning");
            }
            KeyUsage::MicrosoftSgc => {
                extended_key_usage.ms_sgc();
            }
            KeyUsage::NetscapeSgc => {
                extended_key_usage.ns_sgc();
            }
        }
    }
    let mut exts = Vec::new();
    if usages.iter().any(|usage| !usage.is_extended()) {
        exts.push(key_usage.build()?);
    }
    if usages.iter().any(|usage| usage.is_extended()) {
        exts.push(extended_key_usage.build()?);
    }
    Ok(exts)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    };

    use openssl::{
        asn1::{Asn1Integer, Asn1Time},
        bn::BigNum,
        conf::{Conf, ConfMethod},
        hash::MessageDigest,
        nid::Nid,
        pkey::{Id, PKey, Private},
        x509::{
            extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier},
            X509Builder, X509NameBuilder, X509,
        },
    };
    use stackable_operator::{k8s_openapi::ByteString, time::Duration};
    use time::OffsetDateTime;

    use super::{CertificateAuthority, Error, LoadError, SECRET_KEY_CERT, SECRET_KEY_KEY};
    use crate::{
        clock::FixedClock,
        error::ClassifiedError,
        signer::{
            policy::{self, PermissiveSigningPolicy},
            template::{
                tests::{csr_pem, generate_key},
                CertificateTemplate,
            },
        },
        utils::asn1time_to_offsetdatetime,
    };

    pub fn self_signed_ca(
        key: &PKey<Private>,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, "external-issuer test CA")
            .unwrap();
        let name = name.build();
        let conf = Conf::new(ConfMethod::default()).unwrap();
        let mut x509 = X509Builder::new().unwrap();
        x509.set_subject_name(&name).unwrap();
        x509.set_issuer_name(&name).unwrap();
        x509.set_not_before(&Asn1Time::from_unix(not_before.unix_timestamp()).unwrap())
            .unwrap();
        x509.set_not_after(&Asn1Time::from_unix(not_after.unix_timestamp()).unwrap())
            .unwrap();
        x509.set_pubkey(key).unwrap();
        x509.set_version(2).unwrap();
        x509.set_serial_number(&Asn1Integer::from_bn(&BigNum::from_u32(1).unwrap()).unwrap())
            .unwrap();
        let ski = SubjectKeyIdentifier::new()
            .build(&x509.x509v3_context(None, Some(&conf)))
            .unwrap();
        x509.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        x509.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
        x509.append_extension(ski).unwrap();
        let digest = match key.id() {
            Id::ED25519 => MessageDigest::null(),
            _ => MessageDigest::sha256(),
        };
        x509.sign(key, digest).unwrap();
        x509.build()
    }

    pub fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    /// A CA that is valid from a day before [`now`] until `lifetime` after it.
    pub fn test_ca(lifetime: Duration) -> (CertificateAuthority, PKey<Private>) {
        let key = generate_key();
        let cert = self_signed_ca(&key, now() - Duration::from_days_unchecked(1), now() + lifetime);
        let ca = CertificateAuthority::new(cert, key.clone())
            .unwrap()
            .with_clock(Arc::new(FixedClock(now())));
        (ca, key)
    }

    fn policy() -> PermissiveSigningPolicy {
        PermissiveSigningPolicy {
            ttl: Duration::from_days_unchecked(30),
            usages: vec![policy::KeyUsage::ServerAuth],
            backdate: Duration::from_minutes_unchecked(5),
        }
    }

    fn template() -> CertificateTemplate {
        CertificateTemplate::from_csr_pem(&csr_pem(&generate_key(), "example.com", &["example.com"]))
            .unwrap()
    }

    #[test]
    fn signs_certificate() {
        let (ca, ca_key) = test_ca(Duration::from_days_unchecked(365));
        let der = ca.sign(template(), &policy()).unwrap();
        let cert = X509::from_der(&der).unwrap();
        assert!(cert.verify(&ca_key).unwrap());
        assert_eq!(
            cert.issuer_name().to_der().unwrap(),
            ca.certificate().subject_name().to_der().unwrap()
        );
        assert_eq!(
            asn1time_to_offsetdatetime(cert.not_before()).unwrap(),
            now() - Duration::from_minutes_unchecked(5)
        );
        assert_eq!(
            asn1time_to_offsetdatetime(cert.not_after()).unwrap(),
            now() + Duration::from_days_unchecked(30)
        );
        let sans = cert.subject_alt_names().unwrap();
        assert_eq!(sans.len(), 2);
        assert_eq!(sans.get(0).unwrap().dnsname(), Some("example.com"));
        assert_eq!(sans.get(1).unwrap().ipaddress(), Some(&[10, 0, 0, 1][..]));
    }

    #[test]
    fn certificate_never_outlives_ca() {
        let (ca, _) = test_ca(Duration::from_days_unchecked(1));
        let der = ca.sign(template(), &policy()).unwrap();
        let cert = X509::from_der(&der).unwrap();
        assert_eq!(
            asn1time_to_offsetdatetime(cert.not_after()).unwrap(),
            ca.not_after()
        );
    }

    #[test]
    fn refuses_to_sign_after_ca_expiry() {
        let (ca, _) = test_ca(Duration::from_days_unchecked(1));
        let expiry = ca.not_after();

        // notBefore is still before the CA expiry, but now isn't
        let backdated = ca
            .with_backdate(Duration::from_minutes_unchecked(5))
            .with_clock(Arc::new(FixedClock(expiry)));
        let err = backdated.sign(template(), &policy()).unwrap_err();
        assert!(matches!(err, Error::ExpiredInThePast));
        assert_eq!(
            err.to_string(),
            "refusing to sign a certificate that expired in the past"
        );
        assert!(err.is_permanent());

        let (ca, _) = test_ca(Duration::from_days_unchecked(1));
        let not_backdated = ca.with_clock(Arc::new(FixedClock(expiry + Duration::from_secs(1))));
        let err = not_backdated.sign(template(), &policy()).unwrap_err();
        assert!(matches!(err, Error::SignerExpired { .. }));
        assert!(err.to_string().starts_with("the signer has expired"));
    }

    #[test]
    fn signs_with_ed25519_ca() {
        let key = PKey::generate_ed25519().unwrap();
        let cert = self_signed_ca(&key, now(), now() + Duration::from_days_unchecked(10));
        let ca = CertificateAuthority::new(cert, key.clone())
            .unwrap()
            .with_clock(Arc::new(FixedClock(now())));
        let der = ca.sign(template(), &policy()).unwrap();
        assert!(X509::from_der(&der).unwrap().verify(&key).unwrap());
    }

    #[test]
    fn shared_ca_signs_from_many_threads() {
        let (ca, ca_key) = test_ca(Duration::from_days_unchecked(365));
        let ca = Arc::new(ca);
        let certs = std::thread::scope(|scope| {
            let signers = (0..8)
                .map(|_| {
                    let ca = ca.clone();
                    scope.spawn(move || {
                        (0..4)
                            .map(|_| ca.sign(template(), &policy()).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            signers
                .into_iter()
                .flat_map(|signer| signer.join().unwrap())
                .map(|der| X509::from_der(&der).unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(certs.len(), 32);
        for cert in &certs {
            assert!(cert.verify(&ca_key).unwrap());
            assert_eq!(
                cert.issuer_name().to_der().unwrap(),
                ca.certificate().subject_name().to_der().unwrap()
            );
        }
        let serials = certs
            .iter()
            .map(|cert| cert.serial_number().to_bn().unwrap().to_vec())
            .collect::<BTreeSet<_>>();
        assert_eq!(serials.len(), certs.len());
    }

    #[test]
    fn out_of_range_backdate_is_rejected() {
        let (ca, _) = test_ca(Duration::from_days_unchecked(1));
        let ca = ca.with_backdate(Duration::from_secs(u64::MAX));
        let err = ca.sign(template(), &policy()).unwrap_err();
        assert!(matches!(err, Error::BackdateOutOfRange { .. }));
        assert!(err.is_permanent());
    }

    #[test]
    fn loads_from_secret_data() {
        let key = generate_key();
        let cert = self_signed_ca(&key, now(), now() + Duration::from_days_unchecked(10));
        let mut data = BTreeMap::from([
            (
                SECRET_KEY_CERT.to_string(),
                ByteString(cert.to_pem().unwrap()),
            ),
            (
                SECRET_KEY_KEY.to_string(),
                ByteString(key.private_key_to_pem_pkcs8().unwrap()),
            ),
        ]);
        let ca = CertificateAuthority::from_secret_data(&data).unwrap();
        assert_eq!(ca.not_after(), now() + Duration::from_days_unchecked(10));

        data.insert(
            SECRET_KEY_KEY.to_string(),
            ByteString(generate_key().private_key_to_pem_pkcs8().unwrap()),
        );
        assert!(matches!(
            CertificateAuthority::from_secret_data(&data),
            Err(LoadError::KeyMismatch)
        ));

        data.remove(SECRET_KEY_CERT);
        assert!(matches!(
            CertificateAuthority::from_secret_data(&data),
            Err(LoadError::MissingKey { key }) if key == SECRET_KEY_CERT
        ));
    }
}
