//! Signing policies decide what a [`CertificateTemplate`] may ask for before it is signed

use std::{cmp::min, fmt::Debug};

use snafu::{OptionExt as _, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;

use super::template::CertificateTemplate;
use crate::utils::{checked_add_duration, checked_sub_duration};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum PolicyError {
    #[snafu(display("unknown key usage {usage:?}"))]
    UnknownUsage { usage: String },

    #[snafu(display("certificate lifetime {lifetime} is out of range"))]
    LifetimeOutOfRange { lifetime: Duration },

    #[snafu(display("backdate {backdate} is out of range"))]
    BackdateOutOfRange { backdate: Duration },
}

/// Key usages, named the way cert-manager names them in `CertificateRequest.spec.usages`.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum KeyUsage {
    #[strum(serialize = "signing")]
    Signing,
    #[strum(serialize = "digital signature")]
    DigitalSignature,
    #[strum(serialize = "content commitment")]
    ContentCommitment,
    #[strum(serialize = "key encipherment")]
    KeyEncipherment,
    #[strum(serialize = "key agreement")]
    KeyAgreement,
    #[strum(serialize = "data encipherment")]
    DataEncipherment,
    #[strum(serialize = "cert sign")]
    CertSign,
    #[strum(serialize = "crl sign")]
    CrlSign,
    #[strum(serialize = "encipher only")]
    EncipherOnly,
    #[strum(serialize = "decipher only")]
    DecipherOnly,
    #[strum(serialize = "any")]
    Any,
    #[strum(serialize = "server auth")]
    ServerAuth,
    #[strum(serialize = "client auth")]
    ClientAuth,
    #[strum(serialize = "code signing")]
    CodeSigning,
    #[strum(serialize = "email protection")]
    EmailProtection,
    #[strum(serialize = "s/mime")]
    Smime,
    #[strum(serialize = "ipsec end system")]
    IpsecEndSystem,
    #[strum(serialize = "ipsec tunnel")]
    IpsecTunnel,
    #[strum(serialize = "ipsec user")]
    IpsecUser,
    #[strum(serialize = "timestamping")]
    Timestamping,
    #[strum(serialize = "ocsp signing")]
    OcspSigning,
    #[strum(serialize = "microsoft sgc")]
    MicrosoftSgc,
    #[strum(serialize = "netscape sgc")]
    NetscapeSgc,
}

impl KeyUsage {
    pub fn parse_all(usages: &[String]) -> Result<Vec<Self>, PolicyError> {
        usages
            .iter()
            .map(|usage| {
                usage
                    .parse()
                    .map_err(|_| PolicyError::UnknownUsage {
                        usage: usage.clone(),
                    })
            })
            .collect()
    }

    /// Whether this usage belongs in the extended key usage extension rather than the key usage extension.
    pub fn is_extended(self) -> bool {
        matches!(
            self,
            Self::Any
                | Self::ServerAuth
                | Self::ClientAuth
                | Self::CodeSigning
                | Self::EmailProtection
                | Self::Smime
                | Self::IpsecEndSystem
                | Self::IpsecTunnel
                | Self::IpsecUser
                | Self::Timestamping
                | Self::OcspSigning
                | Self::MicrosoftSgc
                | Self::NetscapeSgc
        )
    }
}

pub trait SigningPolicy: Debug + Send + Sync {
    /// Rewrites `template` to conform to the policy, or rejects it.
    fn apply(&self, template: &mut CertificateTemplate, now: OffsetDateTime)
        -> Result<(), PolicyError>;
}

/// Signs anything, for a fixed lifetime and with a fixed set of usages.
///
/// A shorter lifetime than `ttl` is honoured if the request asks for one. The issued certificate
/// is never a CA.
#[derive(Clone, Debug)]
pub struct PermissiveSigningPolicy {
    pub ttl: Duration,
    pub usages: Vec<KeyUsage>,
    /// Moves `notBefore` into the past to tolerate clock skew between us and the clients.
    pub backdate: Duration,
}

impl SigningPolicy for PermissiveSigningPolicy {
    fn apply(
        &self,
        template: &mut CertificateTemplate,
        now: OffsetDateTime,
    ) -> Result<(), PolicyError> {
        let ttl = match template.requested_duration {
            Some(requested) => min(requested, self.ttl),
            None => self.ttl,
        };
        use policy_error::*;
        template.usages.clone_from(&self.usages);
        template.is_ca = false;
        template.not_before = Some(
            checked_sub_duration(now, self.backdate).context(BackdateOutOfRangeSnafu {
                backdate: self.backdate,
            })?,
        );
        template.not_after = Some(
            checked_add_duration(now, ttl).context(LifetimeOutOfRangeSnafu { lifetime: ttl })?,
        );
        Ok(())
    }
}

/// Caps the lifetime of the certificate, without otherwise touching the template.
#[derive(Clone, Copy, Debug)]
pub struct MaxTtl(pub Duration);

impl SigningPolicy for MaxTtl {
    fn apply(
        &self,
        template: &mut CertificateTemplate,
        now: OffsetDateTime,
    ) -> Result<(), PolicyError> {
        use policy_error::*;
        let max_not_after =
            checked_add_duration(now, self.0).context(LifetimeOutOfRangeSnafu { lifetime: self.0 })?;
        // A requested lifetime too long to represent is capped like any other
        let not_after = template
            .not_after
            .or_else(|| {
                template
                    .requested_duration
                    .and_then(|requested| checked_add_duration(now, requested))
            })
            .map_or(max_not_after, |not_after| min(not_after, max_not_after));
        template.not_after = Some(not_after);
        Ok(())
    }
}

/// Replaces the requested usages.
#[derive(Clone, Debug)]
pub struct FixedUsages(pub Vec<KeyUsage>);

impl SigningPolicy for FixedUsages {
    fn apply(&self, template: &mut CertificateTemplate, _now: OffsetDateTime) -> Result<(), PolicyError> {
        template.usages.clone_from(&self.0);
        Ok(())
    }
}

/// Applies policies in order, stopping at the first one that rejects the template.
#[derive(Debug, Default)]
pub struct PolicyChain(pub Vec<Box<dyn SigningPolicy>>);

impl PolicyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl SigningPolicy + 'static) -> Self {
        self.0.push(Box::new(policy));
        self
    }
}

impl SigningPolicy for PolicyChain {
    fn apply(
        &self,
        template: &mut CertificateTemplate,
        now: OffsetDateTime,
    ) -> Result<(), PolicyError> {
        for policy in &self.0 {
            policy.apply(template, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::time::Duration;
    use time::OffsetDateTime;

    use super::{
        FixedUsages, KeyUsage, MaxTtl, PermissiveSigningPolicy, PolicyChain, PolicyError,
        SigningPolicy,
    };
    use crate::signer::template::tests::template;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn key_usages_use_cert_manager_names() {
        assert_eq!(
            KeyUsage::parse_all(&["digital signature".to_string(), "server auth".to_string()])
                .unwrap(),
            [KeyUsage::DigitalSignature, KeyUsage::ServerAuth]
        );
        assert_eq!(KeyUsage::CrlSign.to_string(), "crl sign");
        assert!(KeyUsage::ClientAuth.is_extended());
        assert!(!KeyUsage::KeyEncipherment.is_extended());
        assert!(matches!(
            KeyUsage::parse_all(&["teleportation".to_string()]),
            Err(PolicyError::UnknownUsage { usage }) if usage == "teleportation"
        ));
    }

    #[test]
    fn permissive_policy_overrides_request() {
        let mut tmpl = template();
        tmpl.usages = vec![KeyUsage::CertSign];
        tmpl.is_ca = true;
        let policy = PermissiveSigningPolicy {
            ttl: Duration::from_days_unchecked(365),
            usages: vec![KeyUsage::ServerAuth],
            backdate: Duration::from_minutes_unchecked(5),
        };
        policy.apply(&mut tmpl, now()).unwrap();
        assert_eq!(tmpl.usages, [KeyUsage::ServerAuth]);
        assert!(!tmpl.is_ca);
        assert_eq!(
            tmpl.not_before,
            Some(now() - Duration::from_minutes_unchecked(5))
        );
        assert_eq!(
            tmpl.not_after,
            Some(now() + Duration::from_days_unchecked(365))
        );
    }

    #[test]
    fn permissive_policy_honours_shorter_requests() {
        let mut tmpl = template();
        tmpl.requested_duration = Some(Duration::from_hours_unchecked(1));
        let policy = PermissiveSigningPolicy {
            ttl: Duration::from_days_unchecked(365),
            usages: vec![KeyUsage::ServerAuth],
            backdate: Duration::from_minutes_unchecked(5),
        };
        policy.apply(&mut tmpl, now()).unwrap();
        assert_eq!(
            tmpl.not_after,
            Some(now() + Duration::from_hours_unchecked(1))
        );

        tmpl.requested_duration = Some(Duration::from_days_unchecked(1000));
        policy.apply(&mut tmpl, now()).unwrap();
        assert_eq!(
            tmpl.not_after,
            Some(now() + Duration::from_days_unchecked(365))
        );
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let mut tmpl = template();
        let policy = PermissiveSigningPolicy {
            ttl: Duration::from_secs(u64::MAX),
            usages: vec![KeyUsage::ServerAuth],
            backdate: Duration::from_minutes_unchecked(5),
        };
        assert!(matches!(
            policy.apply(&mut tmpl, now()),
            Err(PolicyError::LifetimeOutOfRange { .. })
        ));

        let policy = PermissiveSigningPolicy {
            ttl: Duration::from_days_unchecked(1),
            usages: vec![KeyUsage::ServerAuth],
            backdate: Duration::from_secs(i64::MAX as u64),
        };
        assert!(matches!(
            policy.apply(&mut tmpl, now()),
            Err(PolicyError::BackdateOutOfRange { .. })
        ));

        let mut tmpl = template();
        tmpl.requested_duration = Some(Duration::from_secs(u64::MAX));
        MaxTtl(Duration::from_days_unchecked(30))
            .apply(&mut tmpl, now())
            .unwrap();
        assert_eq!(
            tmpl.not_after,
            Some(now() + Duration::from_days_unchecked(30))
        );
    }

    #[test]
    fn chain_applies_in_order() {
        let mut tmpl = template();
        let chain = PolicyChain::new()
            .with(PermissiveSigningPolicy {
                ttl: Duration::from_days_unchecked(365),
                usages: vec![KeyUsage::ServerAuth],
                backdate: Duration::from_minutes_unchecked(5),
            })
            .with(MaxTtl(Duration::from_days_unchecked(30)))
            .with(FixedUsages(vec![
                KeyUsage::DigitalSignature,
                KeyUsage::ClientAuth,
            ]));
        chain.apply(&mut tmpl, now()).unwrap();
        assert_eq!(
            tmpl.not_after,
            Some(now() + Duration::from_days_unchecked(30))
        );
        assert_eq!(
            tmpl.usages,
            [KeyUsage::DigitalSignature, KeyUsage::ClientAuth]
        );
    }

    #[test]
    fn max_ttl_uses_requested_duration() {
        let mut tmpl = template();
        tmpl.requested_duration = Some(Duration::from_hours_unchecked(2));
        MaxTtl(Duration::from_days_unchecked(1))
            .apply(&mut tmpl, now())
            .unwrap();
        assert_eq!(
            tmpl.not_after,
            Some(now() + Duration::from_hours_unchecked(2))
        );

        let mut tmpl = template();
        MaxTtl(Duration::from_days_unchecked(1))
            .apply(&mut tmpl, now())
            .unwrap();
        assert_eq!(
            tmpl.not_after,
            Some(now() + Duration::from_days_unchecked(1))
        );
    }
}
