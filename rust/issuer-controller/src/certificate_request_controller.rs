//! Signs cert-manager `CertificateRequest`s that refer to one of our issuers

use std::sync::Arc;

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::Time, ByteString},
    kube::{
        core::DynamicObject,
        runtime::{controller, reflector::ObjectRef},
        Resource,
    },
    logging::controller::ReconcilerError,
    time::Duration,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use time::OffsetDateTime;

use crate::{
    clock::{Clock, SystemClock},
    condition::{
        ConditionStatus, HasConditions, CONDITION_APPROVED, CONDITION_DENIED, CONDITION_READY,
    },
    config::{self, ControllerOptions},
    crd::{
        ClusterIssuer, Issuer, IssuerKind, IssuerRegistry, IssuerResource, IssuerSpec,
        SecretNamespace,
    },
    error::{severity_of, BoxedError, ClassifiedError, Severity},
    event::{EventSink, EventType, ReconcileEvent},
    external_crd::cert_manager::{CertificateRequest, CertificateRequestStatus},
    signer::{SignerBuilder, SigningRequest},
    store::{self, ResourceStore},
    utils::{checked_add_duration, error_full_message, k8s_time, Unloggable},
};

pub const CONTROLLER_NAME: &str = "certificaterequest";

/// Reason of all events published by this reconciler.
pub const EVENT_REASON: &str = "CertificateRequestReconciler";

pub const REASON_PENDING: &str = "Pending";
pub const REASON_ISSUED: &str = "Issued";
pub const REASON_DENIED: &str = "Denied";
pub const REASON_FAILED: &str = "Failed";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get {certificate_request}"))]
    GetCertificateRequest {
        source: store::Error,
        certificate_request: ObjectRef<DynamicObject>,
    },

    #[snafu(display("unknown issuer kind {kind:?} in group {group:?}"))]
    UnknownIssuerKind { kind: String, group: String },

    #[snafu(display("{kind} {name:?} can't be resolved for a CertificateRequest without a namespace"))]
    NoIssuerNamespace { kind: IssuerKind, name: String },

    #[snafu(display("failed to get {issuer}"))]
    GetIssuer {
        source: store::Error,
        issuer: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{issuer} does not exist"))]
    IssuerNotFound { issuer: ObjectRef<DynamicObject> },

    #[snafu(display("{issuer} is not ready"))]
    IssuerNotReady { issuer: ObjectRef<DynamicObject> },

    #[snafu(display("The CertificateRequest was denied by an approval controller"))]
    Denied,

    #[snafu(display("{issuer} has no namespace to look up its credentials Secret in"))]
    NoSecretNamespace { issuer: ObjectRef<DynamicObject> },

    #[snafu(display("failed to get credentials {secret}"))]
    GetSecret {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("credentials {secret} does not exist"))]
    SecretNotFound { secret: ObjectRef<Secret> },

    #[snafu(display("failed to build signer"))]
    BuildSigner { source: BoxedError },

    #[snafu(display("failed to sign certificate"))]
    Sign { source: BoxedError },

    #[snafu(display("giving up, the CertificateRequest is older than {max_retry_duration}"))]
    RetriesExhausted {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
        max_retry_duration: Duration,
    },

    #[snafu(display("failed to update status of {certificate_request}"))]
    UpdateStatus {
        source: store::Error,
        certificate_request: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to update status of {certificate_request} after: {reconcile_error}"))]
    CommitStatus {
        source: store::Error,
        certificate_request: ObjectRef<DynamicObject>,
        reconcile_error: Box<Error>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetCertificateRequest { .. } => None,
            Error::UnknownIssuerKind { .. } => None,
            Error::NoIssuerNamespace { .. } => None,
            Error::GetIssuer { issuer, .. } => Some(issuer.clone()),
            Error::IssuerNotFound { issuer } => Some(issuer.clone()),
            Error::IssuerNotReady { issuer } => Some(issuer.clone()),
            Error::Denied => None,
            Error::NoSecretNamespace { issuer } => Some(issuer.clone()),
            Error::GetSecret { secret, .. } => Some(secret.clone().erase()),
            Error::SecretNotFound { secret } => Some(secret.clone().erase()),
            Error::BuildSigner { .. } => None,
            Error::Sign { .. } => None,
            Error::RetriesExhausted { source, .. } => source.secondary_object(),
            Error::UpdateStatus { .. } => None,
            Error::CommitStatus {
                reconcile_error, ..
            } => reconcile_error.secondary_object(),
        }
    }
}

impl ClassifiedError for Error {
    fn severity(&self) -> Severity {
        match self {
            Error::GetCertificateRequest { .. } => Severity::Transient,
            Error::UnknownIssuerKind { .. } => Severity::Permanent,
            Error::NoIssuerNamespace { .. } => Severity::Permanent,
            Error::GetIssuer { .. } => Severity::Transient,
            Error::IssuerNotFound { .. } => Severity::Transient,
            Error::IssuerNotReady { .. } => Severity::Transient,
            Error::Denied => Severity::Permanent,
            Error::NoSecretNamespace { .. } => Severity::Permanent,
            Error::GetSecret { .. } => Severity::Transient,
            Error::SecretNotFound { .. } => Severity::Transient,
            Error::BuildSigner { source } => severity_of(source.as_ref()),
            Error::Sign { source } => severity_of(source.as_ref()),
            Error::RetriesExhausted { .. } => Severity::Permanent,
            Error::UpdateStatus { .. } => Severity::Transient,
            Error::CommitStatus { .. } => Severity::Transient,
        }
    }
}

/// What the issuer referenced by a `CertificateRequest` has to say about it.
struct ResolvedIssuer {
    key: ObjectRef<DynamicObject>,
    spec: IssuerSpec,
    ready: bool,
    secret: Option<ObjectRef<Secret>>,
}

/// Reconciles `CertificateRequest`s, backed by the store `S`.
pub struct CertificateRequestReconciler<S> {
    store: Arc<S>,
    events: Arc<dyn EventSink>,
    signers: Arc<dyn SignerBuilder>,
    issuers: IssuerRegistry,
    max_retry_duration: Duration,
    check_approved: bool,
    clock: Arc<dyn Clock>,
}

impl<S: ResourceStore> CertificateRequestReconciler<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn EventSink>,
        signers: Arc<dyn SignerBuilder>,
        issuers: IssuerRegistry,
    ) -> Self {
        Self {
            store,
            events,
            signers,
            issuers,
            max_retry_duration: Duration::from_minutes_unchecked(1),
            check_approved: true,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_options(
        store: Arc<S>,
        events: Arc<dyn EventSink>,
        signers: Arc<dyn SignerBuilder>,
        options: &ControllerOptions,
    ) -> Result<Self, config::Error> {
        Ok(Self::new(store, events, signers, options.issuer_registry()?)
            .with_max_retry_duration(options.max_retry_duration)
            .with_approved_check(!options.disable_approved_check))
    }

    pub fn with_max_retry_duration(mut self, max_retry_duration: Duration) -> Self {
        self.max_retry_duration = max_retry_duration;
        self
    }

    /// Whether requests must be approved before they are signed.
    pub fn with_approved_check(mut self, check_approved: bool) -> Self {
        self.check_approved = check_approved;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Moves the `CertificateRequest` `key` one step closer to being issued.
    ///
    /// Requests for other issuers, and requests that have already been issued or have failed
    /// permanently, are left alone. Nothing is written until all external calls have returned,
    /// so dropping the returned future leaves the request untouched.
    #[tracing::instrument(skip_all, fields(certificate_request = %key))]
    pub async fn reconcile(
        &self,
        key: &ObjectRef<CertificateRequest>,
    ) -> Result<controller::Action> {
        let cr_ref = key.clone().erase();
        let Some(mut cr) =
            self.store
                .get(key)
                .await
                .context(GetCertificateRequestSnafu {
                    certificate_request: cr_ref.clone(),
                })?
        else {
            tracing::debug!("certificate request no longer exists, ignoring");
            return Ok(controller::Action::await_change());
        };

        let issuer_ref = &cr.spec.issuer_ref;
        if !self.issuers.owns_group(issuer_ref.group.as_deref()) {
            tracing::debug!(
                issuer.group = ?issuer_ref.group,
                "certificate request belongs to a foreign issuer, ignoring"
            );
            return Ok(controller::Action::await_change());
        }

        let old_status = cr.status.clone();
        let status = old_status.clone().unwrap_or_default();
        if status.has_condition(CONDITION_READY, ConditionStatus::True) {
            tracing::debug!("certificate request has already been issued, ignoring");
            return Ok(controller::Action::await_change());
        }
        if status.failure_time.is_some() {
            tracing::debug!("certificate request has failed permanently, ignoring");
            return Ok(controller::Action::await_change());
        }

        let now = self.clock.now();
        if status.condition(CONDITION_READY).is_none() {
            cr.status_or_default().set_condition(
                CONDITION_READY,
                ConditionStatus::Unknown,
                REASON_PENDING,
                "Initialising",
                &k8s_time(now),
            );
            self.commit(&cr, old_status.as_ref(), EventType::Normal, None)
                .await
                .context(UpdateStatusSnafu {
                    certificate_request: cr_ref,
                })?;
            return Ok(controller::Action::await_change());
        }

        let result = match self.issue(&cr, now).await {
            Ok(None) => {
                tracing::debug!("certificate request has not been approved yet, waiting");
                return Ok(controller::Action::await_change());
            }
            Ok(Some(certificate)) => Ok(certificate),
            Err(err) => Err(err),
        };

        let (event_type, note) = self.apply(cr.status_or_default(), &result, now);
        let committed = self.commit(&cr, old_status.as_ref(), event_type, note).await;
        match (result, committed) {
            (Ok(_), Ok(())) => {
                tracing::info!("certificate issued");
                Ok(controller::Action::await_change())
            }
            (Ok(_), Err(source)) => Err(source).context(UpdateStatusSnafu {
                certificate_request: cr_ref,
            }),
            (Err(err), Ok(())) if err.is_permanent() => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "certificate request failed permanently"
                );
                Ok(controller::Action::await_change())
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(source)) => Err(source).context(CommitStatusSnafu {
                certificate_request: cr_ref,
                reconcile_error: Box::new(err),
            }),
        }
    }

    /// Returns the signed certificate, or [`None`] if the request is still waiting for approval.
    async fn issue(
        &self,
        cr: &CertificateRequest,
        now: OffsetDateTime,
    ) -> Result<Option<Vec<u8>>> {
        let issuer_ref = &cr.spec.issuer_ref;
        let (kind, secret_namespace) =
            self.issuers
                .lookup(issuer_ref.kind.as_deref())
                .context(UnknownIssuerKindSnafu {
                    kind: issuer_ref.kind.clone().unwrap_or_default(),
                    group: self.issuers.group(),
                })?;
        let issuer = match kind {
            IssuerKind::Issuer => {
                let ns = cr
                    .metadata
                    .namespace
                    .as_deref()
                    .context(NoIssuerNamespaceSnafu {
                        kind,
                        name: &issuer_ref.name,
                    })?;
                let key = ObjectRef::<Issuer>::new(&issuer_ref.name).within(ns);
                self.get_issuer(key, secret_namespace).await?
            }
            IssuerKind::ClusterIssuer => {
                let key = ObjectRef::<ClusterIssuer>::new(&issuer_ref.name);
                self.get_issuer(key, secret_namespace).await?
            }
        };
        if !issuer.ready {
            return IssuerNotReadySnafu { issuer: issuer.key }.fail();
        }

        if self.check_approved {
            let is_true = |type_: &str| {
                cr.status
                    .as_ref()
                    .is_some_and(|status| status.has_condition(type_, ConditionStatus::True))
            };
            if is_true(CONDITION_DENIED) {
                return DeniedSnafu.fail();
            }
            if !is_true(CONDITION_APPROVED) {
                return Ok(None);
            }
        }

        let secret_ref = issuer
            .secret
            .context(NoSecretNamespaceSnafu { issuer: issuer.key })?;
        let secret = self
            .store
            .get(&secret_ref)
            .await
            .context(GetSecretSnafu {
                secret: secret_ref.clone(),
            })?
            .context(SecretNotFoundSnafu { secret: secret_ref })?;
        let secret_data = Unloggable(secret.data.unwrap_or_default());

        let request = SigningRequest {
            csr_pem: cr.spec.request.0.clone(),
            duration: cr.spec.duration.clone(),
            usages: cr.spec.usages.clone(),
            is_ca: cr.spec.is_ca,
        };
        let signed = async {
            let signer = self
                .signers
                .build(&issuer.spec, &secret_data)
                .context(BuildSignerSnafu)?;
            signer.sign(&request).await.context(SignSnafu)
        }
        .await;
        match signed {
            Ok(certificate) => Ok(Some(certificate)),
            Err(err) if !err.is_permanent() && self.retries_exhausted(cr, now) => {
                Err(err).context(RetriesExhaustedSnafu {
                    max_retry_duration: self.max_retry_duration,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn get_issuer<I: IssuerResource>(
        &self,
        key: ObjectRef<I>,
        secret_namespace: &SecretNamespace,
    ) -> Result<ResolvedIssuer> {
        let issuer = self
            .store
            .get(&key)
            .await
            .context(GetIssuerSnafu {
                issuer: key.clone().erase(),
            })?
            .context(IssuerNotFoundSnafu {
                issuer: key.clone().erase(),
            })?;
        Ok(ResolvedIssuer {
            key: key.erase(),
            spec: issuer.issuer_spec().clone(),
            ready: issuer.is_ready(),
            secret: issuer.credentials_secret(secret_namespace),
        })
    }

    /// A deadline beyond what [`OffsetDateTime`] can represent is never reached.
    fn retries_exhausted(&self, cr: &CertificateRequest, now: OffsetDateTime) -> bool {
        cr.metadata
            .creation_timestamp
            .as_ref()
            .and_then(|Time(created)| OffsetDateTime::from_unix_timestamp(created.timestamp()).ok())
            .and_then(|created| checked_add_duration(created, self.max_retry_duration))
            .is_some_and(|deadline| deadline < now)
    }

    /// Records the outcome of [`Self::issue`] in `status`, returning the type of event that
    /// describes it and, for failures that will be retried, the note to publish in place of the
    /// `Ready` message.
    fn apply(
        &self,
        status: &mut CertificateRequestStatus,
        result: &Result<Vec<u8>>,
        now: OffsetDateTime,
    ) -> (EventType, Option<String>) {
        let now = k8s_time(now);
        match result {
            Ok(certificate) => {
                status.certificate = Some(ByteString(certificate.clone()));
                status.set_condition(
                    CONDITION_READY,
                    ConditionStatus::True,
                    REASON_ISSUED,
                    "Signed",
                    &now,
                );
                (EventType::Normal, None)
            }
            Err(err) if err.is_permanent() => {
                let (reason, event_type) = match err {
                    Error::Denied => (REASON_DENIED, EventType::Normal),
                    _ => (REASON_FAILED, EventType::Warning),
                };
                status.set_condition(
                    CONDITION_READY,
                    ConditionStatus::False,
                    reason,
                    error_full_message(err),
                    &now,
                );
                status.failure_time.get_or_insert(now);
                (event_type, None)
            }
            Err(err) => {
                let message = error_full_message(err);
                let note = format!("Temporary error. Retrying: {message}");
                status.set_condition(
                    CONDITION_READY,
                    ConditionStatus::False,
                    REASON_PENDING,
                    message,
                    &now,
                );
                (EventType::Warning, Some(note))
            }
        }
    }

    /// Persists the status of `cr` if it differs from `old_status`, and publishes an event if that
    /// moved the `Ready` condition to a new status or reason.
    ///
    /// The event carries `note`, falling back to the `Ready` message.
    async fn commit(
        &self,
        cr: &CertificateRequest,
        old_status: Option<&CertificateRequestStatus>,
        event_type: EventType,
        note: Option<String>,
    ) -> Result<(), store::Error> {
        let new_status = cr.status.as_ref();
        if new_status == old_status {
            return Ok(());
        }
        self.store.update_status(cr).await?;

        let old_ready = old_status.and_then(|status| status.condition(CONDITION_READY));
        let new_ready = new_status.and_then(|status| status.condition(CONDITION_READY));
        if let Some(ready) = new_ready.filter(|ready| ready.transitions_from(old_ready)) {
            tracing::info!(
                ready.status = %ready.status,
                ready.reason = ?ready.reason,
                "certificate request changed state"
            );
            self.events
                .publish(
                    &cr.object_ref(&()),
                    ReconcileEvent {
                        event_type,
                        reason: EVENT_REASON.to_string(),
                        message: note
                            .or_else(|| ready.message.clone())
                            .unwrap_or_default(),
                    },
                )
                .await;
        }
        Ok(())
    }
}

trait CertificateRequestExt {
    fn status_or_default(&mut self) -> &mut CertificateRequestStatus;
}

impl CertificateRequestExt for CertificateRequest {
    fn status_or_default(&mut self) -> &mut CertificateRequestStatus {
        self.status.get_or_insert_with(CertificateRequestStatus::default)
    }
}
