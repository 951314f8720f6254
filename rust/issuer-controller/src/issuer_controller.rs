//! Keeps the `Ready` condition of [`Issuer`](crate::crd::Issuer)s and
//! [`ClusterIssuer`](crate::crd::ClusterIssuer)s in line with the health of their signers

use std::{marker::PhantomData, sync::Arc};

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        core::DynamicObject,
        runtime::{controller, reflector::ObjectRef},
    },
    logging::controller::ReconcilerError,
    time::Duration,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    clock::{Clock, SystemClock},
    condition::{ConditionStatus, HasConditions, CONDITION_READY},
    config::{self, ControllerOptions},
    crd::{IssuerResource, IssuerStatus, SecretNamespace},
    error::{severity_of, BoxedError, ClassifiedError, Severity},
    event::{EventSink, EventType, ReconcileEvent},
    signer::HealthCheckerBuilder,
    store::{self, ResourceStore},
    utils::{error_full_message, k8s_time, Unloggable},
};

pub const CONTROLLER_NAME: &str = "issuer";

/// Reason of all events published by this reconciler.
pub const EVENT_REASON: &str = "IssuerReconciler";
/// Reason of all `Ready` conditions set by this reconciler.
pub const CONDITION_REASON: &str = "external-issuer.IssuerReconciler.Reconcile";

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_minutes_unchecked(1);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get {issuer}"))]
    GetIssuer {
        source: store::Error,
        issuer: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{issuer} has no namespace to look up its credentials Secret in"))]
    NoSecretNamespace { issuer: ObjectRef<DynamicObject> },

    #[snafu(display("failed to get credentials {secret}"))]
    GetSecret {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("credentials {secret} does not exist"))]
    SecretNotFound { secret: ObjectRef<Secret> },

    #[snafu(display("failed to build health checker"))]
    BuildHealthChecker { source: BoxedError },

    #[snafu(display("health check failed"))]
    HealthCheck { source: BoxedError },

    #[snafu(display("failed to update status of {issuer}"))]
    UpdateStatus {
        source: store::Error,
        issuer: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to update status of {issuer} after: {reconcile_error}"))]
    CommitStatus {
        source: store::Error,
        issuer: ObjectRef<DynamicObject>,
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
            Error::GetIssuer { .. } => None,
            Error::NoSecretNamespace { .. } => None,
            Error::GetSecret { secret, .. } => Some(secret.clone().erase()),
            Error::SecretNotFound { secret } => Some(secret.clone().erase()),
            Error::BuildHealthChecker { .. } => None,
            Error::HealthCheck { .. } => None,
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
            Error::GetIssuer { .. } => Severity::Transient,
            // Only a namespaced issuer can end up without a namespace, which is never going to change
            Error::NoSecretNamespace { .. } => Severity::Permanent,
            // The Secret may still be created
            Error::GetSecret { .. } => Severity::Transient,
            Error::SecretNotFound { .. } => Severity::Transient,
            Error::BuildHealthChecker { source } => severity_of(source.as_ref()),
            Error::HealthCheck { source } => severity_of(source.as_ref()),
            Error::UpdateStatus { .. } => Severity::Transient,
            Error::CommitStatus { .. } => Severity::Transient,
        }
    }
}

/// Reconciles issuers of kind `I`, backed by the store `S`.
pub struct IssuerReconciler<I, S> {
    store: Arc<S>,
    events: Arc<dyn EventSink>,
    health_checkers: Arc<dyn HealthCheckerBuilder>,
    secret_namespace: SecretNamespace,
    health_check_interval: Duration,
    clock: Arc<dyn Clock>,
    issuer: PhantomData<fn() -> I>,
}

impl<I: IssuerResource, S: ResourceStore> IssuerReconciler<I, S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn EventSink>,
        health_checkers: Arc<dyn HealthCheckerBuilder>,
        secret_namespace: SecretNamespace,
    ) -> Self {
        Self {
            store,
            events,
            health_checkers,
            secret_namespace,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            clock: Arc::new(SystemClock),
            issuer: PhantomData,
        }
    }

    pub fn from_options(
        store: Arc<S>,
        events: Arc<dyn EventSink>,
        health_checkers: Arc<dyn HealthCheckerBuilder>,
        options: &ControllerOptions,
    ) -> Result<Self, config::Error> {
        Ok(Self::new(
            store,
            events,
            health_checkers,
            options.secret_namespace(I::KIND)?,
        )
        .with_health_check_interval(options.health_check_interval))
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Checks the health of the issuer `key`, and records the outcome in its `Ready` condition.
    ///
    /// Healthy issuers are checked again after the health check interval. Issuers that have never
    /// been seen before only get their `Ready` condition initialized, the status update triggers
    /// the actual check.
    #[tracing::instrument(skip_all, fields(issuer = %key))]
    pub async fn reconcile(&self, key: &ObjectRef<I>) -> Result<controller::Action> {
        let issuer_ref = key.clone().erase();
        let Some(mut issuer) = self
            .store
            .get(key)
            .await
            .context(GetIssuerSnafu {
                issuer: issuer_ref.clone(),
            })?
        else {
            tracing::debug!("issuer no longer exists, ignoring");
            return Ok(controller::Action::await_change());
        };
        let now = k8s_time(self.clock.now());
        let old_status = issuer.issuer_status().cloned();

        if old_status
            .as_ref()
            .and_then(|status| status.condition(CONDITION_READY))
            .is_none()
        {
            issuer.issuer_status_mut().set_condition(
                CONDITION_READY,
                ConditionStatus::Unknown,
                CONDITION_REASON,
                "First seen",
                &now,
            );
            self.commit(&issuer, old_status.as_ref(), EventType::Normal)
                .await
                .context(UpdateStatusSnafu { issuer: issuer_ref })?;
            return Ok(controller::Action::await_change());
        }

        let result = self.check(&issuer).await;
        let (status, message, event_type) = match &result {
            Ok(()) => (ConditionStatus::True, "Success".to_string(), EventType::Normal),
            Err(err) => (
                ConditionStatus::False,
                error_full_message(err),
                EventType::Warning,
            ),
        };
        issuer
            .issuer_status_mut()
            .set_condition(CONDITION_READY, status, CONDITION_REASON, message, &now);
        let committed = self.commit(&issuer, old_status.as_ref(), event_type).await;

        match (result, committed) {
            (Ok(()), Ok(())) => Ok(controller::Action::requeue(*self.health_check_interval)),
            (Ok(()), Err(source)) => Err(source).context(UpdateStatusSnafu { issuer: issuer_ref }),
            (Err(err), Ok(())) if err.is_permanent() => {
                tracing::info!(
                    error = &err as &dyn std::error::Error,
                    "issuer is not healthy, and won't be retried until it is changed"
                );
                Ok(controller::Action::await_change())
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(source)) => Err(source).context(CommitStatusSnafu {
                issuer: issuer_ref,
                reconcile_error: Box::new(err),
            }),
        }
    }

    async fn check(&self, issuer: &I) -> Result<()> {
        let secret_ref =
            issuer
                .credentials_secret(&self.secret_namespace)
                .context(NoSecretNamespaceSnafu {
                    issuer: ObjectRef::from_obj(issuer).erase(),
                })?;
        let secret = self
            .store
            .get(&secret_ref)
            .await
            .context(GetSecretSnafu {
                secret: secret_ref.clone(),
            })?
            .context(SecretNotFoundSnafu { secret: secret_ref })?;
        let secret_data = Unloggable(secret.data.unwrap_or_default());
        let checker = self
            .health_checkers
            .build(issuer.issuer_spec(), &secret_data)
            .context(BuildHealthCheckerSnafu)?;
        checker.check().await.context(HealthCheckSnafu)
    }

    /// Persists the status of `issuer` if it differs from `old_status`, and publishes an event if
    /// that moved the `Ready` condition to a new status or reason.
    async fn commit(
        &self,
        issuer: &I,
        old_status: Option<&IssuerStatus>,
        event_type: EventType,
    ) -> Result<(), store::Error> {
        let new_status = issuer.issuer_status();
        if new_status == old_status {
            return Ok(());
        }
        self.store.update_status(issuer).await?;

        let old_ready = old_status.and_then(|status| status.condition(CONDITION_READY));
        let new_ready = new_status.and_then(|status| status.condition(CONDITION_READY));
        if let Some(ready) = new_ready.filter(|ready| ready.transitions_from(old_ready)) {
            self.events
                .publish(
                    &issuer.object_ref(&()),
                    ReconcileEvent {
                        event_type,
                        reason: EVENT_REASON.to_string(),
                        message: ready.message.clone().unwrap_or_default(),
                    },
                )
                .await;
        }
        Ok(())
    }
}
