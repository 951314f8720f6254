//! Reconcilers for an external cert-manager issuer.
//!
//! [`issuer_controller`] keeps the Ready condition of [`crd::Issuer`] and [`crd::ClusterIssuer`]
//! objects up to date, and [`certificate_request_controller`] signs cert-manager
//! `CertificateRequest`s that refer to them. Watching and work queue management are left to the
//! caller, which feeds object keys into the reconcilers and acts on the returned
//! [`Action`](stackable_operator::kube::runtime::controller::Action).

pub mod certificate_request_controller;
pub mod clock;
pub mod condition;
pub mod config;
pub mod crd;
pub mod error;
pub mod event;
pub mod external_crd;
pub mod issuer_controller;
pub mod signer;
pub mod store;
pub mod utils;

/// API group of the issuer resources, also used to select the `CertificateRequest`s we own.
pub const OPERATOR_NAME: &str = "external-issuer.stackable.tech";
pub const FIELD_MANAGER: &str = "external-issuer-controller";
