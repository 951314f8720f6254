//! CRDs owned by other operators that we consume

pub mod cert_manager;
