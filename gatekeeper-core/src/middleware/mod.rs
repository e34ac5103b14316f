//! Cross-cutting HTTP middleware: request tracking, resilience

pub mod request_tracking;

#[cfg(feature = "resilience")]
pub mod resilience;

pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};

#[cfg(feature = "resilience")]
pub use resilience::ResilienceConfig;
