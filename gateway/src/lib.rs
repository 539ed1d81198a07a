//! edgeproxy-gateway - Decoding, transforms and delivery to the broker gateway
//!
//! A request body flows through one pull-based chain:
//!
//! ```text
//! Decoder ──► Stages (selector, anonymize, ...) ──► KafkaProxy ──► Transport
//!                                                   (breaker)     (gRPC | HTTP)
//! ```
//!
//! - [`decode`]: byte stream to offset-tracked records
//! - [`gzip`]: inflating body reader with a byte count and MD5
//! - [`stage`]: transforms, each wrapping its upstream
//! - [`proxy`]: topic admission and the circuit breaker
//! - [`transport`]: streaming gRPC and request/response HTTP delivery

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

pub mod config;
pub mod decode;
pub mod error;
pub mod gzip;
pub mod metrics;
pub mod proxy;
pub mod stage;
pub mod transport;

/// Types generated from ambassador/v1/ambassador.proto
pub mod proto {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::derive_partial_eq_without_eq)]
    #![allow(missing_docs)]

    include!("proto/ambassador.v1.rs");

    pub use kafka_ambassador_client::KafkaAmbassadorClient;
    pub use kafka_ambassador_server::{KafkaAmbassador, KafkaAmbassadorServer};
}

pub use config::{Config, FileConfig, ProxyConfig, StagesConfig, TopicConfig, TransportConfig};
pub use decode::{Decoder, DecoderOptions};
pub use edgeproxy_core::{collect, Event, EventStage, EventType, StageError, VecStage};
pub use error::{ProxyError, Result};
pub use gzip::{BodyDigest, GzipHashReader};
pub use metrics::ProxyMetrics;
pub use proxy::{
    BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, KafkaProxy, Permit,
};
pub use stage::{BoxedStage, ConfiguredStages, EventSelector, SelectorConfig, StageChain, StageFactory};
pub use transport::{BrokerTransport, Delivery, DeliveryError, GrpcTransport, HttpTransport, Transport};
