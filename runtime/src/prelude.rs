//! Convenience re-exports for code that extends the runtime
//!
//! ```rust
//! use edgeproxy_runtime::prelude::*;
//! ```

// Records and the stage protocol
pub use edgeproxy_core::{collect, Event, EventStage, EventType, StageError, VecStage};

// Stage building blocks
pub use edgeproxy_gateway::stage::{
    AnonymizeStage, Anonymizer, BoxedStage, EchoStage, EnrichStage, Enricher, EventSelector,
    ExtractStage, MetricsExtractor, SchemaRegistry, SchemaStage, SelectorConfig, SelectorStage,
    SequenceManager, StageChain, StageFactory,
};

// Delivery
pub use edgeproxy_gateway::{
    BrokerTransport, Delivery, DeliveryError, KafkaProxy, ProxyError, Transport,
};

// Runtime
pub use crate::server::AppState;
pub use crate::{run, RuntimeBuilder};
