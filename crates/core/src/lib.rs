pub mod admission;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod gateway;
pub mod health;

pub use admission::{Admission, AdmissionController, AdmissionPermit, AdmissionStats, Ticket};
pub use cache::{CacheInsert, CachePolicy, CacheRule, CacheStats, ResponseCache};
pub use config::{AppConfig, ConfigError, LoadOptions, ProcessRole};
pub use dedup::{DedupStats, DeduplicationBatcher, FlightRole, RequestBody, RequestDescriptor};
pub use errors::{
    CacheError, GatewayError, InterfaceError, OriginError, RejectReason, RestartSuppressed,
};
pub use gateway::{Gateway, GatewayResponse, OriginFetcher, OriginResponse, ResponseSource};
pub use health::{HealthStats, HealthSupervisor, RestartReason, RestartRecord, SupervisorState};
