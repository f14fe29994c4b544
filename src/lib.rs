/// Polaris ID - client-side identity resolution & synchronization engine
///
/// Derives a persistent pseudonymous identifier for a browser, decides
/// whether a round trip to the identity-resolution server is required,
/// reconciles the response with locally persisted state, and delivers
/// exactly one identity result within a bounded time budget.

pub mod config;
pub mod consent;
pub mod crypto;
pub mod error;
pub mod hints;
pub mod identity;
pub mod storage;
pub mod sync;

pub use config::{EngineConfig, PartnerConfig};
pub use consent::{ConsentSnapshot, ConsentSource, StaticConsent};
pub use error::{EngineError, EngineResult};
pub use hints::HintsProvider;
pub use identity::{Cohort, Engine, Resolution, ResolvedIdentity};
pub use storage::{Backend, DualStore, StoreConfig};
pub use sync::{HttpTransport, SyncResponse, Transport};
