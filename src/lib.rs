// Prompt gateway core
// Quota-gated access to a generative backend with streamed payload extraction

pub mod api;
pub mod clock;
pub mod config;
pub mod errors;
pub mod filter;
pub mod gateway;
pub mod models;
pub mod registry;
pub mod security;
pub mod store;

// Re-export commonly used items
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use errors::{KeyError, StoreError};
pub use filter::{FilterOutcome, TagBoundaryFilter, TagScanner, END_TAG, START_TAG};
pub use gateway::{CompletionBackend, Gateway, GatewayError};
pub use models::{Activation, ApiKeyRecord, KeyInfo, KeyStatus, KeyUpdate, UsageInfo};
pub use registry::{ApiKeyRegistry, QuotaPolicy};
pub use store::{MemoryQuotaStore, QuotaStore, RedisQuotaStore, SqliteQuotaStore};
