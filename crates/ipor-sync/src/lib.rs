//! Reconciliation engines and the jobs that drive them: field merging,
//! duplicate detection and resolution, notification cycles, ingest runs,
//! reports and scheduling.

pub mod config;
pub mod cycle;
pub mod dedup;
pub mod digest;
pub mod merge;
pub mod notify;
pub mod pipeline;
pub mod reports;
pub mod resolve;
pub mod scheduler;
pub mod transport;

pub use config::{load_field_aliases, SyncConfig, DEFAULT_INGEST_CRON, DEFAULT_NOTIFY_CRON};
pub use cycle::{CycleSummary, DeliveryOutcome, NotificationCycle};
pub use dedup::{similarity_ratio, DetectorConfig, DuplicateDetector, DEFAULT_DUPLICATE_THRESHOLD};
pub use digest::{DigestBuilder, OutgoingMessage, Sentiment};
pub use merge::FieldMergeEngine;
pub use notify::{evaluate, Cadence, Decision, DigestContent, Section};
pub use pipeline::{IngestPipeline, IngestRunSummary, SourceRunStats};
pub use reports::recent_runs_markdown;
pub use resolve::{AutoMergePolicy, EntityMergeResolver, MergeOutcome, ResolveError};
pub use scheduler::{maybe_build_scheduler, ScheduledServices};
pub use transport::{DeliveryError, OutboxTransport, Transport};

pub const CRATE_NAME: &str = "ipor-sync";
