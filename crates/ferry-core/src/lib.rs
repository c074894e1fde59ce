pub mod aggregator;
pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod errors;
pub mod job;
pub mod orchestrator;
pub mod process;
pub mod stats;
pub mod transcript;

pub use aggregator::{FileSlot, GlobalProgress, ProgressAggregator, SlotState, Snapshot};
pub use cancel::{CancellationController, TerminationReason};
pub use cleanup::{CleanupPolicy, CleanupPrompt, CleanupReport, Disposition, PartialFileCandidate};
pub use config::EngineConfig;
pub use errors::{FailureReason, LaunchError, ProcessFailure};
pub use job::{JobId, JobKind, Location, SourceItem, TransferJob};
pub use orchestrator::{CancelReport, JobHandle, JobOutcome, JobSummary, Orchestrator};
