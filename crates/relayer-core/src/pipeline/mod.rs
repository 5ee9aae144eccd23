//! Staged-Forward Pipeline: acquire media into a session's self-chat scratch
//! (Stage 1), regroup and distribute to every destination (Stage 2), then
//! reclaim scratch (Stage 3).

pub mod batch;
pub mod scratch;
pub mod stage1;
pub mod stage2;
pub mod stage3;
pub mod state_machine;

pub use batch::{regroup, regroup_with_cap, SendBatch, SEND_BATCH_CAP};
pub use scratch::{ScratchHandle, ScratchTable, ScratchUnit};
pub use stage1::{acquire, AcquisitionOutcome, AcquiredUnit, SELF_CHAT};
pub use stage2::distribute_and_send;
pub use stage3::{cleanup, emergency_cleanup};
pub use state_machine::PipelineState;
