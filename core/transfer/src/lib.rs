//! Placement and execution of uploads across accounts.
//!
//! [`plan`] decides which account receives which file. The
//! [`TransferCoordinator`] executes plans (and single-account uploads) as
//! [`TransferJob`](skyshard_common::TransferJob)s with retry, pause and
//! resume, publishing progress as [`TransferEvent`]s.

pub mod coordinator;
pub mod events;
pub mod item;
pub mod planner;

pub use coordinator::{BackupReport, TransferConfig, TransferCoordinator};
pub use events::TransferEvent;
pub use item::UploadItem;
pub use planner::{plan, Placement, Plan};
