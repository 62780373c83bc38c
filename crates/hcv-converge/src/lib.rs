//! Host convergence: package and dotfiles planners, the system-repo sync and
//! the orchestrator that sequences plan, apply and verify under locks,
//! rate limits and audit.

pub mod context;
pub mod desired;
pub mod dotfiles;
pub mod events;
pub mod managers;
pub mod orchestrator;
pub mod pkg;
pub mod plan;
pub mod repo;
pub mod slo;

pub use context::RunContext;
pub use desired::{DesiredSources, DesiredState};
pub use managers::{Brew, InventoryError, Mise, PackageManager};
pub use orchestrator::{
    AbortReason, ConvergeError, ConvergeRequest, ConvergeResult, Converger, RunStatus,
    SystemConvergeRequest,
};
pub use pkg::{ApplyOutcome, PkgSync, PlanOutcome};
pub use plan::{ChangeSet, Plan, Subsystem};
pub use repo::{RepoError, RepoSync};
