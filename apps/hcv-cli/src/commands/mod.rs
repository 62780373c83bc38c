pub mod audit;
pub mod config;
pub mod converge;

pub use audit::AuditCmd;
pub use config::ConfigCmd;
pub use converge::{ConvergeArgs, DotfilesCmd, SourceArgs, SystemConvergeArgs};
