//! Building blocks for policy-gated host convergence: configuration, the
//! sandboxed executor, named locks, rate limiting and secret references.

pub mod config;
pub mod gate;
pub mod locks;
pub mod paths;
pub mod ratelimit;
pub mod secrets;
#[cfg(test)]
mod test_support;
pub mod util;

pub use config::{config_schema_json, load_config, parse_config, resolve_config, Config};
pub use gate::{ExecRequest, ExecResult, Executor, FailureKind, GatePolicy, PolicyGate};
pub use locks::{LockError, LockManager, LockOptions};
pub use ratelimit::{Admission, RateLimiter};
pub use secrets::{GopassResolver, SecretError, SecretResolver};
