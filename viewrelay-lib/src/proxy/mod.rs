//! Proxy acquisition, validation, scoring and rotation.
//!
//! Candidates come from a [`ProxySource`], are probed by the
//! [`ProxyValidator`] and kept in the [`ProxyPool`], which ranks them and
//! leases the best one to each attempt.

mod config;
mod key;
mod pool;
mod record;
mod source;
mod validator;

pub use config::{
    DEFAULT_POOL_TARGET_SIZE, DEFAULT_SOURCE_LIMIT, DEFAULT_VALIDATION_CONCURRENCY, PoolConfig,
    SourceConfig, ValidatorConfig, default_sources,
};
pub use key::{Protocol, ProxyCandidate, ProxyKey};
pub use pool::{PoolStatus, ProxyPool, SweepReport};
pub use record::{Outcome, ProxyRecord, ProxyState};
pub use source::{HttpListSource, ProxySource, StaticSource, fetch_all};
pub use validator::{ProxyValidator, Verdict};
