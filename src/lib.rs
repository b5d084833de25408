//! Execution orchestration for coding-agent job containers.
//!
//! A control plane that keeps a fleet of pre-warmed worker containers,
//! assigns jobs to them over a small HTTP protocol, recovers from crashed
//! or stuck workers, and falls back through three execution tiers
//! (warm pool, locally spawned cold container, remote CI) without losing
//! a job.

pub mod agent;
pub mod config;
pub mod error;
pub mod jobs;
pub mod local;
pub mod logbuf;
pub mod orchestrator;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod runtime;
pub mod workspace;
