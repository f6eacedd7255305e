//! Edge Worker
//!
//! Pulls jobs from remote work queues and runs them on a bounded,
//! dynamically sized worker pool.
//!
//! This crate provides:
//! - Worker pool with backlog, shrink-on-idle and panic isolation
//! - Jobs with an at-most-once guard and a visibility watchdog
//! - SQS queue clients with in-place credential refresh
//! - Per-queue pollers sized by pool capacity
//! - A processor that keeps the poller set in line with the control plane token
//! - Command dispatch from a JSON action map, optionally from git checkouts

pub mod action;
pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod poller;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod token;

pub use config::EdgeConfig;
pub use processor::Processor;
