//! Integration test suite for gatekeep.
//!
//! These tests drive full runs of the review pipeline against a scripted
//! producer and check the resulting graph, store, ledger and run records.
//!
//! # Test Categories
//!
//! - `pipeline_e2e`: Full standard runs and their persisted records
//! - `blindness`: Bundle isolation between reviewers and stages
//! - `disputes`: Dispute rounds, verdicts and escalation
//! - `recovery`: Gate fix cycles, producer retries, timeouts, cancellation
//! - `properties`: Property tests over the graph, coverage and disputes
//!
//! # CI Compatibility
//!
//! The producer is an in-process script; nothing calls out to a model, so
//! the suite is safe to run in CI environments.


mod pipeline_e2e;
mod blindness;
mod recovery;
mod properties;
