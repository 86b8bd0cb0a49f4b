//! Core domain models for pipeline orchestration.
//!
//! This module contains the task node model and the mutable task graph
//! that gates execution on completion of predecessors.

pub mod graph;
pub mod task;

pub use graph::{shared, GraphSnapshot, Reroute, SharedGraph, StatusCounts, TaskGraph};
pub use task::{NodeSpec, StageKind, TaskId, TaskKind, TaskNode, TaskStatus};
