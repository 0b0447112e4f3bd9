//! Integration test suite for devpilot.
//!
//! These tests drive the public API end to end: tool guarantees, planning,
//! the task lifecycle from prompt to commit and back, and the HTTP adapter.
//!
//! # Test Categories
//!
//! - `tool_safety`: Sandboxing, destructive-operation guards, rate limits
//! - `planning`: Decomposition, tracks and quality gates
//! - `task_lifecycle`: Approval gate, apply, rollback, healing, cancellation
//! - `http_api`: Routes, status codes and caller identity
//!
//! # CI Compatibility
//!
//! Completions come from a scripted backend and repositories live in temp
//! directories, so no network access or API keys are needed. `git` must be
//! on PATH.

mod fixtures;

mod http_api;
mod planning;
mod task_lifecycle;
mod tool_safety;
