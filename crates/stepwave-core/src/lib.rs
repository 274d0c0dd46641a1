//! Workflow engine logic and repository trait definitions for Stepwave.
//!
//! This crate defines the "ports" (repository and lease-store traits) that
//! the infrastructure layer implements, and the engine that drives workflow
//! instances through them. It depends only on `stepwave-types` -- never on
//! `stepwave-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
