//! Core domain types for the cadence outreach automation platform.
//!
//! This crate provides the strongly-typed identifiers shared by the workflow
//! engine, scheduler, and server crates.

pub mod id;

pub use id::{
    ContactId, EnrollmentId, ExecutionId, ExecutionLogId, MessageId, ParseIdError,
    SenderIdentityId, TemplateId, WorkflowId,
};
