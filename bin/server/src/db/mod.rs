//! Postgres repositories backing the engine's storage traits.
//!
//! This module provides data access for:
//! - Workflow definitions, enrollments, execution cursors, and step logs
//! - Contacts
//! - Message templates

pub mod contact;
pub mod engine;
pub mod template;

pub use contact::PgContactStore;
pub use engine::PgEngineStore;
pub use template::PgTemplateStore;
