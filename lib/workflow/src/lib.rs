//! Workflow engine for the cadence platform.
//!
//! This crate provides the enrollment and execution engine, including:
//!
//! - **Graph Model**: Directed workflow graphs using petgraph with typed
//!   nodes and handle-labelled edges
//! - **Node Types**: Trigger, time delay, conditional split, SMS/email
//!   send, status update, stop-on-reply, sub-workflow call and return
//! - **Enrollment**: Per-contact membership records with stop, pause,
//!   resume, and reply handling
//! - **Execution**: A durable cursor per enrollment with retry tracking
//!   and an append-only step log
//! - **Processing**: One processor per node type behind a common trait,
//!   driven by a claim-based step runner

pub mod condition;
pub mod contact;
pub mod definition;
pub mod edge;
pub mod enroll;
pub mod enrollment;
pub mod error;
pub mod execution;
pub mod graph;
pub mod messaging;
pub mod node;
pub mod processor;
pub mod runner;
pub mod store;
pub mod subflow;

pub use condition::{Condition, ConditionGroup, ConditionOperator, ConditionalSplitData};
pub use contact::{Contact, ContactStore};
pub use definition::Workflow;
pub use edge::Edge;
pub use enroll::{EnrollError, EnrollOutcome, EnrollmentManager};
pub use enrollment::{EnrollmentStatus, WorkflowEnrollment};
pub use error::GraphError;
pub use execution::{
    ExecutionData, ExecutionLogStatus, ExecutionStatus, ReplyChannel, WorkflowExecution,
    WorkflowExecutionLog,
};
pub use graph::WorkflowGraph;
pub use messaging::{MessageChannel, MessageSender, TemplateStore};
pub use node::{Node, NodeData, NodeId};
pub use processor::{NodeProcessor, ProcessError, ProcessorContext, ProcessorRegistry};
pub use runner::{RetryPolicy, StepOutcome, StepRunner};
pub use store::{EngineStore, MemoryStore, StepRecord, StoreError};
pub use subflow::{ChildEnroller, ChildState, SubflowError};
