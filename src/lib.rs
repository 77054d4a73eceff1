//! # Fabricore: Procedure Execution Core
//!
//! Fabricore is the procedure execution core of a distributed-database
//! management fabric: it accepts administrative *procedures* (reconfigure a
//! shard, fail over a replica, ...), breaks them into transactional *jobs*,
//! serialises execution with respect to shared lockable objects, and records
//! crash-recovery checkpoints so partially-executed procedures can be
//! replayed after a restart.
//!
//! ## Core Concepts
//!
//! - **Procedure**: unit of admission control; groups jobs under a shared
//!   lockable-object set and is the handle callers wait on
//! - **Job**: one transactional callable; unit of checkpointing and worker
//!   dispatch
//! - **Worker**: long-lived task draining one procedure's jobs at a time
//!   under one database session
//! - **Scheduler**: admission gate serialising procedures that contend for
//!   a common lockable object
//! - **Checkpoint store**: durable intent records enabling recovery
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use fabricore::action::{Action, ActionArgs, ActionCall, ActionError, ActionRegistry};
//! use fabricore::executor::Executor;
//! use serde_json::{Value, json};
//!
//! struct PromoteReplica;
//!
//! #[async_trait]
//! impl Action for PromoteReplica {
//!     async fn run(&self, args: &ActionArgs) -> Result<Value, ActionError> {
//!         let group = args.require_arg(0)?;
//!         // ... drive the failover through the worker's transactional context ...
//!         Ok(json!({ "promoted": group }))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ActionRegistry::new());
//! registry.register("fabric.server.promote", Arc::new(PromoteReplica));
//!
//! let executor = Executor::builder().workers(2).registry(registry).build();
//! executor.start()?;
//!
//! let procedure = executor
//!     .enqueue_procedure(
//!         false,
//!         ActionCall::new("fabric.server.promote", "Promote a replica.")
//!             .with_args(vec![json!("group-a")]),
//!         None,
//!     )
//!     .await?;
//!
//! executor.wait_for_procedure(&procedure).await?;
//! println!("result: {}", procedure.result());
//!
//! executor.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Nested Submission
//!
//! Actions may call back into the executor while they run. With
//! `within_procedure = true` the new jobs join the caller's own procedure
//! and execute on the same worker, in insertion order; with `false` they
//! become fresh procedures offered to the scheduler. Either way the children
//! are staged on the current job and flushed only when its transaction
//! commits, so a rolled-back job never leaks work.
//!
//! ## Module Guide
//!
//! - [`procedure`] - Procedures and the completion wait handle
//! - [`job`] - Jobs, status trails, and the execute protocol
//! - [`queue`] - The per-worker job FIFO
//! - [`worker`] - Worker tasks and the task-local execution scope
//! - [`executor`] - The dispatch facade and crash recovery
//! - [`scheduler`] - Lockable-object admission control
//! - [`action`] - The action capability and its FQN registry
//! - [`checkpoint`] - Durable intent records and their stores
//! - [`persister`] - The per-worker transactional seam
//! - [`config`] - Environment-driven configuration
//! - [`telemetry`] - Optional tracing subscriber setup

pub mod action;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod executor;
pub mod job;
pub mod persister;
pub mod procedure;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
pub mod worker;
