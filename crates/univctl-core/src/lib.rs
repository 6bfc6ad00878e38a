// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! univctl Core - Universe Task Engine
//!
//! This crate runs long-lived administrative tasks against managed database
//! universes: software and flag upgrades, restarts, node additions and
//! removals, teardown. Every task locks its universe, runs an ordered plan of
//! subtasks, and persists its progress so a restarted process resumes where
//! the previous one stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Callers (API, CLI)                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ submit / retry / abort / status
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Commissioner                                 │
//! │        lock ─► build plan ─► run queue ─► compensate ─► unlock           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                        │                          │
//!           ▼                        ▼                          ▼
//! ┌───────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │   LockManager     │   │   SubTaskQueue      │   │  NodeAutomation /   │
//! │ UniverseUpdater   │   │ upgrade flows,      │   │  ClusterAdmin       │
//! │ (versioned CAS)   │   │ quorum coordinator  │   │  (script or mock)   │
//! └───────────────────┘   └─────────────────────┘   └─────────────────────┘
//!           │                        │
//!           ▼                        ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 Persistence (SQLite or in-memory)                       │
//! │         universes, task records, plans, completed subtasks              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Universe Lock
//!
//! A universe is locked by at most one task. Locking checks the caller's
//! version, refuses while another task owns the lock (unless forced, which
//! aborts the owner first), and refuses while a failed topology change is
//! pending, except for destroy, backups and a retry of the failed task.
//! Every committed change bumps the universe version.
//!
//! # Task States
//!
//! ```text
//!   CREATED ──► RUNNING ──┬──► SUCCESS
//!                         ├──► FAILURE ──► (retry as a new task)
//!                         └──► ABORTED ──► (retry as a new task)
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `UNIVCTL_DATABASE_URL` | Yes | - | SQLite connection string or file path |
//! | `UNIVCTL_AUTOMATION_SCRIPT` | No | `univctl-node` | Node automation executable |
//! | `UNIVCTL_MAX_PARALLEL_SUBTASKS` | No | `10` | Subtask worker pool size |
//! | `UNIVCTL_BLACKLIST_LEADERS` | No | `true` | Drain leaders before stopping tservers |
//! | `UNIVCTL_MASTER_READY_TIMEOUT_SECS` | No | `300` | Master startup wait |
//! | `UNIVCTL_TSERVER_READY_TIMEOUT_SECS` | No | `300` | TServer startup wait |
//!
//! See [`config::Config::from_env`] for the full list.
//!
//! # Modules
//!
//! - [`commissioner`]: Task submission, run loop, status, retry, resume
//! - [`lock`]: Universe lock and placement restriction
//! - [`queue`]: Subtask groups and their execution
//! - [`upgrade`]: Rolling, non-rolling and non-restart flows
//! - [`quorum`]: Blacklists, load balancer, master quorum
//! - [`policy`]: Failure classification and compensation
//! - [`tasks`]: Concrete top-level tasks
//! - [`persistence`]: SQLite and in-memory stores

#![deny(missing_docs)]

/// Node automation and cluster admin backends.
pub mod automation;

/// Task submission and execution.
pub mod commissioner;

/// Configuration loaded from environment variables.
pub mod config;

/// Per-run execution context and shared services.
pub mod context;

/// Error types with stable error codes.
pub mod error;

/// Universe lock manager.
pub mod lock;

/// Embedded database migrations.
pub mod migrations;

/// Universe, cluster and node records.
pub mod model;

/// Durable storage of universes and tasks.
pub mod persistence;

/// Failure classification and compensation.
pub mod policy;

/// Subtask groups and queues.
pub mod queue;

/// Leader/data blacklists, load balancer and master quorum changes.
pub mod quorum;

/// Subtask definitions.
pub mod subtask;

/// Task types and their lock policy.
pub mod task_types;

/// Concrete top-level tasks.
pub mod tasks;

/// Versioned universe updates.
pub mod updater;

/// Upgrade orchestration.
pub mod upgrade;

/// Polling helpers.
pub mod wait;

pub use commissioner::{Commissioner, CommissionerBuilder, TaskStatus};
pub use error::{CoreError, ErrorKind};
