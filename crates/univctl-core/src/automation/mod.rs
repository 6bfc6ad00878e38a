// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Automation module - node commands and cluster admin backends.

pub mod mock;
pub mod script;
mod traits;

pub use mock::{MockCluster, MockEvent, MockGate};
pub use script::ScriptAutomation;
pub use traits::*;
