// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned updates of universe records.
//!
//! Every read-then-write of a universe runs inside a critical section keyed
//! by universe id, and commits through [`Persistence::compare_and_swap`].
//! Two updates of the same universe never interleave inside one process;
//! the compare-and-swap catches writers outside it. A section is dropped from
//! the table once nobody holds or waits for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{NodeState, Universe};
use crate::persistence::Persistence;

/// Version value meaning "skip the version check".
pub const ANY_VERSION: i64 = -1;

type Sections = SyncMutex<HashMap<Uuid, Arc<Mutex<()>>>>;

/// Applies atomic, versioned mutations to universes.
pub struct UniverseUpdater {
    persistence: Arc<dyn Persistence>,
    sections: Sections,
}

/// Held critical section of one universe. Released on drop.
pub struct CriticalSection<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    universe_id: Uuid,
    sections: &'a Sections,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only taken under the table lock, so a count of one
        // means no holder and no waiter.
        if sections
            .get(&self.universe_id)
            .is_some_and(|s| Arc::strong_count(s) == 1)
        {
            sections.remove(&self.universe_id);
        }
    }
}

impl UniverseUpdater {
    /// Create an updater on top of a store.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            sections: SyncMutex::new(HashMap::new()),
        }
    }

    /// The underlying store.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Enter the critical section for one universe.
    pub async fn critical_section(&self, universe_id: Uuid) -> CriticalSection<'_> {
        let section = {
            let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
            sections
                .entry(universe_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        CriticalSection {
            guard: Some(section.lock_owned().await),
            universe_id,
            sections: &self.sections,
        }
    }

    #[cfg(test)]
    fn open_sections(&self) -> usize {
        self.sections.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Load the current record without locking.
    pub async fn load(&self, universe_id: Uuid) -> Result<Universe> {
        self.persistence.load_universe(universe_id).await
    }

    /// Apply `mutator` to the current record.
    pub async fn update<F>(&self, universe_id: Uuid, mutator: F) -> Result<Universe>
    where
        F: FnMut(&mut Universe) -> Result<()> + Send,
    {
        self.update_versioned(universe_id, ANY_VERSION, mutator).await
    }

    /// Apply `mutator` if the stored version equals `expected_version`
    /// ([`ANY_VERSION`] skips the check).
    pub async fn update_versioned<F>(
        &self,
        universe_id: Uuid,
        expected_version: i64,
        mut mutator: F,
    ) -> Result<Universe>
    where
        F: FnMut(&mut Universe) -> Result<()> + Send,
    {
        let _section = self.critical_section(universe_id).await;
        let current = self.persistence.load_universe(universe_id).await?;

        if expected_version != ANY_VERSION && expected_version != current.version {
            return Err(CoreError::VersionMismatch {
                universe_id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let updated = self
            .persistence
            .compare_and_swap(universe_id, current.version, &mut mutator)
            .await?;
        debug!(
            universe_id = %universe_id,
            version = updated.version,
            "Universe updated"
        );
        Ok(updated)
    }

    /// Move nodes to a new lifecycle state.
    ///
    /// `Decommissioned` also releases the node's addresses.
    pub async fn set_node_states(
        &self,
        universe_id: Uuid,
        node_names: &[String],
        state: NodeState,
    ) -> Result<Universe> {
        self.update(universe_id, |universe| {
            for name in node_names {
                let node = universe
                    .node_mut(name)
                    .ok_or_else(|| CoreError::NodeNotFound {
                        universe_id,
                        node_name: name.clone(),
                    })?;
                node.state = state;
                if state == NodeState::Decommissioned {
                    node.cloud_info.private_ip = None;
                    node.cloud_info.public_ip = None;
                }
            }
            Ok(())
        })
        .await
    }
}
