// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::{CoreError, Result};

/// Poll `check` every `interval` until it returns `true`.
///
/// Fails with [`CoreError::WaitTimeout`] once `timeout` has passed, and
/// with whatever `check` returns if it errors.
pub async fn poll_until<F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if check().await? {
            trace!(what, attempts, "Condition met");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(CoreError::WaitTimeout {
                what: what.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}
