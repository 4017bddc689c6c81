//! Bounded retries for read queries and inclusion polling.
//!
//! Only queries are ever retried here. State-changing submissions go through
//! exactly once.

use std::{future::Future, time::Duration};

use alloy_core::primitives::B256;
use backon::{ConstantBuilder, ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};

use crate::chain::{ChainClient, ChainError, Receipt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts for a read query after the first one.
    pub read_attempts: usize,
    pub read_min_delay_ms: u64,
    pub read_max_delay_ms: u64,
    /// Extra inclusion waits after the first one times out.
    pub inclusion_attempts: usize,
    /// Pause between inclusion waits.
    pub inclusion_poll_ms: u64,
    /// Timeout of a single RPC request.
    pub request_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            read_attempts: 5,
            read_min_delay_ms: 500,
            read_max_delay_ms: 8_000,
            inclusion_attempts: 10,
            inclusion_poll_ms: 2_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Meant for tests and local dev chains.
    pub fn immediate() -> Self {
        Self {
            read_min_delay_ms: 0,
            read_max_delay_ms: 0,
            inclusion_poll_ms: 0,
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn read_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.read_min_delay_ms))
            .with_max_delay(Duration::from_millis(self.read_max_delay_ms))
            .with_max_times(self.read_attempts)
    }

    fn inclusion_backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(Duration::from_millis(self.inclusion_poll_ms))
            .with_max_times(self.inclusion_attempts)
    }

    /// Run a read query, retrying transient failures with exponential backoff.
    pub async fn read<T, F, Fut>(&self, what: &str, query: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        query
            .retry(self.read_backoff())
            .sleep(tokio::time::sleep)
            .when(ChainError::is_transient)
            .notify(|err, after| {
                tracing::warn!(query = %what, err = %err, retry_in = ?after, "Read query failed, retrying...");
            })
            .await
    }

    /// Wait for `tx` to be included, re-querying its status until the budget is spent.
    ///
    /// Never resubmits the transaction.
    pub async fn await_receipt<C: ChainClient>(&self, client: &C, tx: B256) -> Result<Receipt, ChainError> {
        (move || client.await_inclusion(tx))
            .retry(self.inclusion_backoff())
            .sleep(tokio::time::sleep)
            .when(ChainError::is_transient)
            .notify(|err, after| {
                tracing::info!(tx_hash = %tx, err = %err, retry_in = ?after, "Still waiting for inclusion...");
            })
            .await
    }
}
