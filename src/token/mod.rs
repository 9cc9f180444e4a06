//! Resumable watch positions of ingestion flows.
//!
//! The authoritative token write happens inside the flow's commit, together
//! with the chain nodes it covers. This handler only reads positions, records
//! the all-dropped batch case and performs the alarmed reset after the
//! change feed lost its resume point.


use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::metrics::TOKEN_RESETS;
use crate::ChainStore;
use crate::ClusterTime;
use crate::CursorType;
use crate::Result;

#[derive(Clone)]
pub struct TokenHandler {
    resource: CursorType,
    token_key: String,
    chain: String,
    store: Arc<dyn ChainStore>,
    tail_fallback: bool,
}

impl TokenHandler {
    pub fn new(
        resource: CursorType,
        token_key: String,
        chain: String,
        store: Arc<dyn ChainStore>,
    ) -> Self {
        Self {
            resource,
            token_key,
            chain,
            store,
            tail_fallback: true,
        }
    }

    /// Handler of one source collection feeding a mix chain. The chain tail
    /// may carry another collection's token, so it is never resumed from.
    pub fn for_mix_source(mut self) -> Self {
        self.tail_fallback = false;
        self
    }

    pub fn resource(&self) -> CursorType {
        self.resource
    }

    pub fn token_key(&self) -> &str {
        &self.token_key
    }

    /// Token to resume the change feed from.
    ///
    /// Falls back to the resume token embedded in the chain tail when no token
    /// record was ever written, and to an empty token on a fresh chain.
    pub async fn get_start_watch_token(&self) -> Result<String> {
        if let Some(record) = self.store.get_token(&self.token_key).await? {
            if !record.token.is_empty() {
                return Ok(record.token);
            }
            // reset record: resume from its start time instead
            if !record.start_at_time.is_zero() {
                return Ok(String::new());
            }
        }

        if !self.tail_fallback {
            return Ok(String::new());
        }

        match self.store.tail(&self.chain).await? {
            Some(node) => {
                info!(
                    token_key = %self.token_key,
                    id = node.id,
                    "no token record, resume from chain tail"
                );
                Ok(node.token)
            }
            None => Ok(String::new()),
        }
    }

    /// Raw loop callback. The token is persisted by the commit, so nothing is
    /// written here.
    pub async fn set_last_watch_token(
        &self,
        token: &str,
    ) -> Result<()> {
        debug!(token_key = %self.token_key, token, "last watch token observed");
        Ok(())
    }

    /// Advances the resume position without writing nodes, used when every
    /// event of a batch was dropped.
    pub async fn set_last_token_data(
        &self,
        token: &str,
        start_at_time: ClusterTime,
    ) -> Result<()> {
        self.store.update_token_position(&self.token_key, token, start_at_time).await
    }

    /// Clears the resume token and restarts from `start_at_time`.
    ///
    /// Events between the lost resume point and `start_at_time` may be skipped.
    pub async fn reset_watch_token(
        &self,
        start_at_time: ClusterTime,
    ) -> Result<()> {
        warn!(
            token_key = %self.token_key,
            start_at = start_at_time.sec,
            "reset watch token, events before the start time may be lost"
        );
        TOKEN_RESETS.with_label_values(&[self.resource.as_str()]).inc();
        self.store.update_token_position(&self.token_key, "", start_at_time).await
    }

    /// Stored start time, zero when never set.
    pub async fn get_start_watch_time(&self) -> Result<ClusterTime> {
        Ok(self
            .store
            .get_token(&self.token_key)
            .await?
            .map(|t| t.start_at_time)
            .unwrap_or_default())
    }
}
