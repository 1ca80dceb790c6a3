//! Latest chain head, refreshed in the background.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use sidecar_data::chain::ChainGateway;

#[derive(Clone, Debug, Default)]
pub struct ChainTip {
    latest: Arc<RwLock<u64>>,
}

impl ChainTip {
    pub fn new(initial: u64) -> Self {
        Self {
            latest: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get(&self) -> u64 {
        *self.latest.read().await
    }

    /// Moves the tip forward; an older value is ignored.
    pub async fn set(&self, block_number: u64) {
        let mut latest = self.latest.write().await;
        if block_number > *latest {
            *latest = block_number;
        }
    }

    /// Polls the gateway every `interval` until the returned handle is
    /// aborted. Poll failures are logged and retried on the next tick.
    pub fn spawn_refresh(&self, gateway: Arc<dyn ChainGateway>, interval: Duration) -> JoinHandle<()> {
        let tip = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match gateway.get_latest_block_number().await {
                    Ok(block_number) => {
                        tip.set(block_number).await;
                        tracing::trace!(block_number, "refreshed chain tip");
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to refresh chain tip"),
                }
            }
        })
    }
}
