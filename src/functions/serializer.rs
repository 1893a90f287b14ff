use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Per-channel send serialization. The underlying connection corrupts
/// protocol state if two sends run concurrently, so every send for a
/// channel goes through that channel's slot in FIFO order.
#[derive(Clone, Default)]
pub struct ChannelSerializer {
    chains: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ChannelSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after every previously submitted task for the same
    /// channel has settled. Tokio's mutex queues waiters in FIFO order,
    /// so submission order is execution order; a failing task merely
    /// releases its slot and never stalls the chain behind it.
    pub async fn run_exclusive<F, T>(&self, channel_id: Uuid, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let slot = {
            let mut chains = self.chains.lock().unwrap();
            chains.entry(channel_id).or_default().clone()
        };
        let _guard = slot.lock().await;
        task.await
    }
}
