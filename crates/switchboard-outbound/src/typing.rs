//! Typing-indicator lifecycle for a single reply.
//!
//! `typing=true` goes out when the reply starts; while blocks stream in, the
//! indicator is restarted shortly after each block so it survives provider
//! expiry; `typing=false` goes out on finish or abort.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{ChannelOutboundAdapter, SendContext};

/// Delay before re-asserting typing after a streamed block.
const RESTART_DELAY_MS: u64 = 150;

/// Handle to a background typing-indicator task for one reply.
pub struct TypingSession {
    restart_tx: mpsc::UnboundedSender<()>,
    handle: tokio::task::JoinHandle<()>,
    adapter: Arc<dyn ChannelOutboundAdapter>,
    ctx: SendContext,
}

impl TypingSession {
    /// Send `typing=true` and start the restart loop.
    pub fn start(adapter: Arc<dyn ChannelOutboundAdapter>, ctx: SendContext) -> Self {
        let (restart_tx, mut restart_rx) = mpsc::unbounded_channel::<()>();

        let task_adapter = Arc::clone(&adapter);
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let _ = task_adapter.set_typing(&task_ctx, true).await;
            while restart_rx.recv().await.is_some() {
                // Drain bursts so rapid blocks produce one restart.
                while restart_rx.try_recv().is_ok() {}
                tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)).await;
                let _ = task_adapter.set_typing(&task_ctx, true).await;
            }
        });

        Self {
            restart_tx,
            handle,
            adapter,
            ctx,
        }
    }

    /// A streamed block was just sent; re-assert typing after a short delay.
    pub fn notify_block_sent(&self) {
        let _ = self.restart_tx.send(());
    }

    /// Finish (or abort) the reply: stop the loop and clear the indicator.
    pub async fn stop(self) {
        drop(self.restart_tx);
        self.handle.abort();
        if let Err(e) = self.adapter.set_typing(&self.ctx, false).await {
            debug!(error = %e, "typing=false failed");
        }
    }
}
