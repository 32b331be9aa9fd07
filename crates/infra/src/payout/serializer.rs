//! Single-flight FIFO executor for chain payouts.
//!
//! One signing key backs every payout, so two in-flight payouts could race
//! on the key's nonce. Every submitted executor runs on one worker task,
//! strictly in submission order, one at a time. An executor runs to
//! completion even if its submitter stops waiting.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::ChainError;

type PayoutTask = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
pub struct PayoutSerializer {
    orders: mpsc::UnboundedSender<PayoutTask>,
}

impl PayoutSerializer {
    /// Start the worker on the current tokio runtime. The worker stops once
    /// every `PayoutSerializer` clone has been dropped and the queue drained.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (orders, queue) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain(queue));
        (Self { orders }, worker)
    }

    /// Queue `executor` behind every earlier submission and wait for its
    /// output. Fails only if the worker is gone or the executor panicked.
    pub async fn submit<F, Fut, T>(&self, executor: F) -> Result<T, ChainError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, output) = oneshot::channel();
        let task: PayoutTask = Box::pin(async move {
            // The submitter may have given up waiting.
            let _ = reply.send(executor().await);
        });
        self.orders.send(task).map_err(|_| ChainError::QueueClosed)?;
        output.await.map_err(|_| ChainError::QueueClosed)
    }
}

async fn drain(mut queue: mpsc::UnboundedReceiver<PayoutTask>) {
    info!("payout serializer started");
    while let Some(task) = queue.recv().await {
        // A panicking executor must not take the queue down with it.
        if let Err(e) = tokio::spawn(task).await {
            error!(error = %e, "payout executor panicked");
        }
    }
    info!("payout serializer stopped");
}
