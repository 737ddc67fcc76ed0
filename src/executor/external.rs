//! External executor: leaves the run pending for an out-of-process runner.
//!
//! Nothing is spawned locally. An optional dispatcher webhook is notified in
//! the background; notification failures are only logged.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::ExecutorConfig;
use crate::error::Result;
use crate::executor::worker::StartRequest;
use crate::executor::{ExecutionMode, ExecutionStarted, Executor};

/// Receiver of "a run is pending" notifications.
#[async_trait]
pub trait DispatchNotifier: Send + Sync {
    async fn notify(&self, request: &StartRequest) -> Result<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchPayload<'a> {
    run_id: i64,
    source_id: i64,
    url: &'a str,
    max_items: u64,
}

/// Notifier that POSTs the pending run to a dispatcher URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }

    /// Build a notifier from config, if a webhook is configured.
    pub fn from_config(config: &ExecutorConfig) -> Result<Option<Self>> {
        match &config.dispatch_webhook {
            Some(url) => Ok(Some(Self::new(
                url.clone(),
                config.webhook_token.clone(),
                Duration::from_millis(config.webhook_timeout_ms),
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DispatchNotifier for WebhookNotifier {
    async fn notify(&self, request: &StartRequest) -> Result<()> {
        let payload = DispatchPayload {
            run_id: request.run_id,
            source_id: request.source_id,
            url: &request.url,
            max_items: request.max_items,
        };
        let mut builder = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Executor for runs that an external runner claims from the pending queue.
pub struct ExternalExecutor {
    notifier: Option<Arc<dyn DispatchNotifier>>,
    runtime: Option<Handle>,
    notifications: Mutex<Vec<JoinHandle<()>>>,
}

impl ExternalExecutor {
    pub fn new(notifier: Option<Arc<dyn DispatchNotifier>>) -> Self {
        Self {
            notifier,
            runtime: Handle::try_current().ok(),
            notifications: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Executor for ExternalExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::External
    }

    fn start(&self, request: &StartRequest) -> Result<ExecutionStarted> {
        let (Some(notifier), Some(runtime)) = (&self.notifier, &self.runtime) else {
            return Ok(ExecutionStarted::Queued);
        };

        let notifier = Arc::clone(notifier);
        let request = request.clone();
        let handle = runtime.spawn(async move {
            match notifier.notify(&request).await {
                Ok(()) => log::debug!("Notified dispatcher of run {}", request.run_id),
                Err(e) => log::warn!("Dispatcher notify for run {} failed: {}", request.run_id, e),
            }
        });

        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.retain(|h| !h.is_finished());
            notifications.push(handle);
        }

        Ok(ExecutionStarted::Queued)
    }

    fn terminate(&self, _run_id: i64) -> bool {
        false
    }

    async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = match self.notifications.lock() {
            Ok(mut notifications) => notifications.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
