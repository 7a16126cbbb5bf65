//! Periodic account polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::account::{AccountClient, AccountStatus};
use crate::error::Error;
use crate::tasks::{PauseReason, TaskManager};

/// Feeds account reports into the task manager.
pub struct AccountSync {
    client: Arc<dyn AccountClient>,
    manager: Arc<TaskManager>,
}

impl AccountSync {
    pub fn new(client: Arc<dyn AccountClient>, manager: Arc<TaskManager>) -> Self {
        Self { client, manager }
    }

    /// Fetch the account state once and act on it.
    ///
    /// An exhausted balance pauses the queue. A positive balance lifts the
    /// pause, but only one that was imposed for lack of credit.
    pub async fn poll_once(&self) -> Result<AccountStatus, Error> {
        let status = self.client.fetch_status().await?;
        info!(credit = %status.credit, as_of = %status.as_of, "Account status fetched");

        if status.has_credit() {
            if self
                .manager
                .resume_if_paused_for(PauseReason::QuotaExceeded)
                .await?
            {
                info!("Account topped up, queue resumed");
            }
        } else {
            warn!(credit = %status.credit, "Account balance exhausted");
            self.manager.pause_all(PauseReason::QuotaExceeded).await?;
        }

        self.manager.publish_account(status.clone());
        Ok(status)
    }
}

/// Spawn a background task that polls the account every `interval`.
pub fn spawn_account_sync(
    sync: AccountSync,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Account sync started, polling every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Account sync shutting down");
                    return;
                }
                _ = tick.tick() => {}
            }

            if let Err(e) = sync.poll_once().await {
                error!("Account poll failed: {e}");
            }
        }
    })
}
