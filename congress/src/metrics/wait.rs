use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::instrument;

use crate::core::Role;
use crate::metrics::CongressMetrics;
use crate::NodeId;

/// Error variants raised while waiting for a metrics condition.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("congress is shutting down")]
    ShuttingDown,
}

/// Wait for a congress node's metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<CongressMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy `func`, or timeout.
    #[instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<CongressMetrics, WaitError>
    where T: Fn(&CongressMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        // One deadline for the whole wait, no matter how often metrics change.
        let timeout_at = Instant::now() + self.timeout;
        loop {
            let latest = rx.borrow().clone();

            tracing::debug!("wait for metrics condition: {} latest: {:?}", msg.to_string(), latest);

            if func(&latest) {
                tracing::debug!("done waiting for {} latest: {:?}", msg.to_string(), latest);
                return Ok(latest);
            }

            let delay = sleep_until(timeout_at);

            tokio::select! {
                _ = delay => {
                    tracing::debug!("timeout waiting for {} latest: {:?}", msg.to_string(), latest);
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg.to_string(), latest)));
                }
                changed = rx.changed() => {
                    match changed {
                        Ok(_) => {}
                        Err(err) => {
                            tracing::debug!(
                                "error while waiting for {}, err: {} latest: {:?}",
                                msg.to_string(), err, latest
                            );
                            return Err(WaitError::ShuttingDown);
                        }
                    }
                }
            };
        }
    }

    /// Wait for `current_leader` to become `leader_id`.
    #[instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<CongressMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader == Some(leader_id),
            &format!("{} .current_leader == {}", msg.to_string(), leader_id),
        )
        .await
    }

    /// Wait until applied reaches exactly `want_log`.
    #[instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<CongressMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index == want_log,
            &format!("{} .last_log_index == {}", msg.to_string(), want_log),
        )
        .await?;

        self.metrics(
            |x| x.last_applied == want_log,
            &format!("{} .last_applied == {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait until applied reaches at least `want_log`.
    #[instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn log_at_least(&self, want_log: u64, msg: impl ToString) -> Result<CongressMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index >= want_log,
            &format!("{} .last_log_index >= {}", msg.to_string(), want_log),
        )
        .await?;

        self.metrics(
            |x| x.last_applied >= want_log,
            &format!("{} .last_applied >= {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for the node to reach the given role.
    #[instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn role(&self, want_role: Role, msg: impl ToString) -> Result<CongressMetrics, WaitError> {
        self.metrics(
            |x| x.role == want_role,
            &format!("{} .role == {:?}", msg.to_string(), want_role),
        )
        .await
    }

    /// Wait for the node's voter set to become `want_voters`.
    #[instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn voters(&self, want_voters: BTreeSet<NodeId>, msg: impl ToString) -> Result<CongressMetrics, WaitError> {
        self.metrics(
            |x| x.topology.voters == want_voters,
            &format!("{} .topology.voters == {:?}", msg.to_string(), want_voters),
        )
        .await
    }
}
