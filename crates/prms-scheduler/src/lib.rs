//! Delayed-message scheduling: request validation and the poll-based
//! due-queue sweeper.
//!
//! No in-memory one-shot timers. Pending messages live in the store and a
//! periodic sweep claims everything due in a single statement, so messages
//! whose activation time elapsed while the process was down are claimed on
//! the first sweep after boot instead of being dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::broadcast;
use tracing::{error, info};

use prms_core::ScheduledMessage;
use prms_storage::{PolicyStore, StoreError};

pub const CRATE_NAME: &str = "prms-scheduler";

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid day '{0}'; expected YYYY-MM-DD")]
    InvalidDay(String),
    #[error("invalid time '{0}'; expected HH:MM or HH:MM:SS")]
    InvalidTime(String),
    #[error("scheduled time must be in the future")]
    NotInFuture,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Compose a calendar day and wall-clock time into the UTC activation
/// instant.
pub fn compose_timestamp(day: &str, time: &str) -> Result<DateTime<Utc>, ScheduleError> {
    let date = NaiveDate::parse_from_str(day.trim(), "%Y-%m-%d")
        .map_err(|_| ScheduleError::InvalidDay(day.to_string()))?;
    let time = time.trim();
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
        .map_err(|_| ScheduleError::InvalidTime(time.to_string()))?;
    Ok(date.and_time(time).and_utc())
}

/// Validate and persist a pending message. Rejects activation instants that
/// are not strictly in the future; nothing is persisted on rejection.
pub async fn schedule_message(
    store: &dyn PolicyStore,
    message: &str,
    day: &str,
    time: &str,
) -> Result<ScheduledMessage, ScheduleError> {
    let scheduled_at = compose_timestamp(day, time)?;
    if scheduled_at <= Utc::now() {
        return Err(ScheduleError::NotInFuture);
    }
    let record = store.create_message(message, scheduled_at).await?;
    info!(id = %record.id, scheduled_at = %record.scheduled_at, "message scheduled");
    Ok(record)
}

/// Periodic due-queue sweeper.
pub struct MessageSweeper {
    store: Arc<dyn PolicyStore>,
    interval: Duration,
}

impl MessageSweeper {
    pub fn new(store: Arc<dyn PolicyStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Claim and report every due pending message.
    pub async fn sweep_once(&self) -> Result<Vec<ScheduledMessage>, StoreError> {
        let claimed = self.store.complete_due_messages(Utc::now()).await?;
        for message in &claimed {
            info!(id = %message.id, message = %message.message, "scheduled message activated");
        }
        Ok(claimed)
    }

    /// Sweep loop with graceful shutdown. The first tick fires immediately,
    /// which is what recovers activations missed while the process was down.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "message sweeper started");
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "due-message sweep failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("message sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use prms_core::MessageStatus;
    use prms_storage::MemStore;

    #[test]
    fn timestamp_composition_accepts_both_time_forms() {
        let with_seconds = compose_timestamp("2030-05-01", "09:30:15").unwrap();
        assert_eq!(with_seconds.to_rfc3339(), "2030-05-01T09:30:15+00:00");

        let without_seconds = compose_timestamp("2030-05-01", " 09:30 ").unwrap();
        assert_eq!(without_seconds.to_rfc3339(), "2030-05-01T09:30:00+00:00");
    }

    #[test]
    fn timestamp_composition_rejects_garbage() {
        assert!(matches!(
            compose_timestamp("May 1st", "09:30"),
            Err(ScheduleError::InvalidDay(_))
        ));
        assert!(matches!(
            compose_timestamp("2030-05-01", "quarter past"),
            Err(ScheduleError::InvalidTime(_))
        ));
    }

    #[tokio::test]
    async fn past_timestamp_is_rejected_and_nothing_is_persisted() {
        let store = MemStore::new();
        let err = schedule_message(&store, "too late", "2001-01-01", "00:00")
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::NotInFuture));
        assert!(store.list_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_message_is_persisted_pending() {
        let store = MemStore::new();
        let record = schedule_message(&store, "renewal due", "2100-01-01", "08:00")
            .await
            .unwrap();
        assert_eq!(record.status, MessageStatus::Pending);
        assert!(record.activated_at.is_none());
        assert_eq!(store.list_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_completes_due_messages_including_missed_ones() {
        let store = Arc::new(MemStore::new());
        // Simulates a message whose activation time elapsed while the
        // process was down: already past when the sweeper first runs.
        let missed = store
            .create_message("missed while down", Utc::now() - ChronoDuration::minutes(10))
            .await
            .unwrap();

        let sweeper = MessageSweeper::new(store.clone(), Duration::from_secs(5));
        let claimed = sweeper.sweep_once().await.unwrap();

        assert_eq!(claimed.len(), 1);
        let record = store.get_message(missed.id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Completed);
        assert!(record.activated_at.is_some());
    }

    #[tokio::test]
    async fn sweeper_loop_stops_on_shutdown() {
        let store = Arc::new(MemStore::new());
        let sweeper = MessageSweeper::new(store, Duration::from_millis(10));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(sweeper.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should exit after shutdown")
            .unwrap();
    }
}
