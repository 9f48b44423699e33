//! Decoupled persistence: a bounded in-memory queue feeding a batched
//! writer against the embedded store.
//!
//! Enqueueing never blocks a request handler; when the queue is full the
//! record is dropped and logged. The writer flushes on batch size, on a
//! timeout with items buffered, and once more on shutdown.

use crate::logging::SharedLogger;
use crate::normalize::Conversation;
use crate::store::{self, Database};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub id: String,
    pub model: String,
    pub conversation: Conversation,
    pub timestamp: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(id: impl Into<String>, model: impl Into<String>, conversation: Conversation) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            conversation,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
        }
    }
}

/// Cloneable, non-blocking handle to the persistence queue.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<ConversationRecord>,
    logger: SharedLogger,
}

impl QueueHandle {
    /// Enqueue a finalized conversation. Failure is logged and swallowed:
    /// the client response is never affected by persistence.
    pub fn enqueue(&self, record: ConversationRecord) {
        if let Err(err) = self.tx.try_send(record) {
            let record = match &err {
                mpsc::error::TrySendError::Full(r) => r,
                mpsc::error::TrySendError::Closed(r) => r,
            };
            self.logger.error(
                "persist",
                format!("Dropping conversation {}: queue unavailable ({err})", record.id),
            );
        }
    }
}

/// Spawn the batch-writer task. Returns the queue handle and the task
/// handle; flip the watch channel to `true` to drain and stop.
pub fn spawn_writer(
    db: Database,
    logger: SharedLogger,
    options: WriterOptions,
    mut shutdown: watch::Receiver<bool>,
) -> (QueueHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ConversationRecord>(QUEUE_CAPACITY);
    let handle_logger = logger.clone();

    let task = tokio::spawn(async move {
        let mut batch: Vec<ConversationRecord> = Vec::with_capacity(options.batch_size);
        let mut last_flush = Instant::now();
        let tick = options.batch_timeout.min(Duration::from_secs(1)).max(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= options.batch_size {
                            flush(&db, &logger, std::mem::take(&mut batch)).await;
                            last_flush = Instant::now();
                        }
                    }
                    // All senders dropped: nothing more will arrive
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() && last_flush.elapsed() >= options.batch_timeout {
                        flush(&db, &logger, std::mem::take(&mut batch)).await;
                        last_flush = Instant::now();
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        // Final drain: one last batch with whatever is still queued
        while let Ok(record) = rx.try_recv() {
            batch.push(record);
        }
        if !batch.is_empty() {
            flush(&db, &logger, batch).await;
        }
        logger.info("persist", "Batch writer stopped");
    });

    (
        QueueHandle {
            tx,
            logger: handle_logger,
        },
        task,
    )
}

/// One flush: open a connection, insert each record inside a single
/// transaction, commit, close. A single record's failure (typically a
/// duplicate id) is logged and skipped.
async fn flush(db: &Database, logger: &SharedLogger, batch: Vec<ConversationRecord>) {
    let db = db.clone();
    let logger_in = logger.clone();
    let total = batch.len();

    let result = tokio::task::spawn_blocking(move || {
        let mut conn = match db.open() {
            Ok(conn) => conn,
            Err(e) => {
                logger_in.error("persist", format!("Failed to open store: {e}"));
                return 0usize;
            }
        };

        // One transaction per flush; a failed row is logged and skipped
        // without losing the rest of the batch
        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                logger_in.error("persist", format!("Failed to start transaction: {e}"));
                return 0usize;
            }
        };

        let mut saved = 0usize;
        for record in &batch {
            let conversation_json = match serde_json::to_string(&record.conversation) {
                Ok(json) => json,
                Err(e) => {
                    logger_in.error(
                        "persist",
                        format!("Failed to serialize conversation {}: {e}", record.id),
                    );
                    continue;
                }
            };
            match store::insert_interaction(
                &tx,
                &record.id,
                &record.model,
                &conversation_json,
                record.timestamp,
            ) {
                Ok(()) => saved += 1,
                Err(e) => logger_in.error(
                    "persist",
                    format!("Failed to save conversation {}: {e}", record.id),
                ),
            }
        }

        if let Err(e) = tx.commit() {
            logger_in.error("persist", format!("Failed to commit batch: {e}"));
            return 0usize;
        }
        saved
    })
    .await;

    match result {
        Ok(saved) => logger.info("persist", format!("Flushed {saved}/{total} conversations")),
        Err(e) => logger.error("persist", format!("Flush task panicked: {e}")),
    }
}
