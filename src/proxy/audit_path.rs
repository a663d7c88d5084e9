//! Background consumer that drains audit records off the ring buffer

use crate::log_messages::audit;
use crate::proxy::audit::AuditRecord;
use crate::proxy::ring_buffer::RingBuffer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Drains the ring buffer and emits each record on the `llm_relay::audit` target
pub struct AuditPathProcessor {
    ring_buffer: Arc<RingBuffer>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl AuditPathProcessor {
    pub fn new(ring_buffer: Arc<RingBuffer>) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                ring_buffer,
                shutdown_rx,
            },
            shutdown_tx,
        )
    }

    pub async fn run(mut self) {
        info!("{}", audit::PROCESSOR_STARTED);

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            if self.process_next_record().is_none() {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        }

        // Records queued before shutdown still get emitted.
        while self.process_next_record().is_some() {}

        let stats = self.ring_buffer.stats();
        info!(
            written = stats.total_writes,
            read = stats.total_reads,
            dropped = *stats.dropped_events.as_ref(),
            "{}",
            audit::PROCESSOR_STOPPED
        );
    }

    /// Handle one queued record; `None` when the buffer is empty
    fn process_next_record(&mut self) -> Option<Option<AuditRecord>> {
        let (request_id, data) = self.ring_buffer.read()?;
        debug!(%request_id, "processing audit record");

        match serde_json::from_slice::<AuditRecord>(&data) {
            Ok(record) => {
                emit(&record);
                Some(Some(record))
            }
            Err(e) => {
                warn!(%request_id, error = %e, "{}", audit::UNREADABLE_RECORD);
                Some(None)
            }
        }
    }
}

fn emit(record: &AuditRecord) {
    let notes = serde_json::to_string(&record.notes).unwrap_or_default();
    let elapsed_ms = (record.flushed_at - record.started_at).num_milliseconds();
    info!(
        target: "llm_relay::audit",
        request_id = %record.request_id,
        route = %record.route,
        model = record.model.as_deref().unwrap_or(""),
        session = record.session.as_deref().unwrap_or(""),
        elapsed_ms,
        notes = %notes,
        "request audited"
    );
}
