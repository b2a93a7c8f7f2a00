use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::DetectionEvent;
use crate::detection::{Engine, EngineError};
use crate::store::SessionRecorder;

/// Counters reported when the pipeline shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub events: u64,
    pub alerts: u64,
    pub persistence_errors: u64,
    pub record_errors: u64,
}

/// Read newline-delimited JSON events and forward them to the pipeline.
/// Blank lines are skipped; malformed lines are logged and counted.
/// Returns the number of malformed lines once the reader is exhausted or
/// the pipeline has gone away.
pub async fn read_events<R>(reader: R, tx: mpsc::Sender<DetectionEvent>) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut malformed = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<DetectionEvent>(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    info!("Pipeline channel closed, stopping reader");
                    break;
                }
            }
            Err(e) => {
                malformed += 1;
                warn!(line = line_no, "Skipping malformed event: {e}");
            }
        }
    }
    Ok(malformed)
}

/// Run the pipeline: evaluate each event, then record it into session history.
///
/// Events are handled in arrival order so every evaluation sees the history
/// of the events before it.
pub async fn run_pipeline(
    mut rx: mpsc::Receiver<DetectionEvent>,
    engine: Arc<Engine>,
    recorder: Arc<dyn SessionRecorder>,
) -> PipelineSummary {
    let mut summary = PipelineSummary::default();

    info!("Pipeline started, waiting for session events...");

    while let Some(event) = rx.recv().await {
        match engine.evaluate(&event).await {
            Ok(alerts) => summary.alerts += alerts.len() as u64,
            Err(EngineError::Persistence { alerts, failures }) => {
                summary.alerts += alerts.len() as u64;
                summary.persistence_errors += failures.len() as u64;
                for failure in &failures {
                    warn!(user_id = event.user_id, "{failure}");
                }
            }
            Err(e) => {
                summary.persistence_errors += 1;
                warn!(user_id = event.user_id, "Evaluation failed: {e}");
            }
        }

        if let Err(e) = recorder.record_event(&event).await {
            summary.record_errors += 1;
            warn!(session = %event.session_key, "Failed to record session event: {e}");
        }

        summary.events += 1;
        if summary.events % 1000 == 0 {
            info!("Pipeline processed {} events, {} alerts", summary.events, summary.alerts);
        } else {
            debug!(user_id = event.user_id, session = %event.session_key, state = ?event.state, "Event processed");
        }
    }

    info!(
        "Pipeline shutting down after {} events, {} alerts",
        summary.events, summary.alerts
    );
    summary
}
