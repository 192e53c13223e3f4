//! Background cycle loop.
//!
//! Each tick runs one `Orchestrator::run_cycle`, then waits out the cycle
//! interval in short slices so a shutdown request is noticed promptly. An
//! in-flight cycle is never aborted; it stops between items.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{Error, PipelineError};
use crate::pipeline::orchestrator::Orchestrator;

/// Longest single sleep between shutdown checks.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Spawn the engine loop.
///
/// Returns a `JoinHandle` and the shutdown flag; set the flag to stop after the
/// current item.
pub fn spawn_engine(orchestrator: Arc<Orchestrator>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let interval = orchestrator.config().cycle_interval;
        info!("Change intake engine started, cycling every {}s", interval.as_secs());

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let span = info_span!("cycle", cycle_id = %Uuid::new_v4());
            match orchestrator.run_cycle(&shutdown).instrument(span).await {
                Ok(_) => {}
                Err(Error::Pipeline(PipelineError::GuardrailHalted { count, threshold, .. })) => {
                    warn!(count, threshold, "Cycle halted by guardrail; waiting for human review");
                }
                Err(e) => error!("Cycle failed: {e}"),
            }

            if !sleep_unless_shutdown(interval, &shutdown).await {
                break;
            }
        }

        info!("Change intake engine shutting down");
    });

    (handle, shutdown_flag)
}

/// Sleep for `total`, waking early on shutdown. Returns `false` if shutdown was requested.
async fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(SHUTDOWN_POLL);
        tokio::time::sleep(slice).await;
        remaining -= slice;
    }
    !shutdown.load(Ordering::SeqCst)
}
