//! Periodic position publication.
//!
//! Samples the configured supplier once per interval and emits a one-way
//! `PositionReport`. A failing supplier re-sends the last known position;
//! with no position at all the cycle is skipped.

use crate::bus::RequestSender;
use crate::config::PositionSupplier;
use crate::error::ClientError;
use parking_lot::Mutex;
use sn_protocol::{ConnectionMessage, PositionReport, PositionTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Pick what to report this cycle and update the last-known cell.
fn next_report(
    sample: Result<PositionTime, String>,
    last: &Mutex<Option<PositionTime>>,
) -> Option<PositionTime> {
    match sample {
        Ok(position) => {
            *last.lock() = Some(position);
            Some(position)
        }
        Err(reason) => {
            let previous = *last.lock();
            match previous {
                Some(position) => {
                    warn!(%reason, "position supplier failed, re-sending last position");
                    Some(position)
                }
                None => {
                    debug!(%reason, "position supplier failed and no previous fix, skipping");
                    None
                }
            }
        }
    }
}

pub(crate) async fn run_position_task(
    sender: RequestSender,
    supplier: Arc<PositionSupplier>,
    last: Arc<Mutex<Option<PositionTime>>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let Some(position) = next_report((*supplier)(), &last) else { continue };
                let report = ConnectionMessage::PositionReport(PositionReport { position });
                match sender.send_one_way(&report) {
                    Ok(()) => {}
                    Err(ClientError::Closed) => return,
                    Err(e) => warn!(error = %e, "position report not sent"),
                }
            }
        }
    }
}
