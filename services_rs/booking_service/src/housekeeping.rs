//! Background sweeps: stale reservations, finished rentals, orphaned captures
//! and in-flight refunds.

use crate::engine::BookingEngine;
use crate::error::EngineError;
use crate::refunds::RefundTracker;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub completed: usize,
    pub orphan_refunds: usize,
}

pub async fn run_sweep_once(
    engine: &BookingEngine,
    refunds: &RefundTracker,
) -> Result<SweepReport, EngineError> {
    let expired = engine.expire_stale().await?.len();
    let completed = engine.complete_finished().await?.len();
    let orphan_refunds = refunds.refund_orphaned_captures().await?;
    Ok(SweepReport {
        expired,
        completed,
        orphan_refunds,
    })
}

pub fn spawn_sweeper(engine: Arc<BookingEngine>, refunds: RefundTracker, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match run_sweep_once(&engine, &refunds).await {
                Ok(report) if report != SweepReport::default() => {
                    tracing::info!(
                        expired = report.expired,
                        completed = report.completed,
                        orphan_refunds = report.orphan_refunds,
                        "housekeeping sweep"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "housekeeping sweep failed"),
            }
        }
    });
}

pub fn spawn_refund_poller(refunds: RefundTracker, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match refunds.poll_in_flight().await {
                Ok(0) => {}
                Ok(advanced) => tracing::info!(advanced, "refund poll advanced refunds"),
                Err(e) => tracing::error!(error = %e, "refund poll failed"),
            }
        }
    });
}
