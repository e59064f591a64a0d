//! Daily trigger for the autopost pipeline.
//!
//! A sleep loop recomputes the next wall-clock occurrence of the posting
//! time in the configured zone from "now" on every wake-up, so firings
//! missed during downtime coalesce into a single run instead of replaying.
//! A compare-and-swap gate guarantees at most one active pipeline instance;
//! manual triggers go through the same gate.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Snapshot of scheduler state for the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerState {
    pub running: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub posting_time: String,
    pub timezone: String,
}

/// Releases the single-instance gate when dropped.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    posting_time: String,
    hour: u32,
    minute: u32,
    timezone: Tz,
    running: Arc<AtomicBool>,
    next_run_at: RwLock<Option<DateTime<Utc>>>,
}

fn parse_posting_time(time: &str) -> Result<(u32, u32)> {
    let re = Regex::new(r"^([01]?[0-9]|2[0-3]):([0-5][0-9])$").expect("static regex");
    let caps = re
        .captures(time)
        .ok_or_else(|| anyhow!("invalid posting time '{time}', expected HH:MM"))?;
    Ok((caps[1].parse()?, caps[2].parse()?))
}

impl Scheduler {
    pub fn new(posting_time: &str, timezone: &str) -> Result<Self> {
        let (hour, minute) = parse_posting_time(posting_time)?;
        let Ok(timezone) = timezone.parse::<Tz>() else {
            bail!("unknown timezone '{timezone}'");
        };

        info!(
            "scheduler configured: {:02}:{:02} {}",
            hour, minute, timezone
        );

        Ok(Self {
            posting_time: posting_time.to_string(),
            hour,
            minute,
            timezone,
            running: Arc::new(AtomicBool::new(false)),
            next_run_at: RwLock::new(None),
        })
    }

    /// Next occurrence of the posting time strictly after `now`.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.timezone);
        let mut date = local_now.date_naive();

        for _ in 0..3 {
            let candidate = self
                .timezone
                .with_ymd_and_hms(date.year(), date.month(), date.day(), self.hour, self.minute, 0)
                .earliest();

            if let Some(candidate) = candidate {
                let candidate_utc = candidate.with_timezone(&Utc);
                if candidate_utc > now {
                    return candidate_utc;
                }
            }
            date += ChronoDuration::days(1);
        }

        // Unreachable for any real timezone; fall back to a day from now
        now + ChronoDuration::days(1)
    }

    /// Claim the single-instance gate. `None` means a run is already
    /// active and this trigger is dropped.
    pub fn try_begin_run(&self) -> Option<RunGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(RunGuard {
                flag: self.running.clone(),
            })
        } else {
            warn!("pipeline already running, trigger suppressed");
            None
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            running: self.is_running(),
            next_run_at: *self.next_run_at.read(),
            posting_time: self.posting_time.clone(),
            timezone: self.timezone.to_string(),
        }
    }

    /// Run forever, firing the pipeline once per day. Pipeline panics are
    /// contained by the spawned task; errors are already reported by the
    /// orchestrator's notifier.
    pub async fn run_loop(
        self: Arc<Self>,
        pipeline: Arc<crate::pipeline::DailyPipeline>,
    ) {
        loop {
            let next = self.next_occurrence(Utc::now());
            *self.next_run_at.write() = Some(next);

            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            info!(
                "next pipeline run at {} (in {:.0} min)",
                next,
                wait.as_secs_f64() / 60.0
            );
            tokio::time::sleep(wait).await;

            match self.try_begin_run() {
                Some(guard) => {
                    let result = pipeline.run(None).await;
                    if result.success {
                        info!(
                            "scheduled run finished: {} products in {:.0} ms",
                            result.products_count, result.total_duration_ms
                        );
                    } else {
                        error!(
                            "scheduled run failed at {:?}: {}",
                            result.failed_stage(),
                            result.error.as_deref().unwrap_or("unknown")
                        );
                    }
                    drop(guard);
                }
                None => {
                    // A manual run is still active; this firing coalesces away
                    warn!("scheduled firing suppressed, pipeline busy");
                }
            }
        }
    }
}
