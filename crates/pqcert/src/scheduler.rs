//! Background certificate renewal scheduler
//!
//! Periodically scans the record store and re-issues certificates that are
//! close to expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::service::{CertificateService, RenewalReport};

/// Default check interval (12 hours)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 hour)
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Background certificate renewal scheduler
///
/// Each pass renews every record expiring within the threshold, then drops
/// expired challenges and records.
pub struct RenewalScheduler {
    service: Arc<CertificateService>,
    threshold_days: u32,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(service: Arc<CertificateService>, threshold_days: u32) -> Self {
        Self {
            service,
            threshold_days,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the check interval
    ///
    /// Clamped to a minimum of 1 hour.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run the scheduler loop forever; the first pass runs immediately
    pub async fn run(self) {
        info!(
            check_interval_hours = self.check_interval.as_secs() / 3600,
            threshold_days = self.threshold_days,
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            debug!("Running scheduled certificate renewal check");
            self.run_once().await;
        }
    }

    /// One renewal and cleanup pass
    pub async fn run_once(&self) -> Option<RenewalReport> {
        let start = Instant::now();

        let report = match self.service.renew_expiring(self.threshold_days).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Certificate renewal check failed");
                return None;
            }
        };

        if let Err(e) = self.service.cleanup() {
            warn!(error = %e, "Expired state cleanup failed");
        }

        if !report.is_empty() {
            info!(
                renewed = report.renewed.len(),
                failed = report.failed.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Renewal pass completed"
            );
        }
        Some(report)
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("threshold_days", &self.threshold_days)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}
