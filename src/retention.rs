//! Storage accounting and retention policies
//!
//! [`RetentionEnforcer::usage`] walks the control directory and the tracked
//! tree, so it costs O(files) and is meant for periodic use rather than after
//! every write. [`RetentionEnforcer::enforce`] applies one [`StoragePolicy`]:
//!
//! | Policy        | Over the limit                                  | Past the warning threshold |
//! |---------------|-------------------------------------------------|----------------------------|
//! | max size      | delete versions older than 30 days, alert       | `ApproachingLimit` alert   |
//! | max age       | delete every version older than the limit       | n/a                        |
//! | max versions  | delete the oldest surplus, newest `N` kept      | `ApproachingLimit` alert   |
//!
//! Enforcement is best-effort. A deletion that fails is logged and recorded
//! in [`CleanupReport::errors`] and the pass continues with the next version.
//! Every file version is eligible for cleanup on equal terms; whole-space
//! versions are never removed here.

use crate::error::Result;
use crate::snapshot::is_control_entry;
use crate::space::Space;
use crate::store::VersionStore;
use crate::types::{
    AlertHandler, CleanupReport, FileVersion, PolicyKind, PolicyOutcome, StorageAlert,
    StoragePolicy, StorageUsage,
};
use crate::utils::{dir_size, format_bytes};
use chrono::Utc;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Age past which a max-size policy deletes versions once over its limit
pub const CLEANUP_HORIZON_DAYS: i64 = 30;

/// Applies storage policies to spaces
#[derive(Clone)]
pub struct RetentionEnforcer {
    store: VersionStore,
    alerts: Option<AlertHandler>,
}

impl fmt::Debug for RetentionEnforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionEnforcer")
            .field("store", &self.store)
            .field("alerts", &self.alerts.is_some())
            .finish()
    }
}

impl RetentionEnforcer {
    /// Create an enforcer deleting through `store`
    pub fn new(store: VersionStore) -> Self {
        Self { store, alerts: None }
    }

    /// Deliver alerts to `handler` in addition to the log
    pub fn with_alert_handler(mut self, handler: AlertHandler) -> Self {
        self.alerts = Some(handler);
        self
    }

    /// Measure the space
    #[instrument(skip(self, space), fields(space = ?space.root()))]
    pub fn usage(&self, space: &Space) -> Result<StorageUsage> {
        let control_bytes = dir_size(&space.control_dir(), &|_| false);
        let original_bytes = dir_size(space.root(), &is_control_entry);
        let versions = self.store.index().load_all(space)?;

        let oldest = versions.iter().map(|v| v.timestamp).min();
        let newest = versions.iter().map(|v| v.timestamp).max();
        let utilization = if original_bytes == 0 {
            0.0
        } else {
            control_bytes as f64 / original_bytes as f64
        };

        Ok(StorageUsage {
            space_path: space.root().to_path_buf(),
            total_bytes: control_bytes + original_bytes,
            control_bytes,
            original_bytes,
            version_count: versions.len(),
            oldest,
            newest,
            utilization,
        })
    }

    /// Apply `policy` to `space`
    #[instrument(skip(self, space), fields(space = ?space.root()))]
    pub fn enforce(&self, space: &Space, policy: &StoragePolicy) -> Result<PolicyOutcome> {
        if !policy.enabled {
            return Ok(PolicyOutcome::Skipped("policy disabled".to_string()));
        }
        policy.validate()?;

        match policy.kind {
            PolicyKind::MaxSize(limit) => self.enforce_size(space, limit, policy.warning_threshold),
            PolicyKind::MaxAge(days) => {
                let report = match chrono::Duration::try_days(days as i64) {
                    Some(age) => self.cleanup_older_than(space, age)?,
                    None => CleanupReport::default(),
                };
                if report.removed_versions == 0 && report.is_clean() {
                    Ok(PolicyOutcome::Compliant(format!("no versions older than {} days", days)))
                } else {
                    Ok(PolicyOutcome::Enforced(report))
                }
            }
            PolicyKind::MaxVersions(limit) => {
                self.enforce_count(space, limit, policy.warning_threshold)
            }
        }
    }

    fn enforce_size(&self, space: &Space, limit: u64, threshold: f64) -> Result<PolicyOutcome> {
        let usage = self.usage(space)?;
        let fraction = usage.control_bytes as f64 / limit as f64;

        if usage.control_bytes >= limit {
            let report =
                self.cleanup_older_than(space, chrono::Duration::days(CLEANUP_HORIZON_DAYS))?;
            self.raise(space, StorageAlert::LimitExceeded);
            info!("Size limit reached for {:?}: {}", space.root(), report.summary());
            return Ok(PolicyOutcome::Enforced(report));
        }

        let message = format!(
            "{} of {} used ({:.0}%)",
            format_bytes(usage.control_bytes),
            format_bytes(limit),
            fraction * 100.0
        );
        if fraction >= threshold {
            self.raise(space, StorageAlert::ApproachingLimit(fraction));
            Ok(PolicyOutcome::Warning(message))
        } else {
            Ok(PolicyOutcome::Compliant(message))
        }
    }

    fn enforce_count(&self, space: &Space, limit: usize, threshold: f64) -> Result<PolicyOutcome> {
        let mut versions = self.store.index().load_all(space)?;
        let count = versions.len();

        if count > limit {
            versions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
            versions.truncate(count - limit);
            let report = self.delete_all(space, versions);
            info!(
                "Version limit {} exceeded for {:?}: {}",
                limit,
                space.root(),
                report.summary()
            );
            return Ok(PolicyOutcome::Enforced(report));
        }

        let fraction = count as f64 / limit as f64;
        let message = format!("{} of {} versions", count, limit);
        if fraction >= threshold {
            self.raise(space, StorageAlert::ApproachingLimit(fraction));
            Ok(PolicyOutcome::Warning(message))
        } else {
            Ok(PolicyOutcome::Compliant(message))
        }
    }

    /// Delete every file version older than `age`
    ///
    /// An age reaching past the earliest representable time matches nothing.
    pub fn cleanup_older_than(&self, space: &Space, age: chrono::Duration) -> Result<CleanupReport> {
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            debug!("No representable cutoff {} before now", age);
            return Ok(CleanupReport::default());
        };
        let expired: Vec<FileVersion> = self
            .store
            .index()
            .load_all(space)?
            .into_iter()
            .filter(|v| v.timestamp < cutoff)
            .collect();
        debug!("{} versions older than {}", expired.len(), cutoff);
        Ok(self.delete_all(space, expired))
    }

    fn delete_all(&self, space: &Space, versions: Vec<FileVersion>) -> CleanupReport {
        let mut report = CleanupReport::default();
        for version in versions {
            match self.store.delete_version(space, &version) {
                Ok(freed) => {
                    report.removed_versions += 1;
                    report.freed_bytes += freed;
                }
                Err(e) => {
                    warn!("Could not delete version {}: {}", version.short_id(), e);
                    report.errors.push(format!("{}: {}", version.short_id(), e));
                }
            }
        }
        report
    }

    fn raise(&self, space: &Space, alert: StorageAlert) {
        match alert {
            StorageAlert::ApproachingLimit(fraction) => warn!(
                "Storage for {:?} at {:.0}% of its limit",
                space.root(),
                fraction * 100.0
            ),
            StorageAlert::LimitExceeded => {
                warn!("Storage for {:?} exceeded its limit", space.root())
            }
        }
        if let Some(handler) = &self.alerts {
            handler(space.root(), alert);
        }
    }

    /// Enforce `policy` on `space` every `every`, starting immediately
    ///
    /// Each pass runs on the blocking pool. Abort the returned handle to
    /// stop. Must be called from within a tokio runtime.
    pub fn spawn_periodic(&self, space: Space, policy: StoragePolicy, every: Duration) -> JoinHandle<()> {
        let enforcer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pass = enforcer.clone();
                let target = space.clone();
                match tokio::task::spawn_blocking(move || pass.enforce(&target, &policy)).await {
                    Ok(Ok(outcome)) => debug!("Periodic retention for {:?}: {:?}", space.root(), outcome),
                    Ok(Err(e)) => warn!("Periodic retention for {:?} failed: {}", space.root(), e),
                    Err(e) => warn!("Periodic retention task for {:?} aborted: {}", space.root(), e),
                }
            }
        })
    }
}
