use std::fmt;

use tracing::{info, warn};

/// One cleanup action that failed. Kept for the summary, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub action: String,
    pub error: String,
}

/// Outcome of an ordered list of independent cleanup actions.
///
/// Every action is attempted; failures are logged as they happen and
/// collected here so teardown can keep going.
#[derive(Debug)]
#[must_use]
pub struct CleanupReport {
    resource: String,
    failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            failures: Vec::new(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Record the result of one action. Returns whether it succeeded.
    pub fn record<E: fmt::Display>(&mut self, action: &str, result: Result<(), E>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(resource = %self.resource, action, error = %e, "cleanup action failed");
                self.failures.push(CleanupFailure {
                    action: action.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Fold a nested report in; its actions are prefixed with its resource.
    pub fn merge(&mut self, other: CleanupReport) {
        let CleanupReport { resource, failures } = other;
        self.failures
            .extend(failures.into_iter().map(|f| CleanupFailure {
                action: format!("{resource}: {}", f.action),
                error: f.error,
            }));
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }

    /// Log the one-line summary and hand the report back.
    pub fn finish(self) -> Self {
        if self.is_clean() {
            info!(resource = %self.resource, "cleanup complete");
        } else {
            let actions: Vec<&str> = self.failures.iter().map(|f| f.action.as_str()).collect();
            warn!(
                resource = %self.resource,
                failed = self.failures.len(),
                actions = %actions.join(", "),
                "cleanup finished with failures"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_only_failures() {
        let mut report = CleanupReport::new("rft-node-1");
        assert!(report.record::<String>("destroy", Ok(())));
        assert!(!report.record("undefine", Err("no such domain")));
        assert_eq!(
            report.failures(),
            &[CleanupFailure {
                action: "undefine".into(),
                error: "no such domain".into(),
            }]
        );
        assert!(!report.is_clean());
    }

    #[test]
    fn merge_prefixes_actions() {
        let mut suite = CleanupReport::new("suite");
        let mut net = CleanupReport::new("rft-net-1");
        let _ = net.record("destroy", Err("not running"));
        suite.merge(net);
        let _ = suite.record::<&str>("delete workdir", Ok(()));
        let report = suite.finish();
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures().first().map(|f| f.action.as_str()), Some("rft-net-1: destroy"));
        assert_eq!(report.resource(), "suite");
    }

    #[test]
    fn empty_report_is_clean() {
        assert!(CleanupReport::new("x").finish().is_clean());
    }
}
