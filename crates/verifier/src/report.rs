//! Violation reports and the end-of-run summary.

use crate::collect::CollectStats;
use crate::trace::Trace;
use crate::LOG_TARGET;
use common::{FieldRef, ObjectId};
use tracing::warn;

pub const VIOLATION_HEADER: &str =
    "Archive heap points to a static field that may be reinitialized at runtime:";

/// An archived object that is also reachable from a re-initializable static.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub object: ObjectId,
    /// The static field currently holding `object`.
    pub field: FieldRef,
    /// External name of the field's holder class.
    pub holder: String,
    /// Dump of the offending object.
    pub value: String,
    pub trace: Trace,
}

impl Violation {
    /// `Holder::field`, as printed in the report.
    pub fn field_name(&self) -> String {
        format!("{}::{}", self.holder, self.field.name)
    }

    /// The report block for this violation, one entry per log line.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.trace.lines.len() + 5);
        lines.push(VIOLATION_HEADER.to_string());
        lines.push(format!("Field: {}", self.field_name()));
        lines.push(format!("Value: {}", self.value));
        lines.push("--- trace begin ---".to_string());
        lines.extend(self.trace.lines.iter().map(|l| l.to_string()));
        lines.push("--- trace end ---".to_string());
        lines
    }

    /// Emits the report block at warn level.
    pub fn log(&self) {
        for line in self.lines() {
            warn!(target: LOG_TARGET, "{line}");
        }
    }
}

/// Outcome of one verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub archived_objects: usize,
    /// Distinct objects held by recorded static fields.
    pub live_objects: usize,
    pub problems: usize,
    pub violations: Vec<Violation>,
    pub collect: CollectStats,
}

impl VerificationSummary {
    pub fn is_clean(&self) -> bool {
        self.problems == 0
    }

    pub fn summary_line(&self) -> Option<String> {
        summary_line(self.archived_objects, self.problems)
    }
}

/// The closing summary; `None` when nothing was found.
pub fn summary_line(archived_objects: usize, problems: usize) -> Option<String> {
    (problems > 0).then(|| {
        format!(
            "Scanned {archived_objects} objects. Found {problems} case(s) where an object points \
             to a static field that may be reinitialized at runtime."
        )
    })
}
