//! Archive Scanner.
//!
//! One read-only pass over the archive: every archived object whose identity
//! is in the live object registry is a violation. Violations are logged as
//! they are found and scanning continues.

use crate::report::Violation;
use crate::trace::trace_to_root;
use crate::VerifierConfig;
use common::registry::LiveObjectRegistry;
use common::{external_name, ArchiveView, ClassUniverse, ObjectModel};

/// Result of a single scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Objects visited.
    pub archived_objects: usize,
    pub violations: Vec<Violation>,
}

impl ScanOutcome {
    pub fn problems(&self) -> usize {
        self.violations.len()
    }
}

/// Scans every archived object against `registry`.
pub fn scan_archive<H, A>(
    heap: &H,
    archive: &A,
    registry: &LiveObjectRegistry,
    config: &VerifierConfig,
) -> ScanOutcome
where
    H: ClassUniverse + ObjectModel + ?Sized,
    A: ArchiveView + ?Sized,
{
    let mut outcome = ScanOutcome::default();

    archive.objects_do(&mut |obj, info| {
        outcome.archived_objects += 1;

        let Some(field) = registry.get(obj) else {
            return;
        };
        let violation = Violation {
            object: obj,
            field: field.clone(),
            holder: external_name(heap.class_name(field.holder)),
            value: heap.describe(obj),
            trace: trace_to_root(heap, archive, obj, info, config.max_trace_depth),
        };
        violation.log();
        outcome.violations.push(violation);
    });

    outcome
}
