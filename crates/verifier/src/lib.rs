//! # Archive Heap Verifier
//!
//! **Role**: Before an archived object graph is trusted for reuse by later
//! processes, checks that no archived object is also the current value of a
//! static field that the next process will compute afresh. If it were, code
//! reading the archived object and code reading the static would disagree.
//!
//! **Pipeline** (one synchronous pass):
//! 1. [`collect`]: index every non-excluded static object field by the
//!    identity of the object it holds.
//! 2. [`scan`]: look up every archived object in that index.
//! 3. [`trace`]: for each hit, render the referrer chain from the nearest root.
//! 4. [`report`]: one warn-level block per violation, plus a closing summary.
//!
//! Violations are advisory. Nothing here fails; findings are returned as data
//! and logged under the `heap_verify` target.

pub mod collect;
pub mod report;
pub mod scan;
pub mod trace;

pub use collect::{collect_static_fields, CollectStats, SkipReason};
pub use report::{VerificationSummary, Violation};
pub use scan::{scan_archive, ScanOutcome};
pub use trace::{trace_to_root, Trace, TraceLine, TraceNode};

use common::exclusions::ExclusionTable;
use common::registry::LiveObjectRegistry;
use common::{ArchiveView, ClassUniverse, ObjectModel};
use tracing::warn;

/// `tracing` target for everything the verifier logs.
pub const LOG_TARGET: &str = "heap_verify";

/// Default bound on referrer hops followed by the provenance trace.
pub const DEFAULT_MAX_TRACE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Maximum referrer hops per trace. `None` trusts the archive builder's
    /// acyclic-chain guarantee completely.
    pub max_trace_depth: Option<usize>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_trace_depth: Some(DEFAULT_MAX_TRACE_DEPTH),
        }
    }
}

/// Everything the verifier needs to know about the live heap.
pub trait HeapModel: ClassUniverse + ObjectModel {}

impl<T: ClassUniverse + ObjectModel + ?Sized> HeapModel for T {}

/// One verification run over a fixed class universe.
///
/// The registry is built in [`HeapVerifier::new`] and frozen afterwards.
/// When dropped with problems outstanding, logs the summary line.
pub struct HeapVerifier<'h, H: HeapModel + ?Sized> {
    heap: &'h H,
    registry: LiveObjectRegistry,
    stats: CollectStats,
    config: VerifierConfig,
    archived_objects: usize,
    problems: usize,
}

impl<'h, H: HeapModel + ?Sized> HeapVerifier<'h, H> {
    /// Collects the static fields of every loaded class.
    pub fn new(heap: &'h H, exclusions: ExclusionTable, config: VerifierConfig) -> Self {
        let (registry, stats) = collect_static_fields(heap, &exclusions);
        Self {
            heap,
            registry,
            stats,
            config,
            archived_objects: 0,
            problems: 0,
        }
    }

    /// Scans `archive`, returning the violations found in this pass.
    pub fn scan<A: ArchiveView + ?Sized>(&mut self, archive: &A) -> Vec<Violation> {
        let outcome = scan_archive(self.heap, archive, &self.registry, &self.config);
        self.archived_objects += outcome.archived_objects;
        self.problems += outcome.problems();
        outcome.violations
    }

    pub fn registry(&self) -> &LiveObjectRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &CollectStats {
        &self.stats
    }

    pub fn archived_objects(&self) -> usize {
        self.archived_objects
    }

    pub fn problems(&self) -> usize {
        self.problems
    }
}

impl<H: HeapModel + ?Sized> Drop for HeapVerifier<'_, H> {
    fn drop(&mut self) {
        if let Some(line) = report::summary_line(self.archived_objects, self.problems) {
            warn!(target: LOG_TARGET, "{line}");
        }
    }
}

/// Verifies `archive` against `heap` with the built-in exclusions and default
/// configuration.
pub fn verify<H, A>(heap: &H, archive: &A) -> VerificationSummary
where
    H: HeapModel + ?Sized,
    A: ArchiveView + ?Sized,
{
    verify_with(heap, archive, ExclusionTable::builtin(), VerifierConfig::default())
}

pub fn verify_with<H, A>(
    heap: &H,
    archive: &A,
    exclusions: ExclusionTable,
    config: VerifierConfig,
) -> VerificationSummary
where
    H: HeapModel + ?Sized,
    A: ArchiveView + ?Sized,
{
    let mut verifier = HeapVerifier::new(heap, exclusions, config);
    let violations = verifier.scan(archive);
    VerificationSummary {
        archived_objects: verifier.archived_objects(),
        live_objects: verifier.registry().len(),
        problems: verifier.problems(),
        violations,
        collect: *verifier.stats(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::exclusions::Rationale;
    use common::snapshot::{ClassRecord, FieldRecord, HeapSnapshot, LoadedHeap, ObjectRecord};
    use common::{ClassKind, FieldType, ObjectId};
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl LogBuffer {
        /// Messages logged at warn or above under the verifier's target.
        fn verifier_lines(&self) -> Vec<String> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .filter_map(|l| l.trim_start().strip_prefix("heap_verify: "))
                .map(str::to_string)
                .collect()
        }
    }

    fn warn_subscriber(buffer: &LogBuffer) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .without_time()
            .with_level(false)
            .with_target(true)
            .finish()
    }

    /// `Foo::bar` and `Foo::baz` both point into the archive.
    fn foo_heap() -> LoadedHeap {
        let mut snapshot = HeapSnapshot::new();
        snapshot
            .add_class(
                ClassRecord::new("Foo")
                    .with_field(FieldRecord::static_ref("bar", Some(0x1)))
                    .with_field(FieldRecord::static_ref("baz", Some(0x2))),
            )
            .add_class(ClassRecord::new("Obj"))
            .add_object(ObjectRecord::new(0x1, "Obj"))
            .add_object(ObjectRecord::new(0x2, "Obj"))
            .archive(0x1, None)
            .archive(0x2, None);
        snapshot.load().unwrap()
    }

    #[test]
    fn test_excluded_field_is_not_flagged() {
        let heap = foo_heap();
        let mut exclusions = ExclusionTable::empty();
        exclusions.add("Foo", Rationale::Structural, ["bar"]);

        let summary = verify_with(&heap, &heap, exclusions, VerifierConfig::default());
        assert_eq!(summary.problems, 1);
        assert_eq!(summary.archived_objects, 2);
        assert_eq!(summary.violations[0].object, ObjectId(0x2));
        assert_eq!(summary.violations[0].field_name(), "Foo::baz");
        assert_eq!(
            summary.violations[0].lines()[1],
            "Field: Foo::baz".to_string()
        );
    }

    #[test]
    fn test_unarchived_static_is_clean() {
        let mut snapshot = HeapSnapshot::new();
        snapshot
            .add_class(ClassRecord::new("Lonely").with_field(FieldRecord::static_ref("z", Some(9))))
            .add_object(ObjectRecord::new(9, "Lonely"))
            .add_object(ObjectRecord::new(10, "Lonely"))
            .archive(10, None);
        let heap = snapshot.load().unwrap();

        let summary = verify(&heap, &heap);
        assert!(summary.is_clean());
        assert!(summary.violations.is_empty());
        assert_eq!(summary.summary_line(), None);
        assert_eq!(summary.collect.recorded, 1);
        assert_eq!(summary.live_objects, 1);
    }

    #[test]
    fn test_trace_through_fields_and_arrays() {
        // root --table--> P --[2]--> Q --value--> W, and Holder::cache == W
        let mut snapshot = HeapSnapshot::new();
        snapshot
            .add_class(
                ClassRecord::new("app/Root")
                    .as_subgraph_root()
                    .with_field(FieldRecord::static_ref("archivedRoot", Some(0x100)))
                    .with_field(FieldRecord::instance("table", FieldType::Array)),
            )
            .add_class(ClassRecord::new("[Lapp/Entry;").with_kind(ClassKind::ObjectArray))
            .add_class(
                ClassRecord::new("app/Entry")
                    .with_field(FieldRecord::instance("key", FieldType::Object))
                    .with_field(FieldRecord::instance("value", FieldType::Object)),
            )
            .add_class(ClassRecord::new("app/Holder").with_field(FieldRecord::static_ref("cache", Some(0x400))))
            .add_class(ClassRecord::new("app/Cache"))
            .add_object(ObjectRecord::new(0x100, "app/Root").with_field("table", 0x200))
            .add_object(
                ObjectRecord::new(0x200, "[Lapp/Entry;").with_elements(vec![None, None, Some(0x300)]),
            )
            .add_object(ObjectRecord::new(0x300, "app/Entry").with_field("value", 0x400))
            .add_object(ObjectRecord::new(0x400, "app/Cache"))
            .archive(0x100, None)
            .archive(0x200, Some(0x100))
            .archive(0x300, Some(0x200))
            .archive(0x400, Some(0x300));
        let heap = snapshot.load().unwrap();

        let summary = verify(&heap, &heap);
        assert_eq!(summary.problems, 1);
        let violation = &summary.violations[0];
        assert_eq!(violation.field_name(), "app.Holder::cache");

        let rendered: Vec<String> = violation.trace.lines.iter().map(|l| l.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "[ 0] 0x0000000000000100 app/Root::table (offset = 1)",
                "[ 1] 0x0000000000000200 [Lapp/Entry; @[2]",
                "[ 2] 0x0000000000000300 app/Entry::value (offset = 1)",
                "[ 3] 0x0000000000000400 app/Cache",
            ]
        );
        assert_eq!(violation.trace.depth, 3);
    }

    #[test]
    fn test_builtin_exclusions_apply() {
        let mut snapshot = HeapSnapshot::new();
        snapshot
            .add_class(
                ClassRecord::new("java/util/HashSet")
                    .with_field(FieldRecord::static_ref("PRESENT", Some(1))),
            )
            .add_class(ClassRecord::new("java/lang/Object"))
            .add_object(ObjectRecord::new(1, "java/lang/Object"))
            .archive(1, None);
        let heap = snapshot.load().unwrap();

        assert!(verify(&heap, &heap).is_clean());
        assert_eq!(
            verify_with(&heap, &heap, ExclusionTable::empty(), VerifierConfig::default()).problems,
            1
        );
    }

    #[test]
    fn test_verifier_accumulates_across_scans() {
        let mut snapshot = HeapSnapshot::new();
        snapshot
            .add_class(ClassRecord::new("G").with_field(FieldRecord::static_ref("g", Some(1))))
            .add_object(ObjectRecord::new(1, "G"))
            .archive(1, None);
        let heap = snapshot.load().unwrap();

        let mut verifier = HeapVerifier::new(&heap, ExclusionTable::empty(), VerifierConfig::default());
        assert_eq!(verifier.registry().len(), 1);
        assert_eq!(verifier.scan(&heap).len(), 1);
        assert_eq!(verifier.scan(&heap).len(), 1);
        assert_eq!(verifier.archived_objects(), 2);
        assert_eq!(verifier.problems(), 2);
    }

    #[test]
    fn test_default_config_bounds_traces() {
        assert_eq!(
            VerifierConfig::default().max_trace_depth,
            Some(DEFAULT_MAX_TRACE_DEPTH)
        );
    }

    #[test]
    fn test_violation_block_logged_and_summary_on_drop() {
        let heap = foo_heap();
        let mut exclusions = ExclusionTable::empty();
        exclusions.add("Foo", Rationale::Structural, ["bar"]);
        let buffer = LogBuffer::default();

        let (during, after) = tracing::subscriber::with_default(warn_subscriber(&buffer), || {
            let mut verifier = HeapVerifier::new(&heap, exclusions, VerifierConfig::default());
            verifier.scan(&heap);
            let during = buffer.verifier_lines();
            drop(verifier);
            (during, buffer.verifier_lines())
        });

        assert_eq!(
            during,
            vec![
                report::VIOLATION_HEADER.to_string(),
                "Field: Foo::baz".to_string(),
                "Value: 0x0000000000000002 Obj".to_string(),
                "--- trace begin ---".to_string(),
                "[ 0] 0x0000000000000002 Obj".to_string(),
                "--- trace end ---".to_string(),
            ]
        );
        assert!(!during.iter().any(|l| l.starts_with("Scanned")));

        let summaries: Vec<&String> = after.iter().filter(|l| l.starts_with("Scanned")).collect();
        assert_eq!(
            summaries,
            vec![
                "Scanned 2 objects. Found 1 case(s) where an object points to a static field \
                 that may be reinitialized at runtime."
            ]
        );
        assert_eq!(after.last(), summaries.last().copied());
    }

    #[test]
    fn test_one_block_per_violation() {
        let heap = foo_heap();
        let buffer = LogBuffer::default();

        let summary = tracing::subscriber::with_default(warn_subscriber(&buffer), || {
            verify_with(&heap, &heap, ExclusionTable::empty(), VerifierConfig::default())
        });

        let lines = buffer.verifier_lines();
        assert_eq!(summary.problems, 2);
        assert_eq!(
            lines.iter().filter(|l| *l == report::VIOLATION_HEADER).count(),
            2
        );
        assert_eq!(lines.iter().filter(|l| l.starts_with("Scanned 2 objects. Found 2")).count(), 1);
        assert!(lines.contains(&"Field: Foo::bar".to_string()));
        assert!(lines.contains(&"Field: Foo::baz".to_string()));
    }

    #[test]
    fn test_clean_run_logs_nothing() {
        let heap = foo_heap();
        let mut exclusions = ExclusionTable::empty();
        exclusions.add("Foo", Rationale::Structural, ["bar", "baz"]);
        let buffer = LogBuffer::default();

        let summary = tracing::subscriber::with_default(warn_subscriber(&buffer), || {
            verify_with(&heap, &heap, exclusions, VerifierConfig::default())
        });

        assert!(summary.is_clean());
        assert_eq!(summary.archived_objects, 2);
        assert!(buffer.verifier_lines().is_empty());
    }
}
