//! Static Field Collector.
//!
//! Walks every loaded class and records, for each static object field whose
//! value may differ in the next process, the object it currently points to.
//!
//! Per class:
//! - **Subgraph root classes** are skipped wholesale; the archive builder
//!   repoints their statics at startup.
//! - Each non-null static object field then goes through [`classify_static_field`].
//!   Anything not skipped lands in the [`LiveObjectRegistry`], last writer wins.

use crate::LOG_TARGET;
use common::exclusions::ExclusionTable;
use common::registry::LiveObjectRegistry;
use common::{ClassId, ClassKind, ClassUniverse, FieldDescriptor, FieldRef, FieldType, ObjectId, ObjectModel};
use tracing::{debug, trace};

/// Why a static field was left out of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SkipReason {
    /// Listed in the exclusion table.
    Excluded = 0,
    /// `static final` string with a constant initializer. The literal lives in
    /// the shared string table, so aliasing it is fine.
    InternedLiteral = 1,
    /// `static final` class mirror; mirrors are archived with their class.
    ClassMirror = 2,
    /// The value's class has archived enum instances, and all of the enum's
    /// statics are archived together.
    ArchivedEnum = 3,
}

impl SkipReason {
    pub const COUNT: usize = 4;

    pub const ALL: [SkipReason; SkipReason::COUNT] = [
        SkipReason::Excluded,
        SkipReason::InternedLiteral,
        SkipReason::ClassMirror,
        SkipReason::ArchivedEnum,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SkipReason::Excluded => "excluded",
            SkipReason::InternedLiteral => "interned literal",
            SkipReason::ClassMirror => "class mirror",
            SkipReason::ArchivedEnum => "archived enum",
        }
    }
}

/// Counters gathered while collecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Instance classes visited.
    pub classes: usize,
    /// Classes skipped because they are subgraph roots.
    pub subgraph_root_classes: usize,
    /// Non-null static object fields examined.
    pub static_references: usize,
    /// `skipped[reason as usize]` = fields left out for that reason.
    pub skipped: [usize; SkipReason::COUNT],
    /// Fields recorded in the registry (aliases counted once per field).
    pub recorded: usize,
}

impl CollectStats {
    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped[reason as usize]
    }
}

/// Decides whether a non-null static field value is safe to alias.
///
/// Returns the first matching [`SkipReason`], or `None` if the field must be
/// recorded. `class_name` is the holder's internal name.
pub fn classify_static_field<H>(
    heap: &H,
    class_name: &str,
    field: &FieldDescriptor,
    value: ObjectId,
    exclusions: &ExclusionTable,
) -> Option<SkipReason>
where
    H: ClassUniverse + ObjectModel + ?Sized,
{
    if exclusions.is_excluded(class_name, &field.name) {
        return Some(SkipReason::Excluded);
    }
    if field.is_final() && heap.is_string(value) && field.has_initial_value() {
        return Some(SkipReason::InternedLiteral);
    }
    if field.is_final() && heap.is_class_mirror(value) {
        return Some(SkipReason::ClassMirror);
    }
    if heap
        .class_of(value)
        .is_some_and(|k| heap.has_archived_enum_objects(k))
    {
        return Some(SkipReason::ArchivedEnum);
    }
    None
}

/// Collects the static fields of a single class into `registry`.
pub fn collect_class<H>(
    heap: &H,
    class: ClassId,
    exclusions: &ExclusionTable,
    registry: &mut LiveObjectRegistry,
    stats: &mut CollectStats,
) where
    H: ClassUniverse + ObjectModel + ?Sized,
{
    if heap.class_kind(class) != ClassKind::Instance {
        return;
    }
    stats.classes += 1;

    let class_name = heap.class_name(class);
    if heap.is_subgraph_root_class(class) {
        stats.subgraph_root_classes += 1;
        trace!(target: LOG_TARGET, class = class_name, "skipping subgraph root class");
        return;
    }

    for field in heap.fields(class) {
        // Array-typed statics are not tracked, only plain object references.
        if !field.is_static() || field.field_type != FieldType::Object {
            continue;
        }
        let Some(value) = heap.static_field(class, field.slot) else {
            continue;
        };
        stats.static_references += 1;

        if let Some(reason) = classify_static_field(heap, class_name, field, value, exclusions) {
            stats.skipped[reason as usize] += 1;
            trace!(
                target: LOG_TARGET,
                class = class_name,
                field = %field.name,
                reason = reason.label(),
                "static field skipped"
            );
            continue;
        }

        // This field *may* hold a different value in the next process.
        registry.insert(value, FieldRef::new(class, field.name.as_str()));
        stats.recorded += 1;
    }
}

/// Builds the live object registry over every loaded class.
pub fn collect_static_fields<H>(
    heap: &H,
    exclusions: &ExclusionTable,
) -> (LiveObjectRegistry, CollectStats)
where
    H: ClassUniverse + ObjectModel + ?Sized,
{
    let mut registry = LiveObjectRegistry::new();
    let mut stats = CollectStats::default();

    heap.classes_do(&mut |class| {
        collect_class(heap, class, exclusions, &mut registry, &mut stats);
    });

    debug!(
        target: LOG_TARGET,
        classes = stats.classes,
        subgraph_roots = stats.subgraph_root_classes,
        static_references = stats.static_references,
        excluded = stats.skipped_for(SkipReason::Excluded),
        interned_literals = stats.skipped_for(SkipReason::InternedLiteral),
        class_mirrors = stats.skipped_for(SkipReason::ClassMirror),
        archived_enums = stats.skipped_for(SkipReason::ArchivedEnum),
        recorded = stats.recorded,
        live_objects = registry.len(),
        "collected static fields"
    );

    (registry, stats)
}
