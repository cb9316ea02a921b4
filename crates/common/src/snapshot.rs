//! # Heap Snapshot: Portable Class Universe + Archive
//!
//! A self-contained description of the loaded classes, the live objects and the
//! candidate archive, so that verification can run outside the process that
//! produced the archive (and so tests can build synthetic heaps).
//!
//! Two on-disk forms share one schema:
//! - `.json`: hand-editable, `serde` based.
//! - `.rkyv`: zero-copy `rkyv` encoding, opened through a read-only mmap.
//!
//! [`LoadedHeap`] is the validated, indexed form and implements
//! [`ClassUniverse`], [`ObjectModel`] and [`ArchiveView`].

use crate::{
    ArchiveView, ArchivedObjectInfo, ClassId, ClassKind, ClassUniverse, FieldDescriptor,
    FieldFlags, FieldType, ObjectId, ObjectModel,
};
use memmap2::Mmap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;

/// Errors from reading, writing or validating a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Deserialization error: {0}")]
    DeserializeError(String),
    #[error("Duplicate class: {0}")]
    DuplicateClass(String),
    #[error("Duplicate object id: {0}")]
    DuplicateObject(ObjectId),
    #[error("Object {object} has unknown class {class}")]
    UnknownClass { object: ObjectId, class: String },
    #[error("Object {object} sets unknown instance field {class}::{field}")]
    UnknownField {
        object: ObjectId,
        class: String,
        field: String,
    },
    #[error("Value given for non-static field {class}::{field}")]
    ValueOnInstanceField { class: String, field: String },
    #[error("{from} references missing object {to}")]
    DanglingReference { from: String, to: ObjectId },
    #[error("Archived object {0} does not exist in the heap")]
    UnknownArchivedObject(ObjectId),
    #[error("Object {0} is archived more than once")]
    ArchivedTwice(ObjectId),
    #[error("Archived object {object} has referrer {referrer}, which is not archived")]
    DanglingReferrer { object: ObjectId, referrer: ObjectId },
    #[error("Referrer chain through {0} is cyclic")]
    ReferrerCycle(ObjectId),
}

/// One declared field.
#[derive(
    Debug, Clone, PartialEq, Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct FieldRecord {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(rename = "static", default)]
    pub is_static: bool,
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default)]
    pub has_initial_value: bool,
    /// Current value of a static reference field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

impl FieldRecord {
    /// A non-static field.
    pub fn instance(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            is_static: false,
            is_final: false,
            has_initial_value: false,
            value: None,
        }
    }

    /// An object-typed static field holding `value`.
    pub fn static_ref(name: &str, value: Option<u64>) -> Self {
        Self {
            is_static: true,
            value,
            ..Self::instance(name, FieldType::Object)
        }
    }

    pub fn with_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn with_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn with_initial_value(mut self) -> Self {
        self.has_initial_value = true;
        self
    }
}

/// One loaded class.
#[derive(
    Debug, Clone, PartialEq, Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct ClassRecord {
    /// Internal (slash-separated) name.
    pub name: String,
    #[serde(default)]
    pub kind: ClassKind,
    #[serde(default)]
    pub fields: Vec<FieldRecord>,
    #[serde(default)]
    pub subgraph_root: bool,
    #[serde(default)]
    pub archived_enum_objects: bool,
}

impl ClassRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ClassKind::Instance,
            fields: Vec::new(),
            subgraph_root: false,
            archived_enum_objects: false,
        }
    }

    pub fn with_kind(mut self, kind: ClassKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_field(mut self, field: FieldRecord) -> Self {
        self.fields.push(field);
        self
    }

    pub fn as_subgraph_root(mut self) -> Self {
        self.subgraph_root = true;
        self
    }

    pub fn with_archived_enum_objects(mut self) -> Self {
        self.archived_enum_objects = true;
        self
    }
}

/// Value of one instance field, by name.
#[derive(
    Debug, Clone, PartialEq, Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct FieldValue {
    pub field: String,
    #[serde(default)]
    pub value: Option<u64>,
}

/// One live object.
#[derive(
    Debug, Clone, PartialEq, Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct ObjectRecord {
    pub id: u64,
    /// Internal name of the runtime class.
    pub class: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldValue>,
    /// Elements of an object array.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<Option<u64>>,
    /// Present for string instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    /// Present for class mirrors: the internal name of the mirrored class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_of: Option<String>,
}

impl ObjectRecord {
    pub fn new(id: u64, class: &str) -> Self {
        Self {
            id,
            class: class.to_string(),
            fields: Vec::new(),
            elements: Vec::new(),
            string: None,
            mirror_of: None,
        }
    }

    pub fn with_field(mut self, field: &str, value: u64) -> Self {
        self.fields.push(FieldValue {
            field: field.to_string(),
            value: Some(value),
        });
        self
    }

    pub fn with_elements(mut self, elements: Vec<Option<u64>>) -> Self {
        self.elements = elements;
        self
    }

    pub fn with_string(mut self, text: &str) -> Self {
        self.string = Some(text.to_string());
        self
    }

    pub fn with_mirror_of(mut self, class: &str) -> Self {
        self.mirror_of = Some(class.to_string());
        self
    }
}

/// One archived object and the object that referenced it.
#[derive(
    Debug, Clone, PartialEq, Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct ArchiveRecord {
    pub object: u64,
    #[serde(default)]
    pub referrer: Option<u64>,
}

/// Serializable snapshot of a class universe plus its candidate archive.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Archive,
    Deserialize,
    Serialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
#[repr(C)]
pub struct HeapSnapshot {
    #[serde(default)]
    pub classes: Vec<ClassRecord>,
    #[serde(default)]
    pub objects: Vec<ObjectRecord>,
    #[serde(default)]
    pub archive: Vec<ArchiveRecord>,
}

impl HeapSnapshot {
    /// Creates a new empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, class: ClassRecord) -> &mut Self {
        self.classes.push(class);
        self
    }

    pub fn add_object(&mut self, object: ObjectRecord) -> &mut Self {
        self.objects.push(object);
        self
    }

    /// Marks `object` as archived, discovered through `referrer`.
    pub fn archive(&mut self, object: u64, referrer: Option<u64>) -> &mut Self {
        self.archive.push(ArchiveRecord { object, referrer });
        self
    }

    pub fn from_json_str(s: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json_string(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Serializes the snapshot to bytes using `rkyv`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let aligned = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| SnapshotError::DeserializeError(e.to_string()))?;
        Ok(aligned.to_vec())
    }

    /// Decodes (and validates) an `rkyv` encoded snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        const ALIGN: usize = 16;
        if (bytes.as_ptr() as usize) % ALIGN == 0 {
            return decode(bytes);
        }
        let mut aligned = rkyv::util::AlignedVec::<ALIGN>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        decode(&aligned)
    }

    /// Opens a snapshot file; `.rkyv` files are mapped, anything else is JSON.
    pub fn open(path: &Path) -> Result<Self, SnapshotError> {
        if is_rkyv(path) {
            let file = File::open(path)?;
            // SAFETY: the map is read-only and dropped before this function
            // returns; the decoded snapshot owns all of its data.
            let mmap = unsafe { Mmap::map(&file)? };
            Self::from_bytes(&mmap)
        } else {
            Self::from_json_str(&fs::read_to_string(path)?)
        }
    }

    /// Saves the snapshot, choosing the encoding from the file extension.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if is_rkyv(path) {
            fs::write(path, self.to_bytes()?)?;
        } else {
            fs::write(path, self.to_json_string()?)?;
        }
        Ok(())
    }

    /// Validates and indexes the snapshot.
    pub fn load(&self) -> Result<LoadedHeap, SnapshotError> {
        LoadedHeap::from_snapshot(self)
    }
}

fn decode(bytes: &[u8]) -> Result<HeapSnapshot, SnapshotError> {
    rkyv::from_bytes::<HeapSnapshot, rkyv::rancor::Error>(bytes)
        .map_err(|e| SnapshotError::DeserializeError(e.to_string()))
}

fn is_rkyv(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("rkyv")
}

#[derive(Debug)]
struct LoadedClass {
    name: String,
    kind: ClassKind,
    fields: Vec<FieldDescriptor>,
    /// Indexed by slot; only static reference slots are ever `Some`.
    statics: Vec<Option<ObjectId>>,
    subgraph_root: bool,
    archived_enum_objects: bool,
}

#[derive(Debug)]
struct LoadedObject {
    class: ClassId,
    /// Indexed by slot of the object's class.
    fields: Vec<Option<ObjectId>>,
    elements: Vec<Option<ObjectId>>,
    string: Option<String>,
    mirror_of: Option<String>,
}

/// Validated, indexed heap ready for verification.
#[derive(Debug)]
pub struct LoadedHeap {
    classes: Vec<LoadedClass>,
    class_index: HashMap<String, ClassId>,
    objects: HashMap<ObjectId, LoadedObject>,
    archive: Vec<(ObjectId, ArchivedObjectInfo)>,
    archive_index: HashMap<ObjectId, usize>,
}

impl LoadedHeap {
    /// Builds the indexed heap, rejecting inconsistent snapshots.
    ///
    /// Besides plain referential integrity this checks that the referrer
    /// edges of the archive form a forest, which the provenance trace relies on.
    pub fn from_snapshot(snapshot: &HeapSnapshot) -> Result<Self, SnapshotError> {
        let mut classes = Vec::with_capacity(snapshot.classes.len());
        let mut class_index = HashMap::with_capacity(snapshot.classes.len());

        for (i, record) in snapshot.classes.iter().enumerate() {
            let id = ClassId(i as u32);
            if class_index.insert(record.name.clone(), id).is_some() {
                return Err(SnapshotError::DuplicateClass(record.name.clone()));
            }
            let fields = record
                .fields
                .iter()
                .enumerate()
                .map(|(slot, f)| FieldDescriptor {
                    name: f.name.clone(),
                    field_type: f.field_type,
                    flags: field_flags(f),
                    slot: slot as u32,
                })
                .collect();
            classes.push(LoadedClass {
                name: record.name.clone(),
                kind: record.kind,
                fields,
                statics: vec![None; record.fields.len()],
                subgraph_root: record.subgraph_root,
                archived_enum_objects: record.archived_enum_objects,
            });
        }

        // Pass 1: register every object so forward references resolve.
        let mut objects: HashMap<ObjectId, LoadedObject> =
            HashMap::with_capacity(snapshot.objects.len());
        for record in &snapshot.objects {
            let id = ObjectId(record.id);
            let class = *class_index
                .get(&record.class)
                .ok_or_else(|| SnapshotError::UnknownClass {
                    object: id,
                    class: record.class.clone(),
                })?;
            let slots = classes[class.0 as usize].fields.len();
            let loaded = LoadedObject {
                class,
                fields: vec![None; slots],
                elements: Vec::new(),
                string: record.string.clone(),
                mirror_of: record.mirror_of.clone(),
            };
            if objects.insert(id, loaded).is_some() {
                return Err(SnapshotError::DuplicateObject(id));
            }
        }

        // Pass 2: static values.
        for (class, record) in classes.iter_mut().zip(&snapshot.classes) {
            for (slot, f) in record.fields.iter().enumerate() {
                if f.value.is_none() {
                    continue;
                }
                if !f.is_static {
                    return Err(SnapshotError::ValueOnInstanceField {
                        class: record.name.clone(),
                        field: f.name.clone(),
                    });
                }
                class.statics[slot] =
                    resolve(&objects, f.value, || format!("{}::{}", record.name, f.name))?;
            }
        }

        // Pass 3: instance field values and array elements.
        let mut resolved = Vec::with_capacity(snapshot.objects.len());
        for record in &snapshot.objects {
            let id = ObjectId(record.id);
            let class = &snapshot.classes[class_index[&record.class].0 as usize];
            let mut fields = Vec::with_capacity(record.fields.len());
            for value in &record.fields {
                let slot = class
                    .fields
                    .iter()
                    .position(|f| !f.is_static && f.name == value.field)
                    .ok_or_else(|| SnapshotError::UnknownField {
                        object: id,
                        class: record.class.clone(),
                        field: value.field.clone(),
                    })?;
                let target = resolve(&objects, value.value, || format!("{}.{}", id, value.field))?;
                fields.push((slot, target));
            }
            let elements = record
                .elements
                .iter()
                .enumerate()
                .map(|(i, e)| resolve(&objects, *e, || format!("{}[{}]", id, i)))
                .collect::<Result<Vec<_>, _>>()?;
            resolved.push((id, fields, elements));
        }
        for (id, fields, elements) in resolved {
            if let Some(object) = objects.get_mut(&id) {
                for (slot, target) in fields {
                    object.fields[slot] = target;
                }
                object.elements = elements;
            }
        }

        let (archive, archive_index) = index_archive(snapshot, &objects)?;

        Ok(Self {
            classes,
            class_index,
            objects,
            archive,
            archive_index,
        })
    }

    /// Looks up a class by internal name.
    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.class_index.get(name).copied()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn archived_count(&self) -> usize {
        self.archive.len()
    }

    fn class(&self, class: ClassId) -> Option<&LoadedClass> {
        self.classes.get(class.0 as usize)
    }
}

/// Maps a raw id to a handle, checking that the object exists.
fn resolve(
    objects: &HashMap<ObjectId, LoadedObject>,
    value: Option<u64>,
    from: impl FnOnce() -> String,
) -> Result<Option<ObjectId>, SnapshotError> {
    match value.map(ObjectId) {
        Some(to) if !objects.contains_key(&to) => {
            Err(SnapshotError::DanglingReference { from: from(), to })
        }
        other => Ok(other),
    }
}

fn field_flags(f: &FieldRecord) -> FieldFlags {
    let mut flags = FieldFlags::empty();
    flags.set(FieldFlags::STATIC, f.is_static);
    flags.set(FieldFlags::FINAL, f.is_final);
    flags.set(FieldFlags::HAS_INITIAL_VALUE, f.has_initial_value);
    flags
}

type ArchiveIndex = (Vec<(ObjectId, ArchivedObjectInfo)>, HashMap<ObjectId, usize>);

/// Indexes the archive and checks that referrer edges are acyclic.
fn index_archive(
    snapshot: &HeapSnapshot,
    objects: &HashMap<ObjectId, LoadedObject>,
) -> Result<ArchiveIndex, SnapshotError> {
    let mut archive = Vec::with_capacity(snapshot.archive.len());
    let mut index = HashMap::with_capacity(snapshot.archive.len());
    let mut graph: DiGraph<ObjectId, ()> = DiGraph::new();
    let mut nodes: HashMap<ObjectId, NodeIndex> = HashMap::new();

    for record in &snapshot.archive {
        let id = ObjectId(record.object);
        if !objects.contains_key(&id) {
            return Err(SnapshotError::UnknownArchivedObject(id));
        }
        if index.insert(id, archive.len()).is_some() {
            return Err(SnapshotError::ArchivedTwice(id));
        }
        archive.push((
            id,
            ArchivedObjectInfo {
                referrer: record.referrer.map(ObjectId),
            },
        ));
        nodes.insert(id, graph.add_node(id));
    }

    for (id, info) in &archive {
        if let Some(referrer) = info.referrer {
            let from = nodes
                .get(&referrer)
                .ok_or(SnapshotError::DanglingReferrer {
                    object: *id,
                    referrer,
                })?;
            graph.add_edge(*from, nodes[id], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| SnapshotError::ReferrerCycle(graph[cycle.node_id()]))?;

    Ok((archive, index))
}

impl ClassUniverse for LoadedHeap {
    fn classes_do(&self, visitor: &mut dyn FnMut(ClassId)) {
        for i in 0..self.classes.len() {
            visitor(ClassId(i as u32));
        }
    }

    fn class_name(&self, class: ClassId) -> &str {
        self.class(class).map_or("<unknown>", |c| c.name.as_str())
    }

    fn class_kind(&self, class: ClassId) -> ClassKind {
        self.class(class).map_or(ClassKind::Instance, |c| c.kind)
    }

    fn fields(&self, class: ClassId) -> &[FieldDescriptor] {
        self.class(class)
            .map(|c| c.fields.as_slice())
            .unwrap_or(&[])
    }

    fn static_field(&self, class: ClassId, slot: u32) -> Option<ObjectId> {
        self.class(class)?.statics.get(slot as usize).copied().flatten()
    }

    fn is_subgraph_root_class(&self, class: ClassId) -> bool {
        self.class(class).is_some_and(|c| c.subgraph_root)
    }

    fn has_archived_enum_objects(&self, class: ClassId) -> bool {
        self.class(class).is_some_and(|c| c.archived_enum_objects)
    }
}

impl ObjectModel for LoadedHeap {
    fn class_of(&self, obj: ObjectId) -> Option<ClassId> {
        self.objects.get(&obj).map(|o| o.class)
    }

    fn instance_field(&self, obj: ObjectId, slot: u32) -> Option<ObjectId> {
        self.objects.get(&obj)?.fields.get(slot as usize).copied().flatten()
    }

    fn array_elements(&self, obj: ObjectId) -> Option<&[Option<ObjectId>]> {
        let object = self.objects.get(&obj)?;
        match self.class_kind(object.class) {
            ClassKind::ObjectArray => Some(object.elements.as_slice()),
            _ => None,
        }
    }

    fn is_string(&self, obj: ObjectId) -> bool {
        self.objects.get(&obj).is_some_and(|o| o.string.is_some())
    }

    fn is_class_mirror(&self, obj: ObjectId) -> bool {
        self.objects.get(&obj).is_some_and(|o| o.mirror_of.is_some())
    }

    fn describe(&self, obj: ObjectId) -> String {
        let Some(object) = self.objects.get(&obj) else {
            return format!("{obj} <unknown object>");
        };
        let class = self.class_name(object.class);
        if let Some(text) = &object.string {
            format!("{obj} {class} {text:?}")
        } else if let Some(mirrored) = &object.mirror_of {
            format!("{obj} {class} mirror of {mirrored}")
        } else if self.class_kind(object.class) == ClassKind::ObjectArray {
            format!("{obj} {class} length {}", object.elements.len())
        } else {
            format!("{obj} {class}")
        }
    }
}

impl ArchiveView for LoadedHeap {
    fn objects_do(&self, visitor: &mut dyn FnMut(ObjectId, &ArchivedObjectInfo)) {
        for (id, info) in &self.archive {
            visitor(*id, info);
        }
    }

    fn archived_info(&self, obj: ObjectId) -> Option<&ArchivedObjectInfo> {
        self.archive_index.get(&obj).map(|&i| &self.archive[i].1)
    }
}
