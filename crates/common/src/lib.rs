//! # Heap Model: Shared Types & Collaborator Traits
//!
//! Everything the verifier reads about a running process goes through three
//! narrow, read-only views:
//!
//! - [`ClassUniverse`]: enumerates loaded classes and describes their fields.
//! - [`ObjectModel`]: answers questions about individual live objects.
//! - [`ArchiveView`]: iterates the candidate archive and its referrer metadata.
//!
//! Object identity is an opaque [`ObjectId`] handle. The live class universe and
//! the archive must hand out the *same* handle for the same object; the whole
//! stale-reference check is an identity join across the two.

pub mod exclusions;
pub mod registry;
pub mod snapshot;

use bitflags::bitflags;
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::fmt;

/// Opaque, stable identity of a heap object.
///
/// Compared by handle, never by object contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Index of a loaded class inside a [`ClassUniverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Declared type tag of a field.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Deserialize,
    Serialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FieldType {
    /// Reference to a plain object.
    #[default]
    Object = 0,
    /// Reference to an array.
    Array = 1,
    /// Any primitive (int, long, boolean, ...). Never holds an object.
    Primitive = 2,
}

/// Shape of a loaded class.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Deserialize,
    Serialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
#[rkyv(derive(Debug))]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ClassKind {
    /// Ordinary class with named fields.
    #[default]
    Instance = 0,
    /// Array whose elements are object references.
    ObjectArray = 1,
    /// Array of primitives.
    TypeArray = 2,
}

bitflags! {
    /// Access and initializer flags carried by a [`FieldDescriptor`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldFlags: u8 {
        const STATIC = 1 << 0;
        const FINAL = 1 << 1;
        /// The field has a compile-time constant initial value.
        const HAS_INITIAL_VALUE = 1 << 2;
    }
}

/// One declared field of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub flags: FieldFlags,
    /// Storage slot used to fetch the value from the class or instance.
    pub slot: u32,
}

impl FieldDescriptor {
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(FieldFlags::FINAL)
    }

    pub fn has_initial_value(&self) -> bool {
        self.flags.contains(FieldFlags::HAS_INITIAL_VALUE)
    }

    /// Returns `true` for object- and array-typed fields.
    pub fn is_reference(&self) -> bool {
        matches!(self.field_type, FieldType::Object | FieldType::Array)
    }
}

/// A specific static storage location: (owning class, field name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub holder: ClassId,
    pub name: String,
}

impl FieldRef {
    pub fn new(holder: ClassId, name: impl Into<String>) -> Self {
        Self {
            holder,
            name: name.into(),
        }
    }
}

/// Archive-builder metadata for one archived object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchivedObjectInfo {
    /// The object that referenced this one when it was discovered.
    /// `None` means the object is itself a root.
    pub referrer: Option<ObjectId>,
}

/// Converts an internal class name (`java/lang/String`) into its external,
/// dot-separated form (`java.lang.String`).
///
/// # Examples
/// ```
/// # use common::external_name;
/// assert_eq!(external_name("java/net/URL$DefaultFactory"), "java.net.URL$DefaultFactory");
/// ```
pub fn external_name(internal: &str) -> String {
    internal.replace('/', ".")
}

// TRAITS

/// Read-only view over the currently loaded classes.
pub trait ClassUniverse {
    /// Invokes `visitor` once per loaded class, in a fixed order.
    fn classes_do(&self, visitor: &mut dyn FnMut(ClassId));

    /// Internal (slash-separated) class name.
    fn class_name(&self, class: ClassId) -> &str;

    fn class_kind(&self, class: ClassId) -> ClassKind;

    /// Declared fields, static and instance, in declaration order.
    fn fields(&self, class: ClassId) -> &[FieldDescriptor];

    /// Current value of the object-typed static field stored at `slot`.
    fn static_field(&self, class: ClassId, slot: u32) -> Option<ObjectId>;

    /// Whether the archive builder repoints this class's statics into the
    /// archive at startup.
    fn is_subgraph_root_class(&self, class: ClassId) -> bool;

    /// Whether instances of this (enum) class have been archived.
    fn has_archived_enum_objects(&self, class: ClassId) -> bool;
}

/// Read-only view over live heap objects.
pub trait ObjectModel {
    /// Runtime class of `obj`, or `None` if the handle is unknown.
    fn class_of(&self, obj: ObjectId) -> Option<ClassId>;

    /// Value of the object-typed instance field stored at `slot`.
    fn instance_field(&self, obj: ObjectId, slot: u32) -> Option<ObjectId>;

    /// Elements of an object array. `None` if `obj` is not an object array.
    fn array_elements(&self, obj: ObjectId) -> Option<&[Option<ObjectId>]>;

    fn is_string(&self, obj: ObjectId) -> bool;

    fn is_class_mirror(&self, obj: ObjectId) -> bool;

    /// Single-line human-readable dump of the object.
    fn describe(&self, obj: ObjectId) -> String;
}

/// Read-only view over the candidate archive.
pub trait ArchiveView {
    /// Invokes `visitor` once per archived object with its metadata.
    fn objects_do(&self, visitor: &mut dyn FnMut(ObjectId, &ArchivedObjectInfo));

    /// Metadata of one archived object, or `None` if it is not archived.
    fn archived_info(&self, obj: ObjectId) -> Option<&ArchivedObjectInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(field_type: FieldType, flags: FieldFlags) -> FieldDescriptor {
        FieldDescriptor {
            name: "f".into(),
            field_type,
            flags,
            slot: 0,
        }
    }

    #[test]
    fn test_object_id_display() {
        assert_eq!(ObjectId(0xbeef).to_string(), "0x000000000000beef");
    }

    #[test]
    fn test_field_flags() {
        let f = field(FieldType::Object, FieldFlags::STATIC | FieldFlags::FINAL);
        assert!(f.is_static());
        assert!(f.is_final());
        assert!(!f.has_initial_value());
    }

    #[test]
    fn test_is_reference() {
        assert!(field(FieldType::Object, FieldFlags::empty()).is_reference());
        assert!(field(FieldType::Array, FieldFlags::empty()).is_reference());
        assert!(!field(FieldType::Primitive, FieldFlags::STATIC).is_reference());
    }

    #[test]
    fn test_external_name() {
        assert_eq!(external_name("java/lang/System"), "java.lang.System");
        assert_eq!(external_name("Foo"), "Foo");
    }

    #[test]
    fn test_enum_sizes() {
        assert_eq!(std::mem::size_of::<FieldType>(), 1);
        assert_eq!(std::mem::size_of::<ClassKind>(), 1);
    }
}
