//! Provenance Tracer.
//!
//! Reconstructs how an archived object was reached: follows referrer edges up
//! to the nearest root, then renders the chain root-first, one line per level:
//!
//! ```text
//! [ 0] 0x0000000000000010 com/acme/Registry::entries (offset = 2)
//! [ 1] 0x0000000000000020 [Ljava/lang/Object; @[3]
//! [ 2] 0x0000000000000030 com/acme/Holder
//! ```
//!
//! Each line names the field (or array index) on that object that leads to
//! the next line. The archive builder guarantees referrer chains are finite and
//! acyclic; `max_depth` bounds the walk regardless.

use crate::LOG_TARGET;
use common::{ArchiveView, ArchivedObjectInfo, ClassKind, ClassUniverse, ObjectId, ObjectModel};
use std::fmt;
use tracing::debug;

/// The edge from one object to the next one in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    /// Instance field holding the next object.
    Field { name: String, slot: u32 },
    /// Index of the next object in an object array.
    Index(usize),
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Field { name, slot } => write!(f, "::{name} (offset = {slot})"),
            Hop::Index(i) => write!(f, " @[{i}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceNode {
    /// Pseudo-root for strings interned independently of any referrer.
    SharedStringTable,
    /// The walk stopped at the depth limit before reaching a root.
    Truncated { hops: usize },
    Object {
        id: ObjectId,
        type_name: String,
        hop: Option<Hop>,
    },
}

/// One rendered line of a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub level: usize,
    pub node: TraceNode,
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:2}] ", self.level)?;
        match &self.node {
            TraceNode::SharedStringTable => write!(f, "(shared string table)"),
            TraceNode::Truncated { hops } => write!(f, "(trace truncated after {hops} hops)"),
            TraceNode::Object { id, type_name, hop } => {
                write!(f, "{id} {type_name}")?;
                if let Some(hop) = hop {
                    write!(f, "{hop}")?;
                }
                Ok(())
            }
        }
    }
}

/// A rendered referrer chain, root first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub lines: Vec<TraceLine>,
    /// Level of the traced object itself (the last line).
    pub depth: usize,
}

/// Traces `obj` back to its root and renders the chain.
pub fn trace_to_root<H, A>(
    heap: &H,
    archive: &A,
    obj: ObjectId,
    info: &ArchivedObjectInfo,
    max_depth: Option<usize>,
) -> Trace
where
    H: ClassUniverse + ObjectModel + ?Sized,
    A: ArchiveView + ?Sized,
{
    // chain[0] is `obj`; chain.last() is the root (or where the walk stopped).
    let mut chain = vec![obj];
    let mut next = info.referrer;
    let mut truncated = false;

    while let Some(referrer) = next {
        if max_depth.is_some_and(|max| chain.len() > max) {
            truncated = true;
            break;
        }
        chain.push(referrer);
        next = match archive.archived_info(referrer) {
            Some(info) => info.referrer,
            None => {
                debug!(target: LOG_TARGET, object = %referrer, "referrer has no archive metadata");
                None
            }
        };
    }

    let mut lines = Vec::with_capacity(chain.len() + 1);
    let mut level = 0;
    let root = chain[chain.len() - 1];

    if truncated {
        lines.push(TraceLine {
            level,
            node: TraceNode::Truncated {
                hops: chain.len() - 1,
            },
        });
        level += 1;
    } else if heap.is_string(root) {
        lines.push(TraceLine {
            level,
            node: TraceNode::SharedStringTable,
        });
        level += 1;
    }

    for i in (0..chain.len()).rev() {
        let object = chain[i];
        let hop = match i {
            0 => None,
            _ => find_hop(heap, object, chain[i - 1]),
        };
        lines.push(TraceLine {
            level,
            node: TraceNode::Object {
                id: object,
                type_name: type_name(heap, object).to_string(),
                hop,
            },
        });
        level += 1;
    }

    Trace {
        lines,
        depth: level - 1,
    }
}

/// Finds the instance field or array slot of `holder` that points at `target`.
///
/// `None` when the referrer metadata and the heap disagree; the line is then
/// printed without annotation.
pub fn find_hop<H>(heap: &H, holder: ObjectId, target: ObjectId) -> Option<Hop>
where
    H: ClassUniverse + ObjectModel + ?Sized,
{
    let class = heap.class_of(holder)?;
    match heap.class_kind(class) {
        ClassKind::Instance => heap
            .fields(class)
            .iter()
            .filter(|f| !f.is_static() && f.is_reference())
            .find(|f| heap.instance_field(holder, f.slot) == Some(target))
            .map(|f| Hop::Field {
                name: f.name.clone(),
                slot: f.slot,
            }),
        _ => heap
            .array_elements(holder)?
            .iter()
            .position(|e| *e == Some(target))
            .map(Hop::Index),
    }
}

fn type_name<H>(heap: &H, obj: ObjectId) -> &str
where
    H: ClassUniverse + ObjectModel + ?Sized,
{
    heap.class_of(obj)
        .map_or("<unknown>", |class| heap.class_name(class))
}
