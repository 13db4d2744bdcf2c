//! Embedded-object payload for marking stubs
//!
//! A marking stub bakes managed object addresses into its machine code (a
//! cached structure, a callee, a prototype). Those objects must outlive the
//! code, so every cycle the stub reports them to the tracer for as long as
//! it stays in the live-stub registry. The set is fixed at construction.

use crate::gc::{ObjectRef, Tracer};

/// Immutable set of managed objects a stub keeps alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedObjects {
    /// Compile-time owner the objects were embedded on behalf of
    owner: ObjectRef,
    /// Objects referenced from the stub's code (never empty)
    objects: Box<[ObjectRef]>,
}

impl EmbeddedObjects {
    /// Embed a single object
    pub fn one(owner: ObjectRef, object: ObjectRef) -> Self {
        Self {
            owner,
            objects: Box::new([object]),
        }
    }

    /// Embed a list of objects; `None` if the list is empty
    pub fn new(owner: ObjectRef, objects: impl Into<Box<[ObjectRef]>>) -> Option<Self> {
        let objects = objects.into();
        if objects.is_empty() {
            return None;
        }
        Some(Self { owner, objects })
    }

    /// The compile-time owner
    pub fn owner(&self) -> ObjectRef {
        self.owner
    }

    /// The embedded objects
    pub fn objects(&self) -> &[ObjectRef] {
        &self.objects
    }

    /// Number of embedded objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no object is embedded
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether `object` is embedded
    pub fn contains(&self, object: ObjectRef) -> bool {
        self.objects.contains(&object)
    }

    /// Offer every embedded object to the tracer
    pub(crate) fn trace(&self, tracer: &mut dyn Tracer) {
        for &object in self.objects.iter() {
            tracer.trace(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::MarkSet;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).unwrap()
    }

    #[test]
    fn test_empty_list_rejected() {
        assert!(EmbeddedObjects::new(obj(0x10), Vec::new()).is_none());
    }

    #[test]
    fn test_trace_reports_every_object() {
        let embedded = EmbeddedObjects::new(obj(0x10), vec![obj(0x20), obj(0x30)]).unwrap();
        let mut marks = MarkSet::new();
        embedded.trace(&mut marks);

        assert!(marks.is_marked(obj(0x20)));
        assert!(marks.is_marked(obj(0x30)));
        // The owner is an association, not an edge
        assert!(!marks.is_marked(obj(0x10)));
        assert_eq!(embedded.len(), 2);
    }
}
