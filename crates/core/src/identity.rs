//! Identity keys for change-in-progress bookkeeping.
//!
//! Keys hash and compare by [`ObjectId`], never by the state of the object
//! they point at, so an entry stays addressable while that object mutates.

use std::fmt;

use crate::ids::ObjectId;
use crate::notify::{CollectionAction, CollectionEvent, PropertyEvent};
use crate::observable::ObjectRef;
use crate::value::Value;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PropertyKey {
    pub object: ObjectId,
    pub property: String,
}

impl PropertyKey {
    pub fn new(sender: &ObjectRef, property: &str) -> Self {
        Self {
            object: sender.object_id(),
            property: property.to_string(),
        }
    }

    pub fn of(event: &PropertyEvent) -> Self {
        Self::new(&event.sender, &event.property)
    }
}

impl fmt::Debug for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.object, self.property)
    }
}

/// Identity of a collection item: the object itself, or its slot when the
/// item is a plain value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Object(ObjectId),
    Slot(usize),
}

impl ItemKey {
    pub fn of(item: &Value, index: usize) -> Self {
        match item.object_id() {
            Some(id) => Self::Object(id),
            None => Self::Slot(index),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub list: ObjectId,
    pub item: ItemKey,
    pub action: CollectionAction,
}

impl CollectionKey {
    pub fn of(event: &CollectionEvent) -> Self {
        Self {
            list: event.sender.object_id(),
            item: ItemKey::of(&event.item, event.index),
            action: event.action,
        }
    }

    pub fn member(&self) -> String {
        format!("{} {:?}", self.action.as_str(), self.item)
    }
}

impl fmt::Debug for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{} {:?}]", self.list, self.action.as_str(), self.item)
    }
}
