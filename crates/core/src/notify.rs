use std::cell::RefCell;
use std::rc::Rc;

use crate::error::CoreError;
use crate::ids::ListenerId;
use crate::observable::ObjectRef;
use crate::value::Value;

/// A single-value change. On "about to change" `value` holds the current
/// value, on "changed" it holds the new one.
#[derive(Debug, Clone)]
pub struct PropertyEvent {
    pub sender: ObjectRef,
    pub property: String,
    pub value: Value,
    /// Set by the source when the announced change will not happen. No
    /// "changed" follows a cancelled "about to change".
    pub cancelled: bool,
}

impl PropertyEvent {
    pub fn new(sender: ObjectRef, property: &str, value: Value) -> Self {
        Self {
            sender,
            property: property.to_string(),
            value,
            cancelled: false,
        }
    }

    pub fn cancelled(sender: ObjectRef, property: &str, value: Value) -> Self {
        Self {
            cancelled: true,
            ..Self::new(sender, property, value)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionAction {
    Add,
    Remove,
    Replace,
}

impl CollectionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
        }
    }
}

/// A collection membership change. `item` is the added, removed or incoming
/// item; `old_item` is the outgoing item of a replace.
#[derive(Debug, Clone)]
pub struct CollectionEvent {
    pub sender: ObjectRef,
    pub action: CollectionAction,
    pub index: usize,
    pub item: Value,
    pub old_item: Option<Value>,
    pub cancelled: bool,
}

impl CollectionEvent {
    pub fn new(sender: ObjectRef, action: CollectionAction, index: usize, item: Value) -> Self {
        Self {
            sender,
            action,
            index,
            item,
            old_item: None,
            cancelled: false,
        }
    }

    pub fn replace(sender: ObjectRef, index: usize, item: Value, old_item: Value) -> Self {
        Self {
            old_item: Some(old_item),
            ..Self::new(sender, CollectionAction::Replace, index, item)
        }
    }
}

/// Receiver of change notifications. An error aborts the mutation that is
/// being announced and propagates to whoever started it.
pub trait ChangeListener {
    fn property_changing(&self, _event: &PropertyEvent) -> Result<(), CoreError> {
        Ok(())
    }

    fn property_changed(&self, _event: &PropertyEvent) -> Result<(), CoreError> {
        Ok(())
    }

    fn collection_changing(&self, _event: &CollectionEvent) -> Result<(), CoreError> {
        Ok(())
    }

    fn collection_changed(&self, _event: &CollectionEvent) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Dispatch order of a listener relative to the others on the same source.
///
/// `Tracking` listeners hear "about to change" before and "changed" after
/// every `Observer`, so anything an observer does in reaction to a change
/// happens inside the tracker's bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Observer,
    Tracking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Before,
    After,
}

struct Entry {
    id: ListenerId,
    priority: Priority,
    listener: Rc<dyn ChangeListener>,
}

/// Listener registry embedded by notification sources.
#[derive(Default)]
pub struct Listeners {
    entries: RefCell<Vec<Entry>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Rc<dyn ChangeListener>, priority: Priority) -> ListenerId {
        let id = ListenerId::new();
        self.entries.borrow_mut().push(Entry {
            id,
            priority,
            listener,
        });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Snapshot in dispatch order, so listeners may subscribe or unsubscribe
    /// while being notified.
    fn ordered(&self, phase: Phase) -> Vec<Rc<dyn ChangeListener>> {
        let entries = self.entries.borrow();
        let first = match phase {
            Phase::Before => Priority::Tracking,
            Phase::After => Priority::Observer,
        };
        let leading = entries.iter().filter(|e| e.priority == first);
        let trailing = entries.iter().filter(|e| e.priority != first);
        leading.chain(trailing).map(|e| Rc::clone(&e.listener)).collect()
    }

    pub fn property_changing(&self, event: &PropertyEvent) -> Result<(), CoreError> {
        for listener in self.ordered(Phase::Before) {
            listener.property_changing(event)?;
        }
        Ok(())
    }

    pub fn property_changed(&self, event: &PropertyEvent) -> Result<(), CoreError> {
        for listener in self.ordered(Phase::After) {
            listener.property_changed(event)?;
        }
        Ok(())
    }

    pub fn collection_changing(&self, event: &CollectionEvent) -> Result<(), CoreError> {
        for listener in self.ordered(Phase::Before) {
            listener.collection_changing(event)?;
        }
        Ok(())
    }

    pub fn collection_changed(&self, event: &CollectionEvent) -> Result<(), CoreError> {
        for listener in self.ordered(Phase::After) {
            listener.collection_changed(event)?;
        }
        Ok(())
    }
}
