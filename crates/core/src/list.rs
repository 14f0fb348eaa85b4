use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::CoreError;
use crate::ids::{ListenerId, ObjectId};
use crate::notify::{ChangeListener, CollectionAction, CollectionEvent, Listeners, Priority};
use crate::observable::{CollectionNotifier, ObjectRef, Observable};
use crate::value::Value;

/// Ordered collection reporting every membership change.
pub struct EntityList {
    id: ObjectId,
    type_name: String,
    this: Weak<EntityList>,
    items: RefCell<Vec<Value>>,
    listeners: Listeners,
}

impl EntityList {
    pub fn new(type_name: &str) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id: ObjectId::new(),
            type_name: type_name.to_string(),
            this: this.clone(),
            items: RefCell::new(Vec::new()),
            listeners: Listeners::new(),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn push(&self, value: impl Into<Value>) -> Result<(), CoreError> {
        self.insert(self.len(), value.into())
    }

    /// Removes the first occurrence of `value`. Returns whether it was found.
    pub fn remove(&self, value: &Value) -> Result<bool, CoreError> {
        match self.index_of(value) {
            Some(index) => {
                self.remove_at(index)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn index_of(&self, value: &Value) -> Option<usize> {
        self.items.borrow().iter().position(|item| item == value)
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.index_of(value).is_some()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.item(index)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn sender(&self) -> Result<ObjectRef, CoreError> {
        match self.this.upgrade() {
            Some(this) => Ok(this),
            None => Err(CoreError::ObjectDropped(self.id)),
        }
    }

    fn check_index(&self, index: usize, len: usize) -> Result<(), CoreError> {
        if index >= len {
            return Err(CoreError::IndexOutOfRange { index, len });
        }
        Ok(())
    }
}

impl Observable for EntityList {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn collection(&self) -> Option<&dyn CollectionNotifier> {
        Some(self)
    }
}

impl CollectionNotifier for EntityList {
    fn len(&self) -> usize {
        self.items.borrow().len()
    }

    fn item(&self, index: usize) -> Option<Value> {
        self.items.borrow().get(index).cloned()
    }

    fn items(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }

    fn insert(&self, index: usize, value: Value) -> Result<(), CoreError> {
        let len = self.len();
        if index > len {
            return Err(CoreError::IndexOutOfRange { index, len });
        }
        let event = CollectionEvent::new(self.sender()?, CollectionAction::Add, index, value);
        self.listeners.collection_changing(&event)?;
        self.items.borrow_mut().insert(index, event.item.clone());
        self.listeners.collection_changed(&event)
    }

    fn remove_at(&self, index: usize) -> Result<Value, CoreError> {
        self.check_index(index, self.len())?;
        let item = self.items.borrow()[index].clone();
        let event = CollectionEvent::new(self.sender()?, CollectionAction::Remove, index, item);
        self.listeners.collection_changing(&event)?;
        self.items.borrow_mut().remove(index);
        self.listeners.collection_changed(&event)?;
        Ok(event.item)
    }

    fn replace(&self, index: usize, value: Value) -> Result<Value, CoreError> {
        self.check_index(index, self.len())?;
        let old = self.items.borrow()[index].clone();
        if old == value {
            return Ok(old);
        }
        let event = CollectionEvent::replace(self.sender()?, index, value, old);
        self.listeners.collection_changing(&event)?;
        self.items.borrow_mut()[index] = event.item.clone();
        self.listeners.collection_changed(&event)?;
        Ok(event.old_item.unwrap_or(Value::Null))
    }

    fn subscribe_collection(&self, listener: Rc<dyn ChangeListener>, priority: Priority) -> ListenerId {
        self.listeners.subscribe(listener, priority)
    }

    fn unsubscribe_collection(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}
