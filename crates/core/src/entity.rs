use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use crate::error::CoreError;
use crate::ids::{ListenerId, ObjectId};
use crate::notify::{ChangeListener, Listeners, PropertyEvent, Priority};
use crate::observable::{EDITING_PROPERTY, Editable, ObjectRef, Observable, PropertyNotifier};
use crate::value::Value;

#[derive(Default)]
struct EntityState {
    fields: BTreeMap<String, Value>,
    frozen: BTreeSet<String>,
    editing: bool,
    edit_action: Option<String>,
    edit_cancelled: bool,
}

/// A property bag that reports every write and supports edit blocks.
///
/// Unset properties read as [`Value::Null`]; writing `Null` removes the
/// field.
pub struct Entity {
    id: ObjectId,
    type_name: String,
    this: Weak<Entity>,
    state: RefCell<EntityState>,
    listeners: Listeners,
}

impl Entity {
    pub fn new(type_name: &str) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id: ObjectId::new(),
            type_name: type_name.to_string(),
            this: this.clone(),
            state: RefCell::new(EntityState::default()),
            listeners: Listeners::new(),
        })
    }

    pub fn with_fields(type_name: &str, fields: Vec<(&str, Value)>) -> Rc<Self> {
        let entity = Self::new(type_name);
        {
            let mut state = entity.state.borrow_mut();
            for (key, value) in fields {
                if !value.is_null() {
                    state.fields.insert(key.to_string(), value);
                }
            }
        }
        entity
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn get(&self, name: &str) -> Value {
        self.property(name).unwrap_or(Value::Null)
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), CoreError> {
        self.set_property(name, value.into())
    }

    /// Writes to a frozen property announce a cancelled change and are
    /// otherwise ignored.
    pub fn freeze(&self, name: &str) {
        self.state.borrow_mut().frozen.insert(name.to_string());
    }

    pub fn thaw(&self, name: &str) {
        self.state.borrow_mut().frozen.remove(name);
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

    fn set_editing(&self, editing: bool) -> Result<(), CoreError> {
        let sender = self.sender()?;
        self.listeners.property_changing(&PropertyEvent::new(
            Rc::clone(&sender),
            EDITING_PROPERTY,
            Value::Boolean(!editing),
        ))?;
        self.state.borrow_mut().editing = editing;
        self.listeners
            .property_changed(&PropertyEvent::new(sender, EDITING_PROPERTY, Value::Boolean(editing)))
    }
}

impl Observable for Entity {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn properties(&self) -> Option<&dyn PropertyNotifier> {
        Some(self)
    }

    fn editable(&self) -> Option<&dyn Editable> {
        Some(self)
    }
}

impl PropertyNotifier for Entity {
    fn property_names(&self) -> Vec<String> {
        self.state.borrow().fields.keys().cloned().collect()
    }

    fn property(&self, name: &str) -> Option<Value> {
        let state = self.state.borrow();
        if name == EDITING_PROPERTY {
            return Some(Value::Boolean(state.editing));
        }
        state.fields.get(name).cloned()
    }

    fn set_property(&self, name: &str, value: Value) -> Result<(), CoreError> {
        if name == EDITING_PROPERTY {
            return Err(CoreError::InvalidValue {
                member: name.to_string(),
                reason: "editing is toggled through begin_edit/end_edit".into(),
            });
        }
        let old = self.get(name);
        if old == value {
            return Ok(());
        }
        let sender = self.sender()?;

        if self.state.borrow().frozen.contains(name) {
            return self
                .listeners
                .property_changing(&PropertyEvent::cancelled(sender, name, old));
        }

        self.listeners
            .property_changing(&PropertyEvent::new(Rc::clone(&sender), name, old))?;
        {
            let mut state = self.state.borrow_mut();
            if value.is_null() {
                state.fields.remove(name);
            } else {
                state.fields.insert(name.to_string(), value.clone());
            }
        }
        self.listeners
            .property_changed(&PropertyEvent::new(sender, name, value))
    }

    fn subscribe_properties(&self, listener: Rc<dyn ChangeListener>, priority: Priority) -> ListenerId {
        self.listeners.subscribe(listener, priority)
    }

    fn unsubscribe_properties(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}

impl Editable for Entity {
    fn is_editing(&self) -> bool {
        self.state.borrow().editing
    }

    fn current_edit_action(&self) -> Option<String> {
        self.state.borrow().edit_action.clone()
    }

    fn edit_was_cancelled(&self) -> bool {
        self.state.borrow().edit_cancelled
    }

    fn begin_edit(&self, action: &str) -> Result<(), CoreError> {
        {
            let mut state = self.state.borrow_mut();
            if state.editing {
                return Err(CoreError::AlreadyEditing(self.id));
            }
            state.edit_action = Some(action.to_string());
            state.edit_cancelled = false;
        }
        let result = self.set_editing(true);
        if result.is_err() && !self.is_editing() {
            self.state.borrow_mut().edit_action = None;
        }
        result
    }

    fn end_edit(&self) -> Result<(), CoreError> {
        if !self.is_editing() {
            return Err(CoreError::NotEditing(self.id));
        }
        self.set_editing(false)?;
        self.state.borrow_mut().edit_action = None;
        Ok(())
    }

    fn cancel_edit(&self) -> Result<(), CoreError> {
        if !self.is_editing() {
            return Err(CoreError::NotEditing(self.id));
        }
        self.state.borrow_mut().edit_cancelled = true;
        self.set_editing(false)?;
        self.state.borrow_mut().edit_action = None;
        Ok(())
    }
}
