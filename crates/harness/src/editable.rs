use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use retrace_core::{
    ChangeListener, CoreError, EDITING_PROPERTY, Editable, ListenerId, Listeners, ObjectId,
    ObjectRef, Observable, PropertyEvent, PropertyNotifier, Priority, Value,
};

/// An editable object that never checks its own edit state.
///
/// Every `begin_edit` announces `IsEditing` going false -> true and every
/// `end_edit` true -> false, whatever the current state, the way a source
/// with a broken edit-state machine would.
pub struct UncheckedEditable {
    id: ObjectId,
    this: Weak<UncheckedEditable>,
    editing: Cell<bool>,
    action: RefCell<Option<String>>,
    listeners: Listeners,
}

impl UncheckedEditable {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id: ObjectId::new(),
            this: this.clone(),
            editing: Cell::new(false),
            action: RefCell::new(None),
            listeners: Listeners::new(),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    fn sender(&self) -> Result<ObjectRef, CoreError> {
        match self.this.upgrade() {
            Some(this) => Ok(this),
            None => Err(CoreError::ObjectDropped(self.id)),
        }
    }

    fn announce(&self, editing: bool) -> Result<(), CoreError> {
        let sender = self.sender()?;
        self.listeners.property_changing(&PropertyEvent::new(
            Rc::clone(&sender),
            EDITING_PROPERTY,
            Value::Boolean(!editing),
        ))?;
        self.editing.set(editing);
        self.listeners
            .property_changed(&PropertyEvent::new(sender, EDITING_PROPERTY, Value::Boolean(editing)))
    }
}

impl Observable for UncheckedEditable {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn type_name(&self) -> &str {
        "Unchecked"
    }

    fn properties(&self) -> Option<&dyn PropertyNotifier> {
        Some(self)
    }

    fn editable(&self) -> Option<&dyn Editable> {
        Some(self)
    }
}

impl PropertyNotifier for UncheckedEditable {
    fn property_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn property(&self, name: &str) -> Option<Value> {
        (name == EDITING_PROPERTY).then(|| Value::Boolean(self.editing.get()))
    }

    fn set_property(&self, name: &str, _value: Value) -> Result<(), CoreError> {
        Err(CoreError::InvalidValue {
            member: name.to_string(),
            reason: "read-only".into(),
        })
    }

    fn subscribe_properties(&self, listener: Rc<dyn ChangeListener>, priority: Priority) -> ListenerId {
        self.listeners.subscribe(listener, priority)
    }

    fn unsubscribe_properties(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}

impl Editable for UncheckedEditable {
    fn is_editing(&self) -> bool {
        self.editing.get()
    }

    fn current_edit_action(&self) -> Option<String> {
        self.action.borrow().clone()
    }

    fn edit_was_cancelled(&self) -> bool {
        false
    }

    fn begin_edit(&self, action: &str) -> Result<(), CoreError> {
        *self.action.borrow_mut() = Some(action.to_string());
        self.announce(true)
    }

    fn end_edit(&self) -> Result<(), CoreError> {
        self.announce(false)
    }

    fn cancel_edit(&self) -> Result<(), CoreError> {
        self.announce(false)
    }
}
