use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::CoreError;
use crate::ids::{ListenerId, ObjectId};
use crate::notify::{ChangeListener, Priority};
use crate::value::Value;

pub type ObjectRef = Rc<dyn Observable>;
pub type WeakObjectRef = Weak<dyn Observable>;

/// Boolean property whose false->true and true->false transitions open and
/// close a compound edit on an [`Editable`] object.
pub const EDITING_PROPERTY: &str = "IsEditing";

/// Notification interfaces an object exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub properties: bool,
    pub collection: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        properties: false,
        collection: false,
    };

    pub fn is_empty(&self) -> bool {
        !self.properties && !self.collection
    }
}

/// A node of the observed graph.
pub trait Observable {
    fn object_id(&self) -> ObjectId;

    fn type_name(&self) -> &str;

    fn properties(&self) -> Option<&dyn PropertyNotifier> {
        None
    }

    fn collection(&self) -> Option<&dyn CollectionNotifier> {
        None
    }

    fn editable(&self) -> Option<&dyn Editable> {
        None
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            properties: self.properties().is_some(),
            collection: self.collection().is_some(),
        }
    }
}

impl fmt::Debug for dyn Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:?}", self.type_name(), self.object_id())
    }
}

/// Identity comparison of two graph nodes.
pub fn same_object(a: &ObjectRef, b: &ObjectRef) -> bool {
    a.object_id() == b.object_id()
}

pub trait PropertyNotifier {
    fn property_names(&self) -> Vec<String>;

    fn property(&self, name: &str) -> Option<Value>;

    /// Writes a property, firing "about to change" and "changed" around the
    /// write. Writing the current value is a no-op and fires nothing.
    fn set_property(&self, name: &str, value: Value) -> Result<(), CoreError>;

    fn subscribe_properties(&self, listener: Rc<dyn ChangeListener>, priority: Priority) -> ListenerId;

    fn unsubscribe_properties(&self, id: ListenerId) -> bool;
}

pub trait CollectionNotifier {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn item(&self, index: usize) -> Option<Value>;

    fn items(&self) -> Vec<Value>;

    fn insert(&self, index: usize, value: Value) -> Result<(), CoreError>;

    fn remove_at(&self, index: usize) -> Result<Value, CoreError>;

    /// Replaces the item at `index`, returning the previous item.
    fn replace(&self, index: usize, value: Value) -> Result<Value, CoreError>;

    fn subscribe_collection(&self, listener: Rc<dyn ChangeListener>, priority: Priority) -> ListenerId;

    fn unsubscribe_collection(&self, id: ListenerId) -> bool;
}

/// Objects supporting begin/end edit blocks. Toggling editing must be
/// reported as a change of [`EDITING_PROPERTY`].
pub trait Editable {
    fn is_editing(&self) -> bool;

    fn current_edit_action(&self) -> Option<String>;

    fn edit_was_cancelled(&self) -> bool;

    fn begin_edit(&self, action: &str) -> Result<(), CoreError>;

    fn end_edit(&self) -> Result<(), CoreError>;

    fn cancel_edit(&self) -> Result<(), CoreError>;
}

/// Values with their own begin/commit/rollback protocol.
pub trait Transactional {
    fn begin(&self);

    fn commit(&self);

    fn rollback(&self);
}
