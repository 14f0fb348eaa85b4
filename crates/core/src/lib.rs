pub mod classify;
pub mod entity;
pub mod error;
pub mod identity;
pub mod ids;
pub mod list;
pub mod notify;
pub mod observable;
pub mod value;

pub use classify::{AggregationClassifier, CompositionOnly};
pub use entity::Entity;
pub use error::{CoreError, ProtocolError};
pub use identity::{CollectionKey, ItemKey, PropertyKey};
pub use ids::*;
pub use list::EntityList;
pub use notify::{
    ChangeListener, CollectionAction, CollectionEvent, Listeners, Priority, PropertyEvent,
};
pub use observable::{
    Capabilities, CollectionNotifier, EDITING_PROPERTY, Editable, ObjectRef, Observable,
    PropertyNotifier, Transactional, WeakObjectRef, same_object,
};
pub use value::Value;
