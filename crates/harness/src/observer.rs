use std::rc::Rc;

use retrace_core::{
    ChangeListener, CollectionAction, CollectionEvent, CollectionNotifier, CoreError, Entity,
    EntityList, ListenerId, PropertyEvent, PropertyNotifier, Priority, Value,
};
use retrace_engine::ChangeTracker;

type PropertyHandler = Box<dyn Fn(&PropertyEvent) -> Result<(), CoreError>>;
type CollectionHandler = Box<dyn Fn(&CollectionEvent) -> Result<(), CoreError>>;

/// Observer running a closure after every property change of its source.
pub struct OnPropertyChanged {
    handler: PropertyHandler,
}

impl OnPropertyChanged {
    pub fn new(handler: impl Fn(&PropertyEvent) -> Result<(), CoreError> + 'static) -> Rc<Self> {
        Rc::new(Self {
            handler: Box::new(handler),
        })
    }
}

impl ChangeListener for OnPropertyChanged {
    fn property_changed(&self, event: &PropertyEvent) -> Result<(), CoreError> {
        (self.handler)(event)
    }
}

/// Observer running a closure after every membership change of its source.
pub struct OnCollectionChanged {
    handler: CollectionHandler,
}

impl OnCollectionChanged {
    pub fn new(handler: impl Fn(&CollectionEvent) -> Result<(), CoreError> + 'static) -> Rc<Self> {
        Rc::new(Self {
            handler: Box::new(handler),
        })
    }
}

impl ChangeListener for OnCollectionChanged {
    fn collection_changed(&self, event: &CollectionEvent) -> Result<(), CoreError> {
        (self.handler)(event)
    }
}

/// Keeps `target` at `source * factor` on `entity`.
///
/// With `declared` set the write is wrapped in a declared edit, so it nests
/// under the change that triggered it; without, the tracker rejects it.
pub fn derive_property(
    entity: &Rc<Entity>,
    tracker: &Rc<ChangeTracker>,
    source: &'static str,
    target: &'static str,
    factor: i64,
    declared: bool,
) -> ListenerId {
    let entity_ref = Rc::downgrade(entity);
    let tracker_ref = Rc::downgrade(tracker);
    let listener = OnPropertyChanged::new(move |event| {
        if event.property != source {
            return Ok(());
        }
        let (Some(entity), Some(value)) = (entity_ref.upgrade(), event.value.as_integer()) else {
            return Ok(());
        };
        let derived = Value::Integer(value * factor);
        match tracker_ref.upgrade() {
            Some(tracker) if declared => tracker.run_declared(|| entity.set(target, derived)),
            _ => entity.set(target, derived),
        }
    });
    entity.subscribe_properties(listener, Priority::Observer)
}

/// Appends one entry to `log` for every item added to `source`.
///
/// Unlike [`derive_property`] the reaction is not idempotent: running it
/// twice for one addition leaves two entries.
pub fn log_additions(
    source: &Rc<EntityList>,
    tracker: &Rc<ChangeTracker>,
    log: &Rc<EntityList>,
) -> ListenerId {
    let log_ref = Rc::downgrade(log);
    let tracker_ref = Rc::downgrade(tracker);
    let listener = OnCollectionChanged::new(move |event| {
        if event.action != CollectionAction::Add {
            return Ok(());
        }
        let (Some(log), Some(tracker)) = (log_ref.upgrade(), tracker_ref.upgrade()) else {
            return Ok(());
        };
        let entry = Value::from(format!("added at {}", event.index));
        tracker.run_declared(|| log.push(entry))
    });
    source.subscribe_collection(listener, Priority::Observer)
}
