use std::cell::{Ref, RefCell};
use std::rc::{Rc, Weak};

use retrace_core::{AggregationClassifier, CoreError, MementoId, ObjectRef, ProtocolError};

use crate::config::UndoConfig;
use crate::error::EngineError;
use crate::memento::Memento;
use crate::tracker::{ChangeTracker, RestoreDirection};
use crate::undo::{Delivery, Evicted, UndoStacks};

type RestoreHook = fn(&ChangeTracker, &Memento) -> Result<(), CoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoResult {
    /// The unit with this id was restored.
    Applied(MementoId),
    Empty,
}

/// Undo and redo stacks fed by a [`ChangeTracker`].
///
/// Fresh changes land on the undo stack and invalidate redo. Undoing
/// restores the top unit while the tracker records the restore itself, and
/// that recording becomes the matching redo unit (and vice versa), so a
/// unit never needs a hand-written inverse.
pub struct UndoRedoManager {
    tracker: Rc<ChangeTracker>,
    stacks: Rc<RefCell<UndoStacks>>,
    config: UndoConfig,
}

impl UndoRedoManager {
    pub fn new() -> Self {
        Self::build(UndoConfig::default())
    }

    pub fn with_config(config: UndoConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: UndoConfig) -> Self {
        let tracker = ChangeTracker::new();
        tracker.set_excluded_types(config.excluded_types.iter().cloned());
        let stacks = Rc::new(RefCell::new(UndoStacks::new(config.max_depth)));

        let sink_stacks = Rc::clone(&stacks);
        let sink_tracker = Rc::downgrade(&tracker);
        tracker.set_memento_sink(Box::new(move |memento| {
            let evicted = sink_stacks.borrow_mut().accept(memento);
            notify_evicted(&sink_tracker, evicted);
        }));

        Self {
            tracker,
            stacks,
            config,
        }
    }

    pub fn tracker(&self) -> &Rc<ChangeTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &UndoConfig {
        &self.config
    }

    pub fn set_classifier(&self, classifier: Rc<dyn AggregationClassifier>) {
        self.tracker.set_classifier(classifier);
    }

    /// Starts tracking a new graph. History of the previous one is dropped.
    pub fn set_observable(&mut self, root: Option<ObjectRef>) -> Result<(), EngineError> {
        self.clear();
        self.tracker.set_observable(root)?;
        Ok(())
    }

    pub fn undo(&mut self) -> Result<UndoResult, EngineError> {
        self.ensure_tracking()?;
        let Some(memento) = self.stacks.borrow_mut().pop_undo() else {
            return Ok(UndoResult::Empty);
        };
        self.replay(memento, RestoreDirection::Undo)
    }

    pub fn redo(&mut self) -> Result<UndoResult, EngineError> {
        self.ensure_tracking()?;
        let Some(memento) = self.stacks.borrow_mut().pop_redo() else {
            return Ok(UndoResult::Empty);
        };
        self.replay(memento, RestoreDirection::Redo)
    }

    /// History is left untouched when tracking is off.
    fn ensure_tracking(&self) -> Result<(), EngineError> {
        if self.tracker.is_tracking() {
            Ok(())
        } else {
            Err(ProtocolError::TrackingDisabled.into())
        }
    }

    fn replay(&mut self, memento: Memento, direction: RestoreDirection) -> Result<UndoResult, EngineError> {
        let id = memento.id();
        let (before, after): (RestoreHook, RestoreHook) = match direction {
            RestoreDirection::Undo => (ChangeTracker::on_before_undo, ChangeTracker::on_after_undo),
            RestoreDirection::Redo => (ChangeTracker::on_before_redo, ChangeTracker::on_after_redo),
        };
        let delivery = match direction {
            RestoreDirection::Undo => Delivery::UndoReplay,
            RestoreDirection::Redo => Delivery::RedoReplay,
        };

        self.stacks.borrow_mut().set_delivery(delivery);
        let result = before(&self.tracker, &memento)
            .and_then(|()| memento.restore())
            .and_then(|()| after(&self.tracker, &memento));
        self.stacks.borrow_mut().set_delivery(Delivery::Forward);

        match result {
            Ok(()) => {
                tracing::debug!(direction = direction.as_str(), memento = %memento, "restored");
                Ok(UndoResult::Applied(id))
            }
            Err(err) => {
                tracing::error!(direction = direction.as_str(), memento = %memento, error = %err, "restore failed");
                self.tracker.abort();
                self.clear();
                Err(err.into())
            }
        }
    }

    /// Empties both stacks.
    pub fn clear(&mut self) {
        let evicted = self.stacks.borrow_mut().clear();
        notify_evicted(&Rc::downgrade(&self.tracker), evicted);
    }

    pub fn can_undo(&self) -> bool {
        self.undo_depth() > 0
    }

    pub fn can_redo(&self) -> bool {
        self.redo_depth() > 0
    }

    pub fn undo_depth(&self) -> usize {
        self.stacks.borrow().undo_depth()
    }

    pub fn redo_depth(&self) -> usize {
        self.stacks.borrow().redo_depth()
    }

    pub fn undo_labels(&self) -> Vec<String> {
        self.stacks.borrow().undo_labels()
    }

    pub fn redo_labels(&self) -> Vec<String> {
        self.stacks.borrow().redo_labels()
    }

    /// The unit the next [`undo`](Self::undo) would restore. Drop the guard
    /// before mutating the graph.
    pub fn peek_undo(&self) -> Option<Ref<'_, Memento>> {
        Ref::filter_map(self.stacks.borrow(), UndoStacks::peek_undo).ok()
    }

    pub fn peek_redo(&self) -> Option<Ref<'_, Memento>> {
        Ref::filter_map(self.stacks.borrow(), UndoStacks::peek_redo).ok()
    }
}

impl Default for UndoRedoManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UndoRedoManager {
    fn drop(&mut self) {
        self.tracker.clear_memento_sink();
        if let Err(err) = self.tracker.set_observable(None) {
            tracing::warn!(error = %err, "failed to release tracked graph");
        }
    }
}

fn notify_evicted(tracker: &Weak<ChangeTracker>, evicted: Vec<Evicted>) {
    let Some(tracker) = tracker.upgrade() else {
        return;
    };
    for unit in evicted {
        match &unit {
            Evicted::Undo(memento) => tracker.on_before_remove_undo(memento),
            Evicted::Redo(memento) => tracker.on_before_remove_redo(memento),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::{Entity, Value};

    fn managed(shape: &Rc<Entity>) -> UndoRedoManager {
        let mut manager = UndoRedoManager::new();
        let root: ObjectRef = shape.clone();
        manager.set_observable(Some(root)).unwrap();
        manager
    }

    #[test]
    fn undo_and_redo_round_trip() {
        let shape = Entity::with_fields("Shape", vec![("Value", Value::Integer(2))]);
        let mut manager = managed(&shape);

        shape.set("Value", 5i64).unwrap();
        assert_eq!(manager.undo_depth(), 1);

        assert!(matches!(manager.undo().unwrap(), UndoResult::Applied(_)));
        assert_eq!(shape.get("Value"), Value::Integer(2));
        assert_eq!((manager.undo_depth(), manager.redo_depth()), (0, 1));

        assert!(matches!(manager.redo().unwrap(), UndoResult::Applied(_)));
        assert_eq!(shape.get("Value"), Value::Integer(5));
        assert_eq!((manager.undo_depth(), manager.redo_depth()), (1, 0));
    }

    #[test]
    fn empty_stacks_report_empty() {
        let shape = Entity::new("Shape");
        let mut manager = managed(&shape);
        assert_eq!(manager.undo().unwrap(), UndoResult::Empty);
        assert_eq!(manager.redo().unwrap(), UndoResult::Empty);
        assert!(!manager.can_undo());
        assert!(!manager.can_redo());
    }

    #[test]
    fn new_change_invalidates_redo() {
        let shape = Entity::new("Shape");
        let mut manager = managed(&shape);
        shape.set("X", 1i64).unwrap();
        manager.undo().unwrap();
        assert!(manager.can_redo());

        shape.set("X", 3i64).unwrap();
        assert!(!manager.can_redo());
        assert_eq!(manager.undo_labels(), vec!["set Shape.X"]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = UndoConfig::new().with_max_depth(0);
        assert!(matches!(
            UndoRedoManager::with_config(config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn depth_limit_drops_oldest_unit() {
        let shape = Entity::new("Shape");
        let mut manager =
            UndoRedoManager::with_config(UndoConfig::new().with_max_depth(2)).unwrap();
        let root: ObjectRef = shape.clone();
        manager.set_observable(Some(root)).unwrap();

        for value in 1..=3i64 {
            shape.set("X", value).unwrap();
        }
        assert_eq!(manager.undo_depth(), 2);
        manager.undo().unwrap();
        manager.undo().unwrap();
        assert_eq!(shape.get("X"), Value::Integer(1));
        assert_eq!(manager.undo().unwrap(), UndoResult::Empty);
    }

    #[test]
    fn dropping_manager_releases_subscriptions() {
        let shape = Entity::new("Shape");
        let manager = managed(&shape);
        assert_eq!(shape.listener_count(), 1);
        drop(manager);
        assert_eq!(shape.listener_count(), 0);
    }

    #[test]
    fn peek_shows_next_unit() {
        let shape = Entity::new("Shape");
        let manager = managed(&shape);
        shape.set("X", 1i64).unwrap();
        let next = manager.peek_undo().unwrap();
        assert_eq!(next.as_property().unwrap().new_value, Some(Value::Integer(1)));
        assert!(manager.peek_redo().is_none());
    }
}
