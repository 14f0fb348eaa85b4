use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use retrace_core::{
    AggregationClassifier, ChangeListener, CollectionAction, CollectionEvent, CollectionKey,
    CompositionOnly, CoreError, EDITING_PROPERTY, MementoId, ObjectId, ObjectRef, PropertyEvent,
    PropertyKey, ProtocolError,
};

use crate::disconnected::DisconnectedSet;
use crate::memento::{CollectionMemento, CompoundMemento, Memento, PropertyMemento};
use crate::subscription::{Subscription, composed_children};
use crate::thread::ThreadAffinity;

/// Receives every completed top-level undo unit.
pub type MementoSink = Box<dyn FnMut(Memento)>;

/// Which subscription a notification arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePath {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreDirection {
    Undo,
    Redo,
}

impl RestoreDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

struct TrackerListener {
    tracker: Weak<ChangeTracker>,
    path: CapturePath,
}

impl ChangeListener for TrackerListener {
    fn property_changing(&self, event: &PropertyEvent) -> Result<(), CoreError> {
        match self.tracker.upgrade() {
            Some(tracker) => tracker.property_changing(event, self.path),
            None => Ok(()),
        }
    }

    fn property_changed(&self, event: &PropertyEvent) -> Result<(), CoreError> {
        match self.tracker.upgrade() {
            Some(tracker) => tracker.property_changed(event, self.path),
            None => Ok(()),
        }
    }

    fn collection_changing(&self, event: &CollectionEvent) -> Result<(), CoreError> {
        match self.tracker.upgrade() {
            Some(tracker) => tracker.collection_changing(event, self.path),
            None => Ok(()),
        }
    }

    fn collection_changed(&self, event: &CollectionEvent) -> Result<(), CoreError> {
        match self.tracker.upgrade() {
            Some(tracker) => tracker.collection_changed(event, self.path),
            None => Ok(()),
        }
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct InFlight {
    /// Index of the frame on the stack.
    frame: usize,
    path: CapturePath,
}

/// Side effects decided while the state was borrowed, run after releasing it.
#[derive(Default)]
struct Effects {
    begin: Vec<ObjectRef>,
    rollback: Vec<ObjectRef>,
    deliver: Vec<Memento>,
}

enum Route {
    Capture,
    Ignore,
    Reject,
}

struct RestoreContext {
    direction: RestoreDirection,
    unit: MementoId,
    label: String,
    sources: HashSet<MementoId>,
    properties: HashSet<PropertyKey>,
    collections: HashSet<ObjectId>,
    delivered: Vec<Memento>,
}

impl RestoreContext {
    fn new(direction: RestoreDirection, memento: &Memento) -> Self {
        let mut sources = HashSet::new();
        let mut properties = HashSet::new();
        let mut collections = HashSet::new();
        memento.walk(&mut |m| {
            sources.insert(m.id());
            match m {
                Memento::Property(p) => {
                    properties.insert(PropertyKey::new(&p.instance, &p.property));
                }
                Memento::Collection(c) => {
                    collections.insert(c.list.object_id());
                }
                Memento::Compound(_) => {}
            }
        });
        Self {
            direction,
            unit: memento.id(),
            label: action_label(memento),
            sources,
            properties,
            collections,
            delivered: Vec::new(),
        }
    }

    /// Zero, one, or a group of the units the restore produced.
    fn into_memento(mut self) -> Option<Memento> {
        match self.delivered.len() {
            0 => None,
            1 => self.delivered.pop(),
            _ => Some(Memento::Compound(CompoundMemento::group(
                format!("{} {}", self.direction.as_str(), self.label),
                self.delivered,
            ))),
        }
    }
}

/// Label of the action behind `memento`, without the direction prefix a
/// replayed group carries.
fn action_label(memento: &Memento) -> String {
    let label = memento.to_string();
    let replayed = memento.as_compound().is_some_and(|c| c.subject.is_none());
    if replayed {
        for direction in [RestoreDirection::Undo, RestoreDirection::Redo] {
            if let Some(action) = label.strip_prefix(direction.as_str()).and_then(|l| l.strip_prefix(' ')) {
                return action.to_string();
            }
        }
    }
    label
}

struct Hooks {
    connected: Rc<dyn ChangeListener>,
    disconnected: Rc<dyn ChangeListener>,
}

struct TrackerState {
    enabled: bool,
    root: Option<ObjectRef>,
    excluded_types: HashSet<String>,
    classifier: Rc<dyn AggregationClassifier>,
    hooks: Hooks,
    subscriptions: HashMap<ObjectId, Subscription>,
    disconnected: DisconnectedSet,
    stack: Vec<Memento>,
    in_flight_properties: HashMap<PropertyKey, InFlight>,
    in_flight_collections: HashMap<CollectionKey, InFlight>,
    cascade_depth: usize,
    /// Cascade depth at which each open declared edit began.
    declared_edits: Vec<usize>,
    restore: Option<RestoreContext>,
}

impl TrackerState {
    fn new(hooks: Hooks) -> Self {
        Self {
            enabled: true,
            root: None,
            excluded_types: HashSet::new(),
            classifier: Rc::new(CompositionOnly),
            hooks,
            subscriptions: HashMap::new(),
            disconnected: DisconnectedSet::default(),
            stack: Vec::new(),
            in_flight_properties: HashMap::new(),
            in_flight_collections: HashMap::new(),
            cascade_depth: 0,
            declared_edits: Vec::new(),
            restore: None,
        }
    }

    fn ensure_consistent(&self) -> Result<(), ProtocolError> {
        let frames = self.stack.len();
        let properties = self.in_flight_properties.len();
        let collections = self.in_flight_collections.len();
        if frames == 0 && properties == 0 && collections == 0 {
            Ok(())
        } else {
            Err(ProtocolError::InconsistentState {
                frames,
                properties,
                collections,
            })
        }
    }

    // ---- subscriptions ----------------------------------------------------

    fn is_excluded(&self, object: &ObjectRef) -> bool {
        self.excluded_types.contains(object.type_name())
    }

    fn connect(&mut self, object: &ObjectRef) {
        let mut visited = HashSet::new();
        self.subscribe_deep(object, &mut visited);
    }

    fn subscribe_deep(&mut self, object: &ObjectRef, visited: &mut HashSet<ObjectId>) {
        let id = object.object_id();
        if !visited.insert(id) || self.is_excluded(object) {
            return;
        }
        if let Some(subscription) = self.disconnected.remove(id) {
            subscription.detach();
            tracing::trace!(object = ?object, "reconnected");
        }
        if !self.subscriptions.contains_key(&id)
            && let Some(subscription) = Subscription::attach(object, &self.hooks.connected)
        {
            self.subscriptions.insert(id, subscription);
        }
        for child in composed_children(object, &*self.classifier) {
            self.subscribe_deep(&child, visited);
        }
    }

    /// Ids reachable from the root through composition edges.
    fn reachable_from_root(&self) -> HashSet<ObjectId> {
        let mut reachable = HashSet::new();
        let mut pending: Vec<ObjectRef> = self.root.iter().cloned().collect();
        while let Some(current) = pending.pop() {
            if self.is_excluded(&current) || !reachable.insert(current.object_id()) {
                continue;
            }
            pending.extend(composed_children(&current, &*self.classifier));
        }
        reachable
    }

    /// Moves the part of the composition subtree of `object` that is no
    /// longer reachable from the root onto the disconnected path.
    fn disconnect(&mut self, object: &ObjectRef, owner: MementoId) {
        let reachable = self.reachable_from_root();
        let mut visited = HashSet::new();
        let mut pending = vec![Rc::clone(object)];
        while let Some(current) = pending.pop() {
            let id = current.object_id();
            if !visited.insert(id) || self.is_excluded(&current) {
                continue;
            }
            if reachable.contains(&id) {
                tracing::trace!(object = ?current, "still reachable, kept connected");
                continue;
            }
            if let Some(subscription) = self.subscriptions.remove(&id) {
                subscription.detach();
            }
            if !self.disconnected.contains(id)
                && let Some(subscription) = Subscription::attach(&current, &self.hooks.disconnected)
            {
                tracing::trace!(object = ?current, "disconnected");
                self.disconnected.insert(id, subscription, owner);
            }
            pending.extend(composed_children(&current, &*self.classifier));
        }
    }

    fn release_all(&mut self) {
        for (_, subscription) in self.subscriptions.drain() {
            subscription.detach();
        }
        for subscription in self.disconnected.drain() {
            subscription.detach();
        }
    }

    fn subscribe_root(&mut self) {
        if let Some(root) = self.root.clone() {
            self.connect(&root);
            tracing::debug!(
                root = ?root,
                subscribed = self.subscriptions.len(),
                "subscribed object graph"
            );
        }
    }

    /// Drops every unit in progress, returning the transactional values to
    /// roll back.
    fn reset_in_flight(&mut self) -> Vec<ObjectRef> {
        let mut rollback = Vec::new();
        for memento in self.stack.drain(..) {
            rollback.extend(memento.transactional_values());
        }
        if let Some(restore) = self.restore.take() {
            for memento in &restore.delivered {
                rollback.extend(memento.transactional_values());
            }
        }
        self.in_flight_properties.clear();
        self.in_flight_collections.clear();
        self.disconnected.pending_properties.clear();
        self.disconnected.pending_collections.clear();
        self.cascade_depth = 0;
        self.declared_edits.clear();
        rollback
    }

    // ---- routing ----------------------------------------------------------

    fn route_disconnected(&self, restore_match: bool, connected_in_flight: bool) -> Route {
        if connected_in_flight {
            Route::Ignore
        } else if restore_match || !self.declared_edits.is_empty() {
            Route::Capture
        } else {
            Route::Reject
        }
    }

    fn check_cascade(&self, object: ObjectId, member: &str) -> Result<(), ProtocolError> {
        if self.cascade_depth == 0 {
            return Ok(());
        }
        // A replayed unit already carries every effect its cause had.
        if self.restore.is_some() {
            return Err(ProtocolError::SideEffectDuringRestore {
                object,
                member: member.to_string(),
                depth: self.cascade_depth,
            });
        }
        let expected = self.declared_edits.last().copied();
        if expected == Some(self.cascade_depth) {
            Ok(())
        } else {
            Err(ProtocolError::UndeclaredSideEffect {
                object,
                member: member.to_string(),
                depth: self.cascade_depth,
                expected,
            })
        }
    }

    fn push_frame(&mut self, memento: Memento) -> usize {
        let frame = self.stack.len();
        self.stack.push(memento);
        self.cascade_depth += 1;
        frame
    }

    /// Routes a completed memento: discard, hoist, nest, buffer, or deliver.
    fn finish(&mut self, memento: Memento, effects: &mut Effects) -> Result<(), ProtocolError> {
        if !memento.is_filled() {
            tracing::trace!(memento = %memento, "dropping unit with no effect");
            effects.rollback.extend(
                memento
                    .captured_objects()
                    .into_iter()
                    .filter(|obj| obj.transactional().is_some()),
            );
            for child in memento.into_children() {
                self.finish(child, effects)?;
            }
            return Ok(());
        }
        if let Some(parent) = self.stack.last_mut() {
            parent.push_child(memento);
            return Ok(());
        }
        if let Some(restore) = self.restore.as_mut() {
            restore.delivered.push(memento);
            return Ok(());
        }
        self.ensure_consistent()?;
        effects.deliver.push(memento);
        Ok(())
    }

    // ---- property notifications --------------------------------------------

    fn property_changing(
        &mut self,
        event: &PropertyEvent,
        path: CapturePath,
    ) -> Result<Effects, ProtocolError> {
        let mut effects = Effects::default();
        if !self.enabled || event.cancelled {
            return Ok(effects);
        }
        let key = PropertyKey::of(event);

        match path {
            CapturePath::Disconnected => {
                if !self.disconnected.contains(key.object) {
                    return Ok(effects);
                }
                let connected_in_flight = self
                    .in_flight_properties
                    .get(&key)
                    .is_some_and(|f| f.path == CapturePath::Connected);
                let restore_match = self
                    .restore
                    .as_ref()
                    .is_some_and(|r| r.properties.contains(&key));
                match self.route_disconnected(restore_match, connected_in_flight) {
                    Route::Capture => {}
                    Route::Ignore => {
                        self.disconnected.pending_properties.insert(key);
                        return Ok(effects);
                    }
                    Route::Reject => {
                        return Err(ProtocolError::DisconnectedMutation {
                            object: key.object,
                            member: key.property,
                        });
                    }
                }
            }
            CapturePath::Connected => {
                if let Some(subscription) = self.disconnected.remove(key.object) {
                    subscription.detach();
                }
            }
        }

        if let Some(existing) = self.in_flight_properties.get_mut(&key) {
            if existing.path == CapturePath::Disconnected && path == CapturePath::Connected {
                tracing::warn!(key = ?key, "change seen on both paths, keeping the connected one");
                existing.path = CapturePath::Connected;
                self.disconnected.pending_properties.insert(key);
                return Ok(effects);
            }
            return Err(ProtocolError::AlreadyChanging {
                object: key.object,
                member: key.property,
            });
        }

        self.check_cascade(key.object, &key.property)?;
        if self.stack.is_empty() {
            self.ensure_consistent()?;
        }
        if let Some(old) = event.value.as_object()
            && old.transactional().is_some()
        {
            effects.begin.push(Rc::clone(old));
        }
        let memento = PropertyMemento::capture(event, path == CapturePath::Disconnected);
        let frame = self.push_frame(Memento::Property(memento));
        self.in_flight_properties.insert(key, InFlight { frame, path });
        Ok(effects)
    }

    fn property_changed(
        &mut self,
        event: &PropertyEvent,
        path: CapturePath,
    ) -> Result<Effects, ProtocolError> {
        let mut effects = Effects::default();
        if !self.enabled || event.cancelled {
            return Ok(effects);
        }
        let key = PropertyKey::of(event);

        if path == CapturePath::Disconnected {
            if self.disconnected.pending_properties.remove(&key) {
                return Ok(effects);
            }
            match self.in_flight_properties.get(&key) {
                Some(f) if f.path == CapturePath::Connected => return Ok(effects),
                Some(_) => {}
                None if !self.disconnected.contains(key.object) => return Ok(effects),
                None => {
                    return Err(ProtocolError::DisconnectedMutation {
                        object: key.object,
                        member: key.property,
                    });
                }
            }
        }

        let Some(in_flight) = self.in_flight_properties.remove(&key) else {
            return Err(ProtocolError::UnmatchedChanged {
                object: key.object,
                member: key.property,
            });
        };
        if in_flight.frame + 1 != self.stack.len() {
            return Err(ProtocolError::OutOfOrderCompletion {
                object: key.object,
                member: key.property,
            });
        }
        let mut memento = match self.stack.pop() {
            Some(Memento::Property(memento)) => memento,
            _ => {
                return Err(ProtocolError::OutOfOrderCompletion {
                    object: key.object,
                    member: key.property,
                });
            }
        };
        self.cascade_depth = self.cascade_depth.saturating_sub(1);
        memento.new_value = Some(event.value.clone());

        if memento.property == EDITING_PROPERTY && event.sender.editable().is_some() {
            match (memento.old_value.as_boolean(), event.value.as_boolean()) {
                (Some(false), Some(true)) => {
                    self.open_compound(memento, &event.sender)?;
                    return Ok(effects);
                }
                (Some(true), Some(false)) => {
                    self.close_compound(memento, &event.sender, &mut effects)?;
                    return Ok(effects);
                }
                _ => {}
            }
        }

        if !self
            .classifier
            .is_aggregation_property(&*event.sender, &memento.property)
        {
            if let Some(old) = memento.old_value.as_object() {
                let old = Rc::clone(old);
                self.disconnect(&old, memento.id);
            }
            if let Some(new) = event.value.as_object() {
                self.connect(new);
            }
        }
        if let Some(new) = event.value.as_object()
            && new.transactional().is_some()
        {
            effects.begin.push(Rc::clone(new));
        }
        self.finish(Memento::Property(memento), &mut effects)?;
        Ok(effects)
    }

    fn open_compound(
        &mut self,
        editing: PropertyMemento,
        subject: &ObjectRef,
    ) -> Result<(), ProtocolError> {
        let subject_id = subject.object_id();
        let already_open = self.stack.iter().any(|frame| {
            matches!(frame, Memento::Compound(c) if c.subject_id() == Some(subject_id))
        });
        if already_open {
            return Err(ProtocolError::NestedBeginEdit { object: subject_id });
        }
        let label = subject
            .editable()
            .and_then(|e| e.current_edit_action())
            .unwrap_or_default();
        tracing::debug!(subject = ?subject, label = %label, "edit block opened");
        let mut compound = CompoundMemento::open(Rc::clone(subject), label);
        compound.children = editing.children;
        self.stack.push(Memento::Compound(compound));
        Ok(())
    }

    fn close_compound(
        &mut self,
        editing: PropertyMemento,
        subject: &ObjectRef,
        effects: &mut Effects,
    ) -> Result<(), ProtocolError> {
        let subject_id = subject.object_id();
        let mut compound = match self.stack.pop() {
            Some(Memento::Compound(c)) if c.subject_id() == Some(subject_id) => c,
            other => {
                if let Some(frame) = other {
                    self.stack.push(frame);
                }
                return Err(ProtocolError::EndEditWithoutBegin { object: subject_id });
            }
        };
        compound.done = true;
        compound.cancelled = subject.editable().is_some_and(|e| e.edit_was_cancelled());
        compound.children.extend(editing.children);
        tracing::debug!(
            subject = ?subject,
            label = %compound.label,
            children = compound.children.len(),
            cancelled = compound.cancelled,
            "edit block closed"
        );
        self.finish(Memento::Compound(compound), effects)
    }

    // ---- collection notifications ------------------------------------------

    fn collection_changing(
        &mut self,
        event: &CollectionEvent,
        path: CapturePath,
    ) -> Result<Effects, ProtocolError> {
        let mut effects = Effects::default();
        if !self.enabled || event.cancelled {
            return Ok(effects);
        }
        let key = CollectionKey::of(event);

        match path {
            CapturePath::Disconnected => {
                if !self.disconnected.contains(key.list) {
                    return Ok(effects);
                }
                let connected_in_flight = self
                    .in_flight_collections
                    .get(&key)
                    .is_some_and(|f| f.path == CapturePath::Connected);
                let restore_match = self
                    .restore
                    .as_ref()
                    .is_some_and(|r| r.collections.contains(&key.list));
                match self.route_disconnected(restore_match, connected_in_flight) {
                    Route::Capture => {}
                    Route::Ignore => {
                        self.disconnected.pending_collections.insert(key);
                        return Ok(effects);
                    }
                    Route::Reject => {
                        return Err(ProtocolError::DisconnectedMutation {
                            object: key.list,
                            member: key.member(),
                        });
                    }
                }
            }
            CapturePath::Connected => {
                if let Some(subscription) = self.disconnected.remove(key.list) {
                    subscription.detach();
                }
            }
        }

        if let Some(existing) = self.in_flight_collections.get_mut(&key) {
            if existing.path == CapturePath::Disconnected && path == CapturePath::Connected {
                tracing::warn!(key = ?key, "change seen on both paths, keeping the connected one");
                existing.path = CapturePath::Connected;
                self.disconnected.pending_collections.insert(key);
                return Ok(effects);
            }
            return Err(ProtocolError::AlreadyChanging {
                object: key.list,
                member: key.member(),
            });
        }

        self.check_cascade(key.list, &key.member())?;
        if self.stack.is_empty() {
            self.ensure_consistent()?;
        }
        let outgoing = match event.action {
            CollectionAction::Add => None,
            CollectionAction::Remove => Some(&event.item),
            CollectionAction::Replace => event.old_item.as_ref(),
        };
        if let Some(old) = outgoing.and_then(|v| v.as_object())
            && old.transactional().is_some()
        {
            effects.begin.push(Rc::clone(old));
        }
        let memento = CollectionMemento::capture(event, path == CapturePath::Disconnected);
        let frame = self.push_frame(Memento::Collection(memento));
        self.in_flight_collections.insert(key, InFlight { frame, path });
        Ok(effects)
    }

    fn collection_changed(
        &mut self,
        event: &CollectionEvent,
        path: CapturePath,
    ) -> Result<Effects, ProtocolError> {
        let mut effects = Effects::default();
        if !self.enabled || event.cancelled {
            return Ok(effects);
        }
        let key = CollectionKey::of(event);

        if path == CapturePath::Disconnected {
            if self.disconnected.pending_collections.remove(&key) {
                return Ok(effects);
            }
            match self.in_flight_collections.get(&key) {
                Some(f) if f.path == CapturePath::Connected => return Ok(effects),
                Some(_) => {}
                None if !self.disconnected.contains(key.list) => return Ok(effects),
                None => {
                    return Err(ProtocolError::DisconnectedMutation {
                        object: key.list,
                        member: key.member(),
                    });
                }
            }
        }

        let Some(in_flight) = self.in_flight_collections.remove(&key) else {
            return Err(ProtocolError::UnmatchedChanged {
                object: key.list,
                member: key.member(),
            });
        };
        if in_flight.frame + 1 != self.stack.len() {
            return Err(ProtocolError::OutOfOrderCompletion {
                object: key.list,
                member: key.member(),
            });
        }
        let mut memento = match self.stack.pop() {
            Some(Memento::Collection(memento)) => memento,
            _ => {
                return Err(ProtocolError::OutOfOrderCompletion {
                    object: key.list,
                    member: key.member(),
                });
            }
        };
        self.cascade_depth = self.cascade_depth.saturating_sub(1);
        memento.complete(event);

        if !self.classifier.is_aggregation_collection(&*event.sender) {
            let outgoing = match event.action {
                CollectionAction::Add => None,
                CollectionAction::Remove => Some(&event.item),
                CollectionAction::Replace => event.old_item.as_ref(),
            };
            if let Some(old) = outgoing.and_then(|v| v.as_object()) {
                let old = Rc::clone(old);
                self.disconnect(&old, memento.id);
            }
            if event.action != CollectionAction::Remove
                && let Some(new) = event.item.as_object()
            {
                self.connect(new);
            }
        }
        if event.action != CollectionAction::Remove
            && let Some(new) = event.item.as_object()
            && new.transactional().is_some()
        {
            effects.begin.push(Rc::clone(new));
        }
        self.finish(Memento::Collection(memento), &mut effects)?;
        Ok(effects)
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Turns change notifications from an object graph into nested undo units.
///
/// Every object reachable from the root through composition edges is
/// subscribed. Each "about to change" opens a frame; the matching "changed"
/// fills it and attaches it to whatever frame is still open beneath it, so a
/// setter's cascaded side effects end up as children of the change that
/// caused them. When the outermost frame closes, the finished unit is handed
/// to the memento sink.
///
/// Protocol violations are fatal: the tracker discards everything in
/// progress, drops its subscriptions, disables itself and returns the error
/// to the notifying source.
pub struct ChangeTracker {
    affinity: ThreadAffinity,
    state: RefCell<TrackerState>,
    sink: RefCell<Option<MementoSink>>,
}

impl ChangeTracker {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this: &Weak<ChangeTracker>| {
            let hooks = Hooks {
                connected: Rc::new(TrackerListener {
                    tracker: this.clone(),
                    path: CapturePath::Connected,
                }),
                disconnected: Rc::new(TrackerListener {
                    tracker: this.clone(),
                    path: CapturePath::Disconnected,
                }),
            };
            Self {
                affinity: ThreadAffinity::current(),
                state: RefCell::new(TrackerState::new(hooks)),
                sink: RefCell::new(None),
            }
        })
    }

    // ---- configuration ------------------------------------------------------

    pub fn set_memento_sink(&self, sink: MementoSink) {
        *self.sink.borrow_mut() = Some(sink);
    }

    pub fn clear_memento_sink(&self) {
        self.sink.borrow_mut().take();
    }

    /// Replaces the tracked root. Anything in progress is discarded and the
    /// whole subscription set is rebuilt.
    pub fn set_observable(&self, root: Option<ObjectRef>) -> Result<(), CoreError> {
        self.check_thread()?;
        let rollback = {
            let mut state = self.state.borrow_mut();
            let rollback = state.reset_in_flight();
            state.release_all();
            state.root = root;
            if state.enabled {
                state.subscribe_root();
            }
            rollback
        };
        Self::roll_back(rollback);
        Ok(())
    }

    pub fn observable(&self) -> Option<ObjectRef> {
        self.state.borrow().root.clone()
    }

    pub fn set_track_changes(&self, enabled: bool) -> Result<(), CoreError> {
        self.check_thread()?;
        let rollback = {
            let mut state = self.state.borrow_mut();
            if state.enabled == enabled {
                return Ok(());
            }
            state.enabled = enabled;
            if enabled {
                state.subscribe_root();
                Vec::new()
            } else {
                let rollback = state.reset_in_flight();
                state.release_all();
                rollback
            }
        };
        tracing::debug!(enabled, "change tracking toggled");
        Self::roll_back(rollback);
        Ok(())
    }

    pub fn is_tracking(&self) -> bool {
        self.state.borrow().enabled
    }

    /// Takes effect by resubscribing the current root.
    pub fn set_classifier(&self, classifier: Rc<dyn AggregationClassifier>) {
        let mut state = self.state.borrow_mut();
        state.classifier = classifier;
        state.release_all();
        if state.enabled {
            state.subscribe_root();
        }
    }

    pub fn set_excluded_types<I, S>(&self, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.borrow_mut();
        state.excluded_types = types.into_iter().map(Into::into).collect();
        state.release_all();
        if state.enabled {
            state.subscribe_root();
        }
    }

    pub fn excluded_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.state.borrow().excluded_types.iter().cloned().collect();
        types.sort();
        types
    }

    // ---- declared edits -----------------------------------------------------

    /// Announces that the caller is about to mutate the graph from inside a
    /// change notification. Changes made until the matching
    /// [`end_declared_edit`](Self::end_declared_edit) nest under the change
    /// currently in progress instead of being rejected.
    pub fn begin_declared_edit(&self) -> Result<(), CoreError> {
        self.check_thread()?;
        let mut state = self.state.borrow_mut();
        let depth = state.cascade_depth;
        state.declared_edits.push(depth);
        Ok(())
    }

    pub fn end_declared_edit(&self) -> Result<(), CoreError> {
        self.check_thread()?;
        let outcome = {
            let mut state = self.state.borrow_mut();
            match state.declared_edits.pop() {
                Some(_) => Ok(()),
                None if !state.enabled => Ok(()),
                None => Err(ProtocolError::UnbalancedDeclaredEdit),
            }
        };
        outcome.map_err(|err| self.fail(err))
    }

    /// Scoped [`begin_declared_edit`](Self::begin_declared_edit).
    ///
    /// While a unit is being restored the guard reports
    /// [`is_replay`](DeclaredEdit::is_replay): the unit already holds the
    /// effects, so side-effect code must skip its writes. Writing anyway is
    /// rejected with [`ProtocolError::SideEffectDuringRestore`].
    pub fn declared_edit(&self) -> Result<DeclaredEdit<'_>, CoreError> {
        self.begin_declared_edit()?;
        Ok(DeclaredEdit {
            tracker: self,
            replay: self.is_restoring(),
        })
    }

    /// Runs `edit` inside a declared edit, or skips it during a restore.
    pub fn run_declared<F>(&self, edit: F) -> Result<(), CoreError>
    where
        F: FnOnce() -> Result<(), CoreError>,
    {
        let guard = self.declared_edit()?;
        if guard.is_replay() {
            tracing::trace!("side effect skipped during restore");
            return guard.end();
        }
        edit()?;
        guard.end()
    }

    // ---- restore ------------------------------------------------------------

    pub fn on_before_undo(&self, memento: &Memento) -> Result<(), CoreError> {
        self.begin_restore(RestoreDirection::Undo, memento)
    }

    pub fn on_after_undo(&self, memento: &Memento) -> Result<(), CoreError> {
        self.end_restore(RestoreDirection::Undo, memento)
    }

    pub fn on_before_redo(&self, memento: &Memento) -> Result<(), CoreError> {
        self.begin_restore(RestoreDirection::Redo, memento)
    }

    pub fn on_after_redo(&self, memento: &Memento) -> Result<(), CoreError> {
        self.end_restore(RestoreDirection::Redo, memento)
    }

    fn begin_restore(&self, direction: RestoreDirection, memento: &Memento) -> Result<(), CoreError> {
        self.check_thread()?;
        let outcome = {
            let mut state = self.state.borrow_mut();
            if !state.enabled {
                return Err(ProtocolError::TrackingDisabled.into());
            }
            if state.restore.is_some() || !state.stack.is_empty() {
                Err(ProtocolError::RestoreDuringOperation)
            } else {
                state.ensure_consistent().map(|()| {
                    state.restore = Some(RestoreContext::new(direction, memento));
                })
            }
        };
        if outcome.is_ok() {
            tracing::debug!(direction = direction.as_str(), memento = %memento, "restore started");
        }
        outcome.map_err(|err| self.fail(err))
    }

    fn end_restore(&self, direction: RestoreDirection, memento: &Memento) -> Result<(), CoreError> {
        self.check_thread()?;
        let outcome = {
            let mut state = self.state.borrow_mut();
            match state.restore.take() {
                Some(ctx) if ctx.direction == direction => {
                    let sources = ctx.sources.clone();
                    match state.ensure_consistent() {
                        Ok(()) => {
                            let mut effects = Effects::default();
                            match ctx.into_memento() {
                                Some(replayed) => {
                                    state.disconnected.transfer(&sources, replayed.id());
                                    effects.deliver.push(replayed);
                                }
                                None => {
                                    for subscription in state.disconnected.release_owned_by(&sources) {
                                        subscription.detach();
                                    }
                                }
                            }
                            Ok(effects)
                        }
                        Err(err) => Err(err),
                    }
                }
                Some(ctx) => {
                    state.restore = Some(ctx);
                    Err(ProtocolError::NoRestoreInProgress)
                }
                None => Err(ProtocolError::NoRestoreInProgress),
            }
        };
        if outcome.is_ok() {
            tracing::debug!(direction = direction.as_str(), memento = %memento, "restore finished");
        }
        self.settle(outcome)
    }

    /// Tears down after a failed restore. Tracking stays disabled until
    /// re-enabled.
    pub fn abort(&self) {
        let rollback = {
            let mut state = self.state.borrow_mut();
            let rollback = state.reset_in_flight();
            state.release_all();
            state.enabled = false;
            rollback
        };
        tracing::warn!("change tracking aborted");
        Self::roll_back(rollback);
    }

    /// Releases disconnected objects kept alive for `memento`, which is
    /// leaving the undo stack for good.
    pub fn on_before_remove_undo(&self, memento: &Memento) {
        self.release_for(memento);
    }

    pub fn on_before_remove_redo(&self, memento: &Memento) {
        self.release_for(memento);
    }

    fn release_for(&self, memento: &Memento) {
        let released = self
            .state
            .borrow_mut()
            .disconnected
            .release_owned_by(&memento.ids());
        if !released.is_empty() {
            tracing::trace!(count = released.len(), memento = %memento, "released disconnected objects");
        }
        for subscription in released {
            subscription.detach();
        }
    }

    // ---- introspection ------------------------------------------------------

    pub fn ensure_consistent(&self) -> Result<(), CoreError> {
        Ok(self.state.borrow().ensure_consistent()?)
    }

    pub fn stack_depth(&self) -> usize {
        self.state.borrow().stack.len()
    }

    pub fn cascade_depth(&self) -> usize {
        self.state.borrow().cascade_depth
    }

    pub fn declared_edit_depth(&self) -> usize {
        self.state.borrow().declared_edits.len()
    }

    /// In-flight (property, collection) entries.
    pub fn in_flight_counts(&self) -> (usize, usize) {
        let state = self.state.borrow();
        (state.in_flight_properties.len(), state.in_flight_collections.len())
    }

    pub fn subscription_count(&self) -> usize {
        self.state.borrow().subscriptions.len()
    }

    pub fn is_subscribed(&self, id: ObjectId) -> bool {
        self.state.borrow().subscriptions.contains_key(&id)
    }

    pub fn disconnected_count(&self) -> usize {
        self.state.borrow().disconnected.len()
    }

    pub fn is_disconnected(&self, id: ObjectId) -> bool {
        self.state.borrow().disconnected.contains(id)
    }

    pub fn is_restoring(&self) -> bool {
        self.state.borrow().restore.is_some()
    }

    /// The unit being replayed between a before and after restore hook.
    pub fn restoring(&self) -> Option<(RestoreDirection, MementoId)> {
        self.state
            .borrow()
            .restore
            .as_ref()
            .map(|ctx| (ctx.direction, ctx.unit))
    }

    // ---- dispatch -----------------------------------------------------------

    fn property_changing(&self, event: &PropertyEvent, path: CapturePath) -> Result<(), CoreError> {
        self.check_thread()?;
        let outcome = self.state.borrow_mut().property_changing(event, path);
        self.settle(outcome)
    }

    fn property_changed(&self, event: &PropertyEvent, path: CapturePath) -> Result<(), CoreError> {
        self.check_thread()?;
        let outcome = self.state.borrow_mut().property_changed(event, path);
        self.settle(outcome)
    }

    fn collection_changing(
        &self,
        event: &CollectionEvent,
        path: CapturePath,
    ) -> Result<(), CoreError> {
        self.check_thread()?;
        let outcome = self.state.borrow_mut().collection_changing(event, path);
        self.settle(outcome)
    }

    fn collection_changed(&self, event: &CollectionEvent, path: CapturePath) -> Result<(), CoreError> {
        self.check_thread()?;
        let outcome = self.state.borrow_mut().collection_changed(event, path);
        self.settle(outcome)
    }

    fn check_thread(&self) -> Result<(), CoreError> {
        self.affinity.check().map_err(|err| self.fail(err))
    }

    /// Runs the effects of a successful transition, or fails the tracker.
    /// Called with the state borrow released: effects call back into user
    /// code that may notify again.
    fn settle(&self, outcome: Result<Effects, ProtocolError>) -> Result<(), CoreError> {
        let effects = outcome.map_err(|err| self.fail(err))?;
        for object in effects.begin {
            if let Some(resource) = object.transactional() {
                resource.begin();
            }
        }
        Self::roll_back(effects.rollback);
        for memento in effects.deliver {
            self.deliver(memento);
        }
        Ok(())
    }

    fn deliver(&self, memento: Memento) {
        for object in memento.transactional_values() {
            if let Some(resource) = object.transactional() {
                resource.commit();
            }
        }
        tracing::debug!(memento = %memento, nodes = memento.node_count(), "undo unit completed");
        let sink = self.sink.borrow_mut().take();
        match sink {
            Some(mut sink) => {
                sink(memento);
                let mut slot = self.sink.borrow_mut();
                if slot.is_none() {
                    *slot = Some(sink);
                }
            }
            None => tracing::warn!(memento = %memento, "no memento sink, dropping undo unit"),
        }
    }

    fn roll_back(objects: Vec<ObjectRef>) {
        for object in objects {
            if let Some(resource) = object.transactional() {
                resource.rollback();
            }
        }
    }

    fn fail(&self, err: ProtocolError) -> CoreError {
        if err.is_caller_misuse() {
            tracing::error!(error = %err, "edit protocol misused, change tracking disabled");
        } else {
            tracing::error!(error = %err, "change tracking failed, tracking disabled");
        }
        self.abort();
        CoreError::Protocol(err)
    }
}

/// Open declared edit; ends it on drop.
#[must_use = "the declared edit ends when this guard is dropped"]
pub struct DeclaredEdit<'a> {
    tracker: &'a ChangeTracker,
    replay: bool,
}

impl DeclaredEdit<'_> {
    /// Opened while a recorded unit is being restored.
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    pub fn end(self) -> Result<(), CoreError> {
        let tracker = self.tracker;
        std::mem::forget(self);
        tracker.end_declared_edit()
    }
}

impl Drop for DeclaredEdit<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.tracker.end_declared_edit() {
            tracing::warn!(error = %err, "declared edit ended with an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use retrace_core::{Editable, Entity, EntityList, PropertyNotifier, Value};

    fn tracked(root: &ObjectRef) -> (Rc<ChangeTracker>, Rc<RefCell<Vec<Memento>>>) {
        let tracker = ChangeTracker::new();
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&delivered);
        tracker.set_memento_sink(Box::new(move |m| sink.borrow_mut().push(m)));
        tracker.set_observable(Some(Rc::clone(root))).unwrap();
        (tracker, delivered)
    }

    #[test]
    fn single_write_delivers_one_unit() {
        let shape = Entity::with_fields("Shape", vec![("Value", Value::Integer(2))]);
        let root: ObjectRef = shape.clone();
        let (tracker, delivered) = tracked(&root);

        shape.set("Value", 5i64).unwrap();

        let delivered = delivered.borrow();
        assert_eq!(delivered.len(), 1);
        let memento = delivered[0].as_property().unwrap();
        assert_eq!(memento.old_value, Value::Integer(2));
        assert_eq!(memento.new_value, Some(Value::Integer(5)));
        assert!(memento.children.is_empty());
        assert!(tracker.ensure_consistent().is_ok());
    }

    #[test]
    fn graph_is_subscribed_through_composition() {
        let list = EntityList::new("Shapes");
        let shape = Entity::new("Shape");
        list.push(Value::Object(shape.clone())).unwrap();
        let doc = Entity::with_fields("Document", vec![("Shapes", Value::Object(list.clone()))]);
        let root: ObjectRef = doc.clone();
        let (tracker, _) = tracked(&root);

        assert_eq!(tracker.subscription_count(), 3);
        assert_eq!(shape.listener_count(), 1);

        tracker.set_track_changes(false).unwrap();
        assert_eq!(tracker.subscription_count(), 0);
        assert_eq!(shape.listener_count(), 0);
        assert_eq!(doc.listener_count(), 0);

        tracker.set_track_changes(true).unwrap();
        assert_eq!(tracker.subscription_count(), 3);
    }

    #[test]
    fn excluded_types_are_not_subscribed() {
        let cache = Entity::new("Cache");
        let doc = Entity::with_fields("Document", vec![("Cache", Value::Object(cache.clone()))]);
        let root: ObjectRef = doc;
        let (tracker, delivered) = tracked(&root);
        tracker.set_excluded_types(["Cache"]);

        assert_eq!(tracker.subscription_count(), 1);
        cache.set("Hits", 1i64).unwrap();
        assert!(delivered.borrow().is_empty());
    }

    #[test]
    fn edit_block_becomes_compound() {
        let shape = Entity::new("Shape");
        let root: ObjectRef = shape.clone();
        let (tracker, delivered) = tracked(&root);

        shape.begin_edit("Move").unwrap();
        assert_eq!(tracker.stack_depth(), 1);
        shape.set("X", 1i64).unwrap();
        shape.set("Y", 2i64).unwrap();
        shape.end_edit().unwrap();

        let delivered = delivered.borrow();
        assert_eq!(delivered.len(), 1);
        let compound = delivered[0].as_compound().unwrap();
        assert_eq!(compound.label, "Move");
        let props: Vec<&str> = compound
            .children
            .iter()
            .map(|c| c.as_property().unwrap().property.as_str())
            .collect();
        assert_eq!(props, vec!["X", "Y"]);
    }

    #[test]
    fn undeclared_side_effect_disables_tracking() {
        struct Mirror(Weak<Entity>);
        impl ChangeListener for Mirror {
            fn property_changed(&self, event: &PropertyEvent) -> Result<(), CoreError> {
                match (self.0.upgrade(), event.property.as_str()) {
                    (Some(shape), "X") => shape.set("Y", event.value.clone()),
                    _ => Ok(()),
                }
            }
        }

        let shape = Entity::new("Shape");
        let root: ObjectRef = shape.clone();
        let (tracker, delivered) = tracked(&root);
        shape.subscribe_properties(
            Rc::new(Mirror(Rc::downgrade(&shape))),
            retrace_core::Priority::Observer,
        );

        let err = shape.set("X", 1i64).unwrap_err();
        assert!(matches!(
            err.protocol(),
            Some(ProtocolError::UndeclaredSideEffect { depth: 1, expected: None, .. })
        ));
        assert!(!tracker.is_tracking());
        assert_eq!(tracker.stack_depth(), 0);
        assert!(delivered.borrow().is_empty());
    }

    #[test]
    fn unbalanced_declared_edit_is_reported() {
        let shape: ObjectRef = Entity::new("Shape");
        let (tracker, _) = tracked(&shape);
        let err = tracker.end_declared_edit().unwrap_err();
        assert_eq!(err.protocol(), Some(&ProtocolError::UnbalancedDeclaredEdit));
        assert!(!tracker.is_tracking());
    }

    #[test]
    fn declared_edit_guard_balances_depth() {
        let shape: ObjectRef = Entity::new("Shape");
        let (tracker, _) = tracked(&shape);
        {
            let _edit = tracker.declared_edit().unwrap();
            assert_eq!(tracker.declared_edit_depth(), 1);
        }
        assert_eq!(tracker.declared_edit_depth(), 0);
        tracker.declared_edit().unwrap().end().unwrap();
        assert!(tracker.is_tracking());
    }

    #[test]
    fn cancelled_change_is_ignored() {
        let shape = Entity::new("Shape");
        shape.freeze("X");
        let root: ObjectRef = shape.clone();
        let (tracker, delivered) = tracked(&root);

        shape.set("X", 3i64).unwrap();
        assert!(delivered.borrow().is_empty());
        assert!(tracker.ensure_consistent().is_ok());
        assert!(tracker.is_tracking());
    }

    #[test]
    fn restore_requires_idle_tracker() {
        let shape = Entity::new("Shape");
        let root: ObjectRef = shape.clone();
        let (tracker, delivered) = tracked(&root);
        shape.set("X", 1i64).unwrap();
        let memento = delivered.borrow_mut().remove(0);

        tracker.on_before_undo(&memento).unwrap();
        assert_eq!(
            tracker.restoring(),
            Some((RestoreDirection::Undo, memento.id()))
        );
        let err = tracker.on_before_undo(&memento).unwrap_err();
        assert_eq!(err.protocol(), Some(&ProtocolError::RestoreDuringOperation));
        assert!(!tracker.is_tracking());

        let err = tracker.on_before_redo(&memento).unwrap_err();
        assert_eq!(err.protocol(), Some(&ProtocolError::TrackingDisabled));
    }

    #[test]
    fn declared_edits_are_skipped_during_restore() {
        let shape = Entity::new("Shape");
        let root: ObjectRef = shape.clone();
        let (tracker, delivered) = tracked(&root);
        shape.set("X", 1i64).unwrap();
        let memento = delivered.borrow_mut().remove(0);
        assert!(!tracker.declared_edit().unwrap().is_replay());

        tracker.on_before_undo(&memento).unwrap();
        let ran = Cell::new(false);
        tracker
            .run_declared(|| {
                ran.set(true);
                Ok(())
            })
            .unwrap();
        assert!(!ran.get());
        assert_eq!(tracker.declared_edit_depth(), 0);
        tracker.on_after_undo(&memento).unwrap();
        assert!(tracker.is_tracking());
    }

    #[test]
    fn shared_object_is_disconnected_only_when_unreachable() {
        let shape = Entity::new("Shape");
        let doc = Entity::with_fields(
            "Document",
            vec![
                ("Primary", Value::Object(shape.clone())),
                ("Secondary", Value::Object(shape.clone())),
            ],
        );
        let root: ObjectRef = doc.clone();
        let (tracker, _) = tracked(&root);

        doc.set("Primary", Value::Null).unwrap();
        assert!(tracker.is_subscribed(shape.id()));
        assert!(!tracker.is_disconnected(shape.id()));

        doc.set("Secondary", Value::Null).unwrap();
        assert!(!tracker.is_subscribed(shape.id()));
        assert!(tracker.is_disconnected(shape.id()));
    }

    #[test]
    fn after_restore_without_before_is_rejected() {
        let shape = Entity::new("Shape");
        let root: ObjectRef = shape.clone();
        let (tracker, delivered) = tracked(&root);
        shape.set("X", 1i64).unwrap();
        let memento = delivered.borrow_mut().remove(0);

        let err = tracker.on_after_redo(&memento).unwrap_err();
        assert_eq!(err.protocol(), Some(&ProtocolError::NoRestoreInProgress));
    }
}
