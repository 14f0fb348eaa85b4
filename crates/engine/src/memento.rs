use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use retrace_core::{
    CollectionAction, CollectionEvent, CollectionNotifier, CoreError, MementoId, ObjectId, ObjectRef,
    PropertyEvent, Value,
};

/// A reversible record of one observed mutation, owning the mementos of the
/// mutations that happened while it was open.
#[derive(Debug)]
pub enum Memento {
    Property(PropertyMemento),
    Collection(CollectionMemento),
    Compound(CompoundMemento),
}

#[derive(Debug)]
pub struct PropertyMemento {
    pub id: MementoId,
    pub instance: ObjectRef,
    pub property: String,
    pub old_value: Value,
    /// `None` until the "changed" half arrives.
    pub new_value: Option<Value>,
    pub origin_sender: ObjectId,
    pub origin_was_disconnected: bool,
    pub children: Vec<Memento>,
}

#[derive(Debug)]
pub struct CollectionMemento {
    pub id: MementoId,
    pub list: ObjectRef,
    pub action: CollectionAction,
    pub index: usize,
    pub item: Value,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub origin_was_disconnected: bool,
    pub children: Vec<Memento>,
    completed: bool,
}

/// A begin/end edit block, or the group of units produced by one restore
/// (no subject).
#[derive(Debug)]
pub struct CompoundMemento {
    pub id: MementoId,
    pub subject: Option<ObjectRef>,
    pub label: String,
    pub done: bool,
    pub cancelled: bool,
    pub children: Vec<Memento>,
}

impl PropertyMemento {
    pub(crate) fn capture(event: &PropertyEvent, disconnected: bool) -> Self {
        Self {
            id: MementoId::new(),
            instance: Rc::clone(&event.sender),
            property: event.property.clone(),
            old_value: event.value.clone(),
            new_value: None,
            origin_sender: event.sender.object_id(),
            origin_was_disconnected: disconnected,
            children: Vec::new(),
        }
    }

    /// Both halves captured and the value actually changed.
    pub fn is_filled(&self) -> bool {
        self.new_value
            .as_ref()
            .is_some_and(|new| *new != self.old_value)
    }

    fn restore(&self) -> Result<(), CoreError> {
        let notifier = self
            .instance
            .properties()
            .ok_or(CoreError::MissingCapability {
                object: self.instance.object_id(),
                capability: "property notifications",
            })?;
        notifier.set_property(&self.property, self.old_value.clone())
    }
}

impl CollectionMemento {
    pub(crate) fn capture(event: &CollectionEvent, disconnected: bool) -> Self {
        let old_value = match event.action {
            CollectionAction::Add => None,
            CollectionAction::Remove => Some(event.item.clone()),
            CollectionAction::Replace => event.old_item.clone(),
        };
        Self {
            id: MementoId::new(),
            list: Rc::clone(&event.sender),
            action: event.action,
            index: event.index,
            item: event.item.clone(),
            old_value,
            new_value: None,
            origin_was_disconnected: disconnected,
            children: Vec::new(),
            completed: false,
        }
    }

    pub(crate) fn complete(&mut self, event: &CollectionEvent) {
        self.new_value = match self.action {
            CollectionAction::Add | CollectionAction::Replace => Some(event.item.clone()),
            CollectionAction::Remove => None,
        };
        self.completed = true;
    }

    pub fn is_filled(&self) -> bool {
        self.completed
    }

    fn restore(&self) -> Result<(), CoreError> {
        let notifier = self
            .list
            .collection()
            .ok_or(CoreError::MissingCapability {
                object: self.list.object_id(),
                capability: "collection notifications",
            })?;
        match self.action {
            CollectionAction::Add => {
                let index = locate(notifier, self.index, &self.item)?;
                notifier.remove_at(index)?;
            }
            CollectionAction::Remove => {
                let index = self.index.min(notifier.len());
                notifier.insert(index, self.item.clone())?;
            }
            CollectionAction::Replace => {
                let index = locate(notifier, self.index, &self.item)?;
                let old = self.old_value.clone().unwrap_or(Value::Null);
                notifier.replace(index, old)?;
            }
        }
        Ok(())
    }
}

/// Position of `item`, preferring the recorded index.
fn locate(notifier: &dyn CollectionNotifier, hint: usize, item: &Value) -> Result<usize, CoreError> {
    if notifier.item(hint).as_ref() == Some(item) {
        return Ok(hint);
    }
    notifier
        .items()
        .iter()
        .position(|candidate| candidate == item)
        .ok_or_else(|| CoreError::InvalidValue {
            member: "item".into(),
            reason: format!("{item:?} is no longer in the collection"),
        })
}

impl CompoundMemento {
    pub(crate) fn open(subject: ObjectRef, label: String) -> Self {
        Self {
            id: MementoId::new(),
            subject: Some(subject),
            label,
            done: false,
            cancelled: false,
            children: Vec::new(),
        }
    }

    pub(crate) fn group(label: String, children: Vec<Memento>) -> Self {
        Self {
            id: MementoId::new(),
            subject: None,
            label,
            done: true,
            cancelled: false,
            children,
        }
    }

    pub fn subject_id(&self) -> Option<ObjectId> {
        self.subject.as_ref().map(|s| s.object_id())
    }

    /// Closed, not cancelled, and holding something to restore.
    pub fn is_filled(&self) -> bool {
        self.done && !self.cancelled && !self.children.is_empty()
    }

    fn restore(&self) -> Result<(), CoreError> {
        let Some(subject) = &self.subject else {
            return restore_children(&self.children);
        };
        let editable = subject.editable().ok_or(CoreError::MissingCapability {
            object: subject.object_id(),
            capability: "edit blocks",
        })?;
        editable.begin_edit(&self.label)?;
        match restore_children(&self.children) {
            Ok(()) => editable.end_edit(),
            Err(err) => {
                let _ = editable.cancel_edit();
                Err(err)
            }
        }
    }
}

fn restore_children(children: &[Memento]) -> Result<(), CoreError> {
    for child in children.iter().rev() {
        child.restore()?;
    }
    Ok(())
}

impl Memento {
    pub fn id(&self) -> MementoId {
        match self {
            Self::Property(m) => m.id,
            Self::Collection(m) => m.id,
            Self::Compound(m) => m.id,
        }
    }

    pub fn children(&self) -> &[Memento] {
        match self {
            Self::Property(m) => &m.children,
            Self::Collection(m) => &m.children,
            Self::Compound(m) => &m.children,
        }
    }

    pub(crate) fn push_child(&mut self, child: Memento) {
        match self {
            Self::Property(m) => m.children.push(child),
            Self::Collection(m) => m.children.push(child),
            Self::Compound(m) => m.children.push(child),
        }
    }

    pub(crate) fn into_children(self) -> Vec<Memento> {
        match self {
            Self::Property(m) => m.children,
            Self::Collection(m) => m.children,
            Self::Compound(m) => m.children,
        }
    }

    pub fn is_filled(&self) -> bool {
        match self {
            Self::Property(m) => m.is_filled(),
            Self::Collection(m) => m.is_filled(),
            Self::Compound(m) => m.is_filled(),
        }
    }

    /// Applies the inverse of the recorded change.
    ///
    /// Leaves write back their own change first and then restore their
    /// children last-to-first, so that a replayed setter's side effects are
    /// overwritten by the recorded ones. Compounds reopen the subject's edit
    /// block around their children.
    pub fn restore(&self) -> Result<(), CoreError> {
        match self {
            Self::Property(m) => {
                m.restore()?;
                restore_children(&m.children)
            }
            Self::Collection(m) => {
                m.restore()?;
                restore_children(&m.children)
            }
            Self::Compound(m) => m.restore(),
        }
    }

    /// Depth-first, parents before children.
    pub fn walk(&self, visit: &mut dyn FnMut(&Memento)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    pub fn ids(&self) -> HashSet<MementoId> {
        let mut ids = HashSet::new();
        self.walk(&mut |m| {
            ids.insert(m.id());
        });
        ids
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }

    pub fn as_property(&self) -> Option<&PropertyMemento> {
        match self {
            Self::Property(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionMemento> {
        match self {
            Self::Collection(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_compound(&self) -> Option<&CompoundMemento> {
        match self {
            Self::Compound(m) => Some(m),
            _ => None,
        }
    }

    /// Objects held as old or new values by this memento alone.
    pub(crate) fn captured_objects(&self) -> Vec<ObjectRef> {
        let values: Vec<&Value> = match self {
            Self::Property(m) => std::iter::once(&m.old_value)
                .chain(m.new_value.as_ref())
                .collect(),
            Self::Collection(m) => m.old_value.iter().chain(m.new_value.as_ref()).collect(),
            Self::Compound(_) => Vec::new(),
        };
        values
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }

    /// Every captured value in the tree exposing begin/commit/rollback.
    pub(crate) fn transactional_values(&self) -> Vec<ObjectRef> {
        let mut found = Vec::new();
        self.walk(&mut |m| {
            found.extend(
                m.captured_objects()
                    .into_iter()
                    .filter(|obj| obj.transactional().is_some()),
            );
        });
        found
    }
}

impl fmt::Display for Memento {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Property(m) => write!(f, "set {}.{}", m.instance.type_name(), m.property),
            Self::Collection(m) => write!(
                f,
                "{} {}[{}]",
                m.action.as_str(),
                m.list.type_name(),
                m.index
            ),
            Self::Compound(m) if m.label.is_empty() => write!(f, "edit"),
            Self::Compound(m) => write!(f, "{}", m.label),
        }
    }
}
