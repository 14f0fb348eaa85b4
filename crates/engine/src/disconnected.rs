//! Objects that left the tracked graph but may still be mutated by undo
//! units that reference them.

use std::collections::{HashMap, HashSet};

use retrace_core::{CollectionKey, MementoId, ObjectId, PropertyKey};

use crate::subscription::Subscription;

struct Entry {
    subscription: Subscription,
    /// The memento whose change disconnected the object.
    owner: MementoId,
}

#[derive(Default)]
pub(crate) struct DisconnectedSet {
    entries: HashMap<ObjectId, Entry>,
    /// Keys whose disconnected-path notifications are swallowed because the
    /// same change is already being recorded through the connected path.
    pub(crate) pending_properties: HashSet<PropertyKey>,
    pub(crate) pending_collections: HashSet<CollectionKey>,
}

impl DisconnectedSet {
    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, id: ObjectId, subscription: Subscription, owner: MementoId) {
        if let Some(previous) = self.entries.insert(id, Entry { subscription, owner }) {
            previous.subscription.detach();
        }
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<Subscription> {
        self.entries.remove(&id).map(|entry| entry.subscription)
    }

    /// Hands entries owned by any of `from` over to `to`.
    pub(crate) fn transfer(&mut self, from: &HashSet<MementoId>, to: MementoId) -> usize {
        let mut moved = 0;
        for entry in self.entries.values_mut() {
            if from.contains(&entry.owner) {
                entry.owner = to;
                moved += 1;
            }
        }
        moved
    }

    pub(crate) fn release_owned_by(&mut self, owners: &HashSet<MementoId>) -> Vec<Subscription> {
        let released: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|(_, entry)| owners.contains(&entry.owner))
            .map(|(id, _)| *id)
            .collect();
        released
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<Subscription> {
        self.pending_properties.clear();
        self.pending_collections.clear();
        self.entries.drain().map(|(_, entry)| entry.subscription).collect()
    }
}
