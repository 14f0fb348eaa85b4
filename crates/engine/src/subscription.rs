use std::rc::Rc;

use retrace_core::{
    AggregationClassifier, Capabilities, ChangeListener, ListenerId, ObjectRef, Priority, Value,
    WeakObjectRef,
};

/// Listener registrations held on one object.
///
/// Capabilities are read once here; the object is never queried again per event.
pub(crate) struct Subscription {
    object: WeakObjectRef,
    capabilities: Capabilities,
    properties: Option<ListenerId>,
    collection: Option<ListenerId>,
}

impl Subscription {
    /// `None` when the object raises no notifications at all.
    pub(crate) fn attach(object: &ObjectRef, listener: &Rc<dyn ChangeListener>) -> Option<Self> {
        let capabilities = object.capabilities();
        if capabilities.is_empty() {
            return None;
        }
        let properties = object
            .properties()
            .filter(|_| capabilities.properties)
            .map(|p| p.subscribe_properties(Rc::clone(listener), Priority::Tracking));
        let collection = object
            .collection()
            .filter(|_| capabilities.collection)
            .map(|c| c.subscribe_collection(Rc::clone(listener), Priority::Tracking));
        Some(Self {
            object: Rc::downgrade(object),
            capabilities,
            properties,
            collection,
        })
    }

    /// Unsubscribes through the interfaces recorded at attach time.
    pub(crate) fn detach(self) {
        let Some(object) = self.object.upgrade() else {
            return;
        };
        if self.capabilities.properties
            && let (Some(id), Some(notifier)) = (self.properties, object.properties())
        {
            notifier.unsubscribe_properties(id);
        }
        if self.capabilities.collection
            && let (Some(id), Some(notifier)) = (self.collection, object.collection())
        {
            notifier.unsubscribe_collection(id);
        }
    }
}

/// Objects reachable from `object` through one composition edge.
pub(crate) fn composed_children(
    object: &ObjectRef,
    classifier: &dyn AggregationClassifier,
) -> Vec<ObjectRef> {
    let mut children = Vec::new();
    if let Some(properties) = object.properties() {
        for name in properties.property_names() {
            if classifier.is_aggregation_property(&**object, &name) {
                continue;
            }
            if let Some(Value::Object(child)) = properties.property(&name) {
                children.push(child);
            }
        }
    }
    if let Some(collection) = object.collection()
        && !classifier.is_aggregation_collection(&**object)
    {
        children.extend(
            collection
                .items()
                .into_iter()
                .filter_map(|item| item.as_object().cloned()),
        );
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::{CompositionOnly, Entity, EntityList, Observable};

    struct Silent;
    impl ChangeListener for Silent {}

    #[test]
    fn attach_and_detach_balance_listener_counts() {
        let shape = Entity::new("Shape");
        let object: ObjectRef = shape.clone();
        let listener: Rc<dyn ChangeListener> = Rc::new(Silent);

        let subscription = Subscription::attach(&object, &listener).unwrap();
        assert!(subscription.capabilities.properties);
        assert!(!subscription.capabilities.collection);
        assert!(subscription.properties.is_some());
        assert!(subscription.collection.is_none());
        assert_eq!(shape.listener_count(), 1);

        subscription.detach();
        assert_eq!(shape.listener_count(), 0);
    }

    #[test]
    fn children_follow_object_properties_and_items() {
        let list = EntityList::new("Shapes");
        let a = Entity::new("Shape");
        list.push(Value::Object(a.clone())).unwrap();
        list.push(7i64).unwrap();
        let doc = Entity::with_fields(
            "Document",
            vec![("Shapes", Value::Object(list.clone())), ("Title", "t".into())],
        );

        let doc_ref: ObjectRef = doc;
        let children = composed_children(&doc_ref, &CompositionOnly);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].object_id(), list.object_id());

        let list_ref: ObjectRef = list;
        let items = composed_children(&list_ref, &CompositionOnly);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].object_id(), a.object_id());
    }
}
