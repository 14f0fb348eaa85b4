use std::cell::RefCell;
use std::rc::Rc;

use retrace_core::{
    CollectionAction, CollectionNotifier, Editable, Entity, ProtocolError, Value,
};
use retrace_engine::{ChangeTracker, Memento, UndoConfig};
use retrace_harness::{Scene, derive_property, init_tracing};

// ============================================================================
// Single changes
// ============================================================================

#[test]
fn value_change_is_recorded_with_both_values() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let scene = Scene::new()?;
    let shape = scene.add_shape("a", 2, 0)?;

    shape.set("X", 5i64)?;
    assert_eq!(scene.manager.undo_depth(), 2);

    let top = scene.manager.peek_undo().ok_or("nothing recorded")?;
    let memento = top.as_property().ok_or("expected a property unit")?;
    assert_eq!(memento.property, "X");
    assert_eq!(memento.old_value, Value::Integer(2));
    assert_eq!(memento.new_value, Some(Value::Integer(5)));
    assert_eq!(memento.origin_sender, shape.id());
    assert!(!memento.origin_was_disconnected);
    assert!(memento.children.is_empty());
    Ok(())
}

#[test]
fn writing_the_same_value_records_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let shape = scene.add_shape("a", 2, 0)?;
    shape.set("X", 2i64)?;
    assert_eq!(scene.manager.undo_depth(), 1);
    Ok(())
}

#[test]
fn cancelled_change_records_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let shape = scene.add_shape("a", 2, 0)?;
    shape.freeze("X");

    shape.set("X", 9i64)?;
    assert_eq!(shape.get("X"), Value::Integer(2));
    assert_eq!(scene.manager.undo_depth(), 1);
    assert!(scene.tracker().is_tracking());
    scene.tracker().ensure_consistent()?;
    Ok(())
}

#[test]
fn collection_changes_record_index_and_items() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let a = scene.add_shape("a", 0, 0)?;
    let b = Scene::new_shape("b", 0, 0);

    scene.shapes.insert(0, Value::Object(b.clone()))?;
    {
        let top = scene.manager.peek_undo().ok_or("nothing recorded")?;
        let added = top.as_collection().ok_or("expected a collection unit")?;
        assert_eq!(added.action, CollectionAction::Add);
        assert_eq!(added.index, 0);
        assert_eq!(added.new_value, Some(Value::Object(b.clone())));
        assert_eq!(added.old_value, None);
    }
    assert!(scene.tracker().is_subscribed(b.id()));

    let c = Scene::new_shape("c", 0, 0);
    scene.shapes.replace(1, Value::Object(c.clone()))?;
    {
        let top = scene.manager.peek_undo().ok_or("nothing recorded")?;
        let replaced = top.as_collection().ok_or("expected a collection unit")?;
        assert_eq!(replaced.action, CollectionAction::Replace);
        assert_eq!(replaced.index, 1);
        assert_eq!(replaced.old_value, Some(Value::Object(a.clone())));
        assert_eq!(replaced.new_value, Some(Value::Object(c.clone())));
    }
    assert!(scene.tracker().is_disconnected(a.id()));
    assert!(scene.tracker().is_subscribed(c.id()));
    assert_eq!(scene.manager.undo_depth(), 3);
    assert_eq!(scene.shape_names(), vec!["b", "c"]);
    Ok(())
}

// ============================================================================
// Subscriptions
// ============================================================================

#[test]
fn aggregation_edges_are_not_followed() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let owned = scene.add_shape("owned", 0, 0)?;
    let loose = Scene::new_shape("loose", 0, 0);

    scene.document.set("Selection", Value::Object(loose.clone()))?;
    assert!(!scene.tracker().is_subscribed(loose.id()));
    loose.set("X", 4i64)?;
    assert_eq!(scene.manager.undo_depth(), 2);

    scene.document.set("Selection", Value::Object(owned.clone()))?;
    scene.document.set("Selection", Value::Null)?;
    assert!(scene.tracker().is_subscribed(owned.id()));
    assert!(!scene.tracker().is_disconnected(owned.id()));
    assert_eq!(scene.manager.undo_depth(), 4);
    Ok(())
}

#[test]
fn excluded_types_are_neither_subscribed_nor_recorded() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::with_config(UndoConfig::new().exclude_type("Cache"))?;
    let cache = Entity::new("Cache");

    scene.document.set("Cache", Value::Object(cache.clone()))?;
    assert_eq!(scene.manager.undo_depth(), 1);
    assert!(!scene.tracker().is_subscribed(cache.id()));

    cache.set("Hits", 3i64)?;
    assert_eq!(scene.manager.undo_depth(), 1);
    assert_eq!(cache.listener_count(), 0);
    Ok(())
}

#[test]
fn disabling_tracking_drops_every_subscription() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let shape = scene.add_shape("a", 0, 0)?;
    assert_eq!(scene.tracker().subscription_count(), 3);

    scene.tracker().set_track_changes(false)?;
    assert_eq!(scene.tracker().subscription_count(), 0);
    assert_eq!(shape.listener_count(), 0);
    assert_eq!(scene.shapes.listener_count(), 0);
    shape.set("X", 1i64)?;
    assert_eq!(scene.manager.undo_depth(), 1);

    scene.tracker().set_track_changes(true)?;
    shape.set("X", 2i64)?;
    assert_eq!(scene.manager.undo_depth(), 2);
    Ok(())
}

// ============================================================================
// Cascades
// ============================================================================

#[test]
fn every_delivery_happens_with_an_idle_tracker() -> Result<(), Box<dyn std::error::Error>> {
    let document = Entity::new("Document");
    let tracker = ChangeTracker::new();
    let checks = Rc::new(RefCell::new(Vec::new()));

    let sink_checks = Rc::clone(&checks);
    let tracker_ref = Rc::downgrade(&tracker);
    tracker.set_memento_sink(Box::new(move |memento: Memento| {
        let idle = tracker_ref.upgrade().is_some_and(|t| {
            t.ensure_consistent().is_ok() && t.stack_depth() == 0 && t.cascade_depth() == 0
        });
        sink_checks.borrow_mut().push((memento.node_count(), idle));
    }));
    tracker.set_observable(Some(document.clone()))?;
    derive_property(&document, &tracker, "Width", "Area", 10, true);

    document.set("Width", 3i64)?;
    document.begin_edit("Resize")?;
    document.set("Width", 4i64)?;
    document.set("Title", "resized")?;
    document.end_edit()?;

    assert_eq!(*checks.borrow(), vec![(2, true), (4, true)]);
    assert_eq!(document.get("Area"), Value::Integer(40));
    Ok(())
}

#[test]
fn declared_side_effect_nests_under_its_cause() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let shape = scene.add_shape("a", 1, 1)?;
    derive_property(&shape, scene.tracker(), "X", "Area", 10, true);

    shape.set("X", 2i64)?;
    assert_eq!(shape.get("Area"), Value::Integer(20));
    assert_eq!(scene.manager.undo_depth(), 2);

    let top = scene.manager.peek_undo().ok_or("nothing recorded")?;
    let cause = top.as_property().ok_or("expected a property unit")?;
    assert_eq!(cause.property, "X");
    assert_eq!(cause.children.len(), 1);
    let effect = cause.children[0]
        .as_property()
        .ok_or("expected a nested property unit")?;
    assert_eq!(effect.property, "Area");
    assert_eq!(effect.old_value, Value::Null);
    assert_eq!(effect.new_value, Some(Value::Integer(20)));
    Ok(())
}

#[test]
fn undeclared_side_effect_aborts_tracking() -> Result<(), Box<dyn std::error::Error>> {
    let mut scene = Scene::new()?;
    let shape = scene.add_shape("a", 1, 1)?;
    derive_property(&shape, scene.tracker(), "X", "Area", 10, false);

    let err = match shape.set("X", 2i64) {
        Err(err) => err,
        Ok(()) => return Err("side effect was accepted".into()),
    };
    assert!(matches!(
        err.protocol(),
        Some(ProtocolError::UndeclaredSideEffect { depth: 1, expected: None, .. })
    ));
    assert_eq!(shape.get("Area"), Value::Null);
    assert!(!scene.tracker().is_tracking());
    assert_eq!(scene.tracker().stack_depth(), 0);
    assert_eq!(scene.tracker().subscription_count(), 0);
    assert_eq!(scene.manager.undo_depth(), 1);

    let err = match scene.manager.undo() {
        Err(err) => err,
        Ok(_) => return Err("undo ran with tracking disabled".into()),
    };
    assert_eq!(err.protocol(), Some(&ProtocolError::TrackingDisabled));
    assert_eq!(scene.manager.undo_depth(), 1);
    Ok(())
}

#[test]
fn declared_edit_guard_survives_tracking_reset() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let tracker = Rc::clone(scene.tracker());
    {
        let _edit = tracker.declared_edit()?;
        assert_eq!(tracker.declared_edit_depth(), 1);
        tracker.set_track_changes(false)?;
    }
    assert_eq!(tracker.declared_edit_depth(), 0);
    tracker.set_track_changes(true)?;
    assert!(tracker.is_tracking());
    Ok(())
}
