use retrace_core::{Editable, ProtocolError, Value};
use retrace_engine::{Memento, UndoResult};
use retrace_harness::{Scene, UncheckedEditable};

fn property_names(memento: &Memento) -> Vec<String> {
    memento
        .children()
        .iter()
        .filter_map(|child| child.as_property())
        .map(|p| p.property.clone())
        .collect()
}

#[test]
fn edit_block_records_one_compound_in_call_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut scene = Scene::new()?;
    let shape = scene.add_shape("a", 0, 0)?;

    shape.begin_edit("Move")?;
    shape.set("X", 10i64)?;
    shape.set("Y", 20i64)?;
    shape.end_edit()?;

    assert_eq!(scene.manager.undo_depth(), 2);
    {
        let top = scene.manager.peek_undo().ok_or("nothing recorded")?;
        let compound = top.as_compound().ok_or("expected a compound unit")?;
        assert_eq!(compound.label, "Move");
        assert_eq!(compound.subject_id(), Some(shape.id()));
        assert!(compound.done);
        assert!(!compound.cancelled);
        assert_eq!(property_names(&top), vec!["X", "Y"]);
    }
    assert_eq!(scene.manager.undo_labels()[0], "Move");

    assert!(matches!(scene.manager.undo()?, UndoResult::Applied(_)));
    assert_eq!(shape.get("X"), Value::Integer(0));
    assert_eq!(shape.get("Y"), Value::Integer(0));
    assert!(!shape.is_editing());
    {
        let top = scene.manager.peek_redo().ok_or("nothing to redo")?;
        let compound = top.as_compound().ok_or("expected a compound unit")?;
        assert_eq!(compound.label, "Move");
        assert_eq!(property_names(&top), vec!["Y", "X"]);
    }

    scene.manager.redo()?;
    assert_eq!(shape.get("X"), Value::Integer(10));
    assert_eq!(shape.get("Y"), Value::Integer(20));
    assert_eq!(scene.manager.undo_depth(), 2);
    Ok(())
}

#[test]
fn cancelled_edit_delivers_children_individually() -> Result<(), Box<dyn std::error::Error>> {
    let mut scene = Scene::new()?;
    let shape = scene.add_shape("a", 0, 0)?;

    shape.begin_edit("Move")?;
    shape.set("X", 10i64)?;
    shape.set("Y", 20i64)?;
    shape.cancel_edit()?;

    assert_eq!(scene.manager.undo_depth(), 3);
    assert_eq!(
        scene.manager.undo_labels(),
        vec!["set Shape.Y", "set Shape.X", "add Shapes[0]"]
    );

    scene.manager.undo()?;
    assert_eq!(shape.get("Y"), Value::Integer(0));
    assert_eq!(shape.get("X"), Value::Integer(10));
    Ok(())
}

#[test]
fn empty_edit_block_records_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let shape = scene.add_shape("a", 0, 0)?;

    shape.begin_edit("Nothing")?;
    shape.set("X", 0i64)?;
    shape.end_edit()?;

    assert_eq!(scene.manager.undo_depth(), 1);
    scene.tracker().ensure_consistent()?;
    Ok(())
}

#[test]
fn nested_edit_blocks_on_different_subjects() -> Result<(), Box<dyn std::error::Error>> {
    let mut scene = Scene::new()?;
    let shape = scene.add_shape("a", 0, 0)?;
    let before = scene.digest()?;

    scene.document.begin_edit("Layout")?;
    shape.begin_edit("Move")?;
    shape.set("X", 5i64)?;
    shape.end_edit()?;
    scene.document.set("Title", "laid out")?;
    scene.document.end_edit()?;
    let after = scene.digest()?;

    assert_eq!(scene.manager.undo_depth(), 2);
    {
        let top = scene.manager.peek_undo().ok_or("nothing recorded")?;
        let outer = top.as_compound().ok_or("expected a compound unit")?;
        assert_eq!(outer.label, "Layout");
        assert_eq!(outer.children.len(), 2);
        let inner = outer.children[0]
            .as_compound()
            .ok_or("expected a nested compound")?;
        assert_eq!(inner.label, "Move");
        assert_eq!(top.node_count(), 4);
    }

    scene.manager.undo()?;
    assert_eq!(scene.digest()?, before);
    scene.manager.redo()?;
    assert_eq!(scene.digest()?, after);
    Ok(())
}

#[test]
fn ending_an_edit_the_tracker_never_saw_begin() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let shape = scene.add_shape("a", 0, 0)?;

    scene.tracker().set_track_changes(false)?;
    shape.begin_edit("Untracked")?;
    scene.tracker().set_track_changes(true)?;

    let err = match shape.end_edit() {
        Err(err) => err,
        Ok(()) => return Err("unbalanced end_edit was accepted".into()),
    };
    let protocol = err.protocol().ok_or("expected a protocol error")?;
    assert_eq!(
        protocol,
        &ProtocolError::EndEditWithoutBegin { object: shape.id() }
    );
    assert!(protocol.is_caller_misuse());
    assert!(!scene.tracker().is_tracking());
    Ok(())
}

#[test]
fn beginning_an_open_edit_again_is_caller_misuse() -> Result<(), Box<dyn std::error::Error>> {
    let scene = Scene::new()?;
    let editor = UncheckedEditable::new();
    scene.document.set("Editor", Value::Object(editor.clone()))?;
    assert!(scene.tracker().is_subscribed(editor.id()));

    editor.begin_edit("First")?;
    assert_eq!(scene.tracker().stack_depth(), 1);

    let err = match editor.begin_edit("Second") {
        Err(err) => err,
        Ok(()) => return Err("nested begin_edit was accepted".into()),
    };
    let protocol = err.protocol().ok_or("expected a protocol error")?;
    assert_eq!(
        protocol,
        &ProtocolError::NestedBeginEdit { object: editor.id() }
    );
    assert!(protocol.is_caller_misuse());
    assert!(!scene.tracker().is_tracking());
    assert_eq!(scene.tracker().stack_depth(), 0);
    assert_eq!(scene.manager.undo_depth(), 1);
    Ok(())
}
