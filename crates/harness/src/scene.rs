use std::rc::Rc;

use retrace_core::{CollectionNotifier, CoreError, Entity, EntityList, ObjectRef, Value};
use retrace_engine::{ChangeTracker, EngineError, UndoConfig, UndoRedoManager};

use crate::classifier::SchemaClassifier;
use crate::error::HarnessError;
use crate::snapshot::{Digest, state_digest};

/// A document owning a list of shapes, tracked by its own manager.
pub struct Scene {
    pub document: Rc<Entity>,
    pub shapes: Rc<EntityList>,
    pub manager: UndoRedoManager,
}

impl Scene {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(UndoConfig::default())
    }

    pub fn with_config(config: UndoConfig) -> Result<Self, EngineError> {
        let shapes = EntityList::new("Shapes");
        let document = Entity::with_fields(
            "Document",
            vec![
                ("Title", Value::from("Untitled")),
                ("Shapes", Value::Object(shapes.clone())),
            ],
        );
        let mut manager = UndoRedoManager::with_config(config)?;
        manager.set_classifier(Rc::new(SchemaClassifier::document()));
        manager.set_observable(Some(document.clone()))?;
        Ok(Self {
            document,
            shapes,
            manager,
        })
    }

    pub fn tracker(&self) -> &Rc<ChangeTracker> {
        self.manager.tracker()
    }

    pub fn root(&self) -> ObjectRef {
        self.document.clone()
    }

    /// Builds a shape and appends it to the document. The append is one
    /// undo unit.
    pub fn add_shape(&self, name: &str, x: i64, y: i64) -> Result<Rc<Entity>, CoreError> {
        let shape = Self::new_shape(name, x, y);
        self.shapes.push(Value::Object(shape.clone()))?;
        Ok(shape)
    }

    /// A shape not yet part of any document.
    pub fn new_shape(name: &str, x: i64, y: i64) -> Rc<Entity> {
        Entity::with_fields(
            "Shape",
            vec![
                ("Name", Value::from(name)),
                ("X", Value::Integer(x)),
                ("Y", Value::Integer(y)),
            ],
        )
    }

    pub fn shape_names(&self) -> Vec<String> {
        self.shapes
            .items()
            .iter()
            .filter_map(|item| item.as_object())
            .filter_map(|shape| shape.properties()?.property("Name"))
            .filter_map(|name| name.as_text().map(str::to_string))
            .collect()
    }

    pub fn digest(&self) -> Result<Digest, HarnessError> {
        state_digest(&self.root())
    }
}
