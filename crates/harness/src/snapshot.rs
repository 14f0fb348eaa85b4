use std::collections::{BTreeMap, HashSet};

use retrace_core::{ObjectId, ObjectRef, Value};
use serde::Serialize;

use crate::error::HarnessError;

pub type Digest = [u8; 32];

#[derive(Debug, Clone, PartialEq, Serialize)]
enum FieldState {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Object(ObjectId),
}

impl From<&Value> for FieldState {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Boolean(b) => Self::Boolean(*b),
            Value::Integer(i) => Self::Integer(*i),
            Value::Float(f) => Self::Float(*f),
            Value::Text(s) => Self::Text(s.clone()),
            Value::Object(obj) => Self::Object(obj.object_id()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct NodeState {
    id: ObjectId,
    type_name: String,
    fields: BTreeMap<String, FieldState>,
    items: Vec<FieldState>,
}

/// Everything reachable from a root, in visit order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSnapshot {
    nodes: Vec<NodeState>,
}

impl GraphSnapshot {
    pub fn capture(root: &ObjectRef) -> Self {
        let mut nodes = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![root.clone()];
        while let Some(object) = pending.pop() {
            if !visited.insert(object.object_id()) {
                continue;
            }
            let mut node = NodeState {
                id: object.object_id(),
                type_name: object.type_name().to_string(),
                fields: BTreeMap::new(),
                items: Vec::new(),
            };
            let mut children = Vec::new();
            if let Some(properties) = object.properties() {
                for name in properties.property_names() {
                    let value = properties.property(&name).unwrap_or(Value::Null);
                    children.extend(value.as_object().cloned());
                    node.fields.insert(name, FieldState::from(&value));
                }
            }
            if let Some(collection) = object.collection() {
                for item in collection.items() {
                    children.extend(item.as_object().cloned());
                    node.items.push(FieldState::from(&item));
                }
            }
            nodes.push(node);
            pending.extend(children.into_iter().rev());
        }
        Self { nodes }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn digest(&self) -> Result<Digest, HarnessError> {
        let bytes = rmp_serde::to_vec(self)?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

pub fn state_digest(root: &ObjectRef) -> Result<Digest, HarnessError> {
    GraphSnapshot::capture(root).digest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::{Entity, EntityList};

    #[test]
    fn digest_follows_state() {
        let list = EntityList::new("Shapes");
        let doc = Entity::with_fields("Document", vec![("Shapes", Value::Object(list.clone()))]);
        let root: ObjectRef = doc.clone();

        let before = state_digest(&root).unwrap();
        doc.set("Title", "x").unwrap();
        let changed = state_digest(&root).unwrap();
        assert_ne!(before, changed);

        doc.set("Title", Value::Null).unwrap();
        assert_eq!(state_digest(&root).unwrap(), before);
        assert_eq!(GraphSnapshot::capture(&root).node_count(), 2);
    }

    #[test]
    fn shared_objects_are_visited_once() {
        let shape = Entity::new("Shape");
        let list = EntityList::new("Shapes");
        list.push(Value::Object(shape.clone())).unwrap();
        list.push(Value::Object(shape)).unwrap();
        let root: ObjectRef = list;
        assert_eq!(GraphSnapshot::capture(&root).node_count(), 2);
    }
}
