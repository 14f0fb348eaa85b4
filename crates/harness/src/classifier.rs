use std::collections::HashSet;

use retrace_core::{AggregationClassifier, Observable};

/// Aggregation edges declared by (owner type, property) and by list type.
/// Everything else is composition.
#[derive(Debug, Clone, Default)]
pub struct SchemaClassifier {
    properties: HashSet<(String, String)>,
    collections: HashSet<String>,
}

impl SchemaClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The document model used by [`Scene`](crate::Scene): `Document.Selection`
    /// and `Shape.Anchor` point at shapes owned elsewhere, and `Selection`
    /// lists only reference their items.
    pub fn document() -> Self {
        Self::new()
            .aggregation_property("Document", "Selection")
            .aggregation_property("Shape", "Anchor")
            .aggregation_collection("Selection")
    }

    pub fn aggregation_property(mut self, owner_type: &str, property: &str) -> Self {
        self.properties
            .insert((owner_type.to_string(), property.to_string()));
        self
    }

    pub fn aggregation_collection(mut self, list_type: &str) -> Self {
        self.collections.insert(list_type.to_string());
        self
    }
}

impl AggregationClassifier for SchemaClassifier {
    fn is_aggregation_property(&self, owner: &dyn Observable, property: &str) -> bool {
        self.properties
            .contains(&(owner.type_name().to_string(), property.to_string()))
    }

    fn is_aggregation_collection(&self, list: &dyn Observable) -> bool {
        self.collections.contains(list.type_name())
    }
}
