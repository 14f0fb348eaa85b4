use crate::observable::Observable;

/// Decides whether a reference is ownership (composition) or a plain
/// reference (aggregation).
///
/// Composed values are subscribed when they enter the graph and watched as
/// disconnected when they leave it. Aggregated values are never followed.
pub trait AggregationClassifier {
    fn is_aggregation_property(&self, owner: &dyn Observable, property: &str) -> bool;

    fn is_aggregation_collection(&self, list: &dyn Observable) -> bool;
}

/// Treats every reference as ownership.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompositionOnly;

impl AggregationClassifier for CompositionOnly {
    fn is_aggregation_property(&self, _owner: &dyn Observable, _property: &str) -> bool {
        false
    }

    fn is_aggregation_collection(&self, _list: &dyn Observable) -> bool {
        false
    }
}
