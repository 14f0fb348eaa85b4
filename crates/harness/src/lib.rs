//! Fixtures for exercising change tracking against a small document model.

mod classifier;
mod editable;
mod error;
mod observer;
mod resource;
mod scene;
mod snapshot;

pub use classifier::SchemaClassifier;
pub use editable::UncheckedEditable;
pub use error::HarnessError;
pub use observer::{OnCollectionChanged, OnPropertyChanged, derive_property, log_additions};
pub use resource::TestResource;
pub use scene::Scene;
pub use snapshot::{Digest, GraphSnapshot, state_digest};

/// Routes `tracing` output through the test writer. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
