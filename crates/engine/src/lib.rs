//! Automatic undo/redo for observable object graphs.
//!
//! A [`ChangeTracker`] listens to every object reachable from a root and
//! records each mutation as a [`Memento`]; an [`UndoRedoManager`] keeps the
//! recorded units on undo and redo stacks and replays them on request.

pub mod config;
mod disconnected;
pub mod error;
pub mod manager;
pub mod memento;
mod subscription;
pub mod thread;
pub mod tracker;
mod undo;

pub use config::{DEFAULT_UNDO_DEPTH, UndoConfig};
pub use error::EngineError;
pub use manager::{UndoRedoManager, UndoResult};
pub use memento::{CollectionMemento, CompoundMemento, Memento, PropertyMemento};
pub use thread::ThreadAffinity;
pub use tracker::{CapturePath, ChangeTracker, DeclaredEdit, MementoSink, RestoreDirection};
