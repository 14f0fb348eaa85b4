use std::cell::Cell;
use std::rc::Rc;

use retrace_core::{ObjectId, Observable, Transactional};

/// A transactional value that only counts what it was asked to do.
#[derive(Debug, Default)]
pub struct TestResource {
    id: ObjectId,
    begins: Cell<usize>,
    commits: Cell<usize>,
    rollbacks: Cell<usize>,
}

impl TestResource {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn begins(&self) -> usize {
        self.begins.get()
    }

    pub fn commits(&self) -> usize {
        self.commits.get()
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.get()
    }
}

impl Observable for TestResource {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn type_name(&self) -> &str {
        "Resource"
    }

    fn transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for TestResource {
    fn begin(&self) {
        self.begins.set(self.begins.get() + 1);
    }

    fn commit(&self) {
        self.commits.set(self.commits.get() + 1);
    }

    fn rollback(&self) {
        self.rollbacks.set(self.rollbacks.get() + 1);
    }
}
