use std::thread::{self, ThreadId};

use retrace_core::ProtocolError;

/// The thread a tracker was created on. Every entry point checks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAffinity {
    owner: ThreadId,
}

impl ThreadAffinity {
    pub fn current() -> Self {
        Self {
            owner: thread::current().id(),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn check(&self) -> Result<(), ProtocolError> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(ProtocolError::CrossThread)
        }
    }
}
