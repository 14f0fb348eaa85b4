use std::collections::VecDeque;

use crate::memento::Memento;

/// Where the next delivered unit goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// A fresh change: onto the undo stack, invalidating redo.
    Forward,
    /// Produced while undoing: onto the redo stack.
    UndoReplay,
    /// Produced while redoing: onto the undo stack, redo kept.
    RedoReplay,
}

/// A unit leaving a stack for good.
pub(crate) enum Evicted {
    Undo(Memento),
    Redo(Memento),
}

pub(crate) struct UndoStacks {
    undo_stack: VecDeque<Memento>,
    redo_stack: VecDeque<Memento>,
    max_depth: usize,
    delivery: Delivery,
}

impl UndoStacks {
    pub(crate) fn new(max_depth: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_depth,
            delivery: Delivery::Forward,
        }
    }

    pub(crate) fn set_delivery(&mut self, delivery: Delivery) {
        self.delivery = delivery;
    }

    pub(crate) fn accept(&mut self, memento: Memento) -> Vec<Evicted> {
        match self.delivery {
            Delivery::Forward => {
                let mut evicted = self.clear_redo();
                evicted.extend(self.push_undo(memento));
                evicted
            }
            Delivery::UndoReplay => self.push_redo(memento).into_iter().collect(),
            Delivery::RedoReplay => self.push_undo(memento).into_iter().collect(),
        }
    }

    fn push_undo(&mut self, memento: Memento) -> Option<Evicted> {
        self.undo_stack.push_back(memento);
        // Enforce depth limit by dropping oldest entry
        if self.undo_stack.len() > self.max_depth {
            return self.undo_stack.pop_front().map(Evicted::Undo);
        }
        None
    }

    fn push_redo(&mut self, memento: Memento) -> Option<Evicted> {
        self.redo_stack.push_back(memento);
        if self.redo_stack.len() > self.max_depth {
            return self.redo_stack.pop_front().map(Evicted::Redo);
        }
        None
    }

    pub(crate) fn pop_undo(&mut self) -> Option<Memento> {
        self.undo_stack.pop_back()
    }

    pub(crate) fn pop_redo(&mut self) -> Option<Memento> {
        self.redo_stack.pop_back()
    }

    pub(crate) fn clear_redo(&mut self) -> Vec<Evicted> {
        self.redo_stack.drain(..).map(Evicted::Redo).collect()
    }

    pub(crate) fn clear(&mut self) -> Vec<Evicted> {
        let mut evicted: Vec<Evicted> = self.undo_stack.drain(..).map(Evicted::Undo).collect();
        evicted.extend(self.clear_redo());
        evicted
    }

    pub(crate) fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub(crate) fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub(crate) fn peek_undo(&self) -> Option<&Memento> {
        self.undo_stack.back()
    }

    pub(crate) fn peek_redo(&self) -> Option<&Memento> {
        self.redo_stack.back()
    }

    /// Most recent first.
    pub(crate) fn undo_labels(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(ToString::to_string).collect()
    }

    pub(crate) fn redo_labels(&self) -> Vec<String> {
        self.redo_stack.iter().rev().map(ToString::to_string).collect()
    }
}
