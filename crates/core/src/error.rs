use thiserror::Error;

use crate::ids::ObjectId;

/// Violations of the change-notification contract, detected by a tracker.
///
/// None of these are recovered locally. A tracker raising one resets its
/// in-flight state and disables tracking before the error reaches the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("'changed' for {member} of {object:?} arrived without a matching 'about to change'")]
    UnmatchedChanged { object: ObjectId, member: String },

    #[error("{member} of {object:?} is already being changed")]
    AlreadyChanging { object: ObjectId, member: String },

    #[error("change of {member} of {object:?} completed out of order")]
    OutOfOrderCompletion { object: ObjectId, member: String },

    #[error(
        "internal state inconsistent: {frames} open frames, {properties} property and {collections} collection changes in flight"
    )]
    InconsistentState {
        frames: usize,
        properties: usize,
        collections: usize,
    },

    #[error(
        "undeclared side effect: {member} of {object:?} changed at cascade depth {depth} (declared edit at {expected:?})"
    )]
    UndeclaredSideEffect {
        object: ObjectId,
        member: String,
        depth: usize,
        expected: Option<usize>,
    },

    #[error(
        "{member} of {object:?} changed at cascade depth {depth} while a recorded unit was being restored"
    )]
    SideEffectDuringRestore {
        object: ObjectId,
        member: String,
        depth: usize,
    },

    #[error("disconnected object {object:?} mutated ({member}) outside a declared edit or restore")]
    DisconnectedMutation { object: ObjectId, member: String },

    #[error("change notification delivered from a thread that does not own the tracker")]
    CrossThread,

    #[error("restore requested while an operation is in progress")]
    RestoreDuringOperation,

    #[error("no restore in progress")]
    NoRestoreInProgress,

    #[error("change tracking is disabled")]
    TrackingDisabled,

    #[error("end of edit on {object:?} without a matching begin")]
    EndEditWithoutBegin { object: ObjectId },

    #[error("nested begin of edit on {object:?} without an intervening end")]
    NestedBeginEdit { object: ObjectId },

    #[error("declared edit ended without a matching begin")]
    UnbalancedDeclaredEdit,
}

impl ProtocolError {
    /// Errors caused by the caller driving edit boundaries out of order, as
    /// opposed to a broken notification path.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            Self::EndEditWithoutBegin { .. }
                | Self::NestedBeginEdit { .. }
                | Self::UnbalancedDeclaredEdit
        )
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("index {index} out of range for collection of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{object:?} does not support {capability}")]
    MissingCapability {
        object: ObjectId,
        capability: &'static str,
    },

    #[error("{0:?} is already being edited")]
    AlreadyEditing(ObjectId),

    #[error("{0:?} is not being edited")]
    NotEditing(ObjectId),

    #[error("invalid value for {member}: {reason}")]
    InvalidValue { member: String, reason: String },

    #[error("object {0:?} has been dropped")]
    ObjectDropped(ObjectId),
}

impl CoreError {
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}
