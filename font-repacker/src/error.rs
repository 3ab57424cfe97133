//! Errors that occur during repacking

use thiserror::Error;

use crate::serialize::{ObjIdx, SerializeErrorFlags};

/// An error encountered while resolving offset overflows.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RepackError {
    #[error("object graph has nodes that are not reachable from the root")]
    GraphErrorOrphanedNodes,
    #[error("object graph contains a cycle")]
    GraphErrorCycleDetected,
    #[error("root object has incoming links")]
    GraphErrorInvalidRoot,
    #[error("link points to an object that does not exist")]
    GraphErrorInvalidObjIndex,
    #[error("link field is outside its object or overlaps another link")]
    GraphErrorInvalidLinkPosition,
    #[error("offset overflow could not be resolved ({0} overflows remain)")]
    ErrorNoResolution(usize),
    #[error("offset from object {parent} to object {child} is out of range")]
    ErrorOffsetOutOfRange { parent: ObjIdx, child: ObjIdx },
    #[error("serializing the repacked graph failed: {0}")]
    ErrorRepackSerialize(#[from] SerializeErrorFlags),
}

impl RepackError {
    /// `true` if this error indicates an inconsistent graph or a bug,
    /// rather than a layout that simply cannot be made to fit.
    ///
    /// Callers will generally want to abort the whole encoding pipeline on
    /// internal errors.
    pub fn is_internal(&self) -> bool {
        !matches!(self, RepackError::ErrorNoResolution(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_is_not_internal() {
        assert!(!RepackError::ErrorNoResolution(2).is_internal());
        assert!(RepackError::GraphErrorOrphanedNodes.is_internal());
        assert!(RepackError::ErrorOffsetOutOfRange {
            parent: 1,
            child: 0
        }
        .is_internal());
    }

    #[test]
    fn serialize_errors_convert() {
        let err: RepackError = SerializeErrorFlags::SERIALIZE_ERROR_OUT_OF_ROOM.into();
        assert_eq!(
            err.to_string(),
            "serializing the repacked graph failed: out of room"
        );
    }
}
