//! Crate-wide error type for shard map management.
//!
//! Store-level failures ([`StoreError`]) are translated into the taxonomy the
//! callers act on: transient faults are retried, version and not-found
//! faults invalidate cached state and surface, integrity faults always
//! surface.

use thiserror::Error;
use uuid::Uuid;

use crate::key::KeyError;
use crate::store::{ConflictKind, StoreEntity, StoreError};

#[derive(Error, Debug)]
pub enum ShardManagementError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(i32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Shard map does not exist: {0}")]
    ShardMapDoesNotExist(String),

    #[error("Shard map already exists: {0}")]
    ShardMapAlreadyExists(String),

    #[error("Shard map still has shards: {0}")]
    ShardMapHasShards(String),

    #[error("Shard does not exist: {0}")]
    ShardDoesNotExist(String),

    #[error("Shard already exists: {0}")]
    ShardAlreadyExists(String),

    #[error("Shard still has mappings: {0}")]
    ShardHasMappings(String),

    #[error("Mapping does not exist: {0}")]
    MappingDoesNotExist(String),

    #[error("Range is already mapped: {0}")]
    MappingRangeAlreadyMapped(String),

    #[error("Mapping is offline: {0}")]
    MappingIsOffline(String),

    #[error("Mapping must be offline for this operation: {0}")]
    MappingIsNotOffline(String),

    #[error("Mapping lock owner mismatch: {0}")]
    MappingLockOwnerMismatch(String),

    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    #[error("Transient store fault: {0}")]
    TransientStoreFault(String),

    #[error("Data integrity fault: {0}")]
    DataIntegrity(String),

    #[error("Unknown recovery token: {0}")]
    UnknownRecoveryToken(Uuid),

    #[error("Store error: {0}")]
    Store(StoreError),
}

pub type ShardResult<T> = Result<T, ShardManagementError>;

/// Coarse classification used by the retry policy and cache invalidation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller bug or malformed input; never retried.
    Programmer,
    /// Optimistic concurrency loss; re-read and retry.
    VersionMismatch,
    /// Entity vanished; invalidate cached state.
    NotFound,
    /// Entity exists but the request conflicts with its state.
    Conflict,
    /// Network / timeout; retried per policy.
    Transient,
    /// Cross-shard overlap found during a rebuild.
    Integrity,
    /// Anything else coming out of the store.
    Store,
}

impl ShardManagementError {
    pub fn kind(&self) -> ErrorKind {
        use ShardManagementError::*;
        match self {
            Key(_) | InvalidStatusCode(_) | InvalidArgument(_) | UnknownRecoveryToken(_) => {
                ErrorKind::Programmer
            }
            VersionMismatch(_) => ErrorKind::VersionMismatch,
            ShardMapDoesNotExist(_) | ShardDoesNotExist(_) | MappingDoesNotExist(_) => {
                ErrorKind::NotFound
            }
            ShardMapAlreadyExists(_)
            | ShardMapHasShards(_)
            | ShardAlreadyExists(_)
            | ShardHasMappings(_)
            | MappingRangeAlreadyMapped(_)
            | MappingIsOffline(_)
            | MappingIsNotOffline(_)
            | MappingLockOwnerMismatch(_) => ErrorKind::Conflict,
            TransientStoreFault(_) => ErrorKind::Transient,
            DataIntegrity(_) => ErrorKind::Integrity,
            Store(_) => ErrorKind::Store,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<StoreError> for ShardManagementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::TransientStoreFault(msg),
            StoreError::Timeout(msg) => Self::TransientStoreFault(format!("timed out: {}", msg)),
            StoreError::VersionMismatch(msg) => Self::VersionMismatch(msg),
            StoreError::NotFound { entity, id } => match entity {
                StoreEntity::ShardMap => Self::ShardMapDoesNotExist(id),
                StoreEntity::Shard => Self::ShardDoesNotExist(id),
                StoreEntity::Mapping => Self::MappingDoesNotExist(id),
                StoreEntity::Operation => Self::Store(StoreError::NotFound { entity, id }),
            },
            StoreError::Conflict { kind, detail } => match kind {
                ConflictKind::ShardMapNameTaken => Self::ShardMapAlreadyExists(detail),
                ConflictKind::ShardMapHasShards => Self::ShardMapHasShards(detail),
                ConflictKind::ShardLocationTaken | ConflictKind::AlreadyExists => {
                    Self::ShardAlreadyExists(detail)
                }
                ConflictKind::ShardHasMappings => Self::ShardHasMappings(detail),
                ConflictKind::RangeOverlap => Self::MappingRangeAlreadyMapped(detail),
                ConflictKind::LockOwnerMismatch => Self::MappingLockOwnerMismatch(detail),
                ConflictKind::PendingOperation => Self::VersionMismatch(detail),
            },
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let err: ShardManagementError = StoreError::Timeout("gsm".to_string()).into();
        assert!(err.is_transient());

        let err: ShardManagementError = StoreError::NotFound {
            entity: StoreEntity::Mapping,
            id: "m1".to_string(),
        }
        .into();
        assert!(matches!(err, ShardManagementError::MappingDoesNotExist(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: ShardManagementError = StoreError::Conflict {
            kind: ConflictKind::PendingOperation,
            detail: "busy".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }

    #[test]
    fn test_key_errors_are_programmer_faults() {
        let err: ShardManagementError = KeyError::MaxValueUnrepresentable(
            crate::key::ShardKeyType::Int32,
        )
        .into();
        assert_eq!(err.kind(), ErrorKind::Programmer);
        assert!(!err.is_transient());
    }
}
