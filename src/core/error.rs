use crate::core::transaction::TransactionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlabError {
    // Format
    #[error("Unknown container format")]
    UnknownFormat,

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Backing store is not empty")]
    StoreNotEmpty,

    // General
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Inconsistent data: {0}")]
    InconsistentData(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // Allocation and block groups
    #[error("Bitmap bit {index} is already {}", bit_state(.set))]
    WrongBit { index: usize, set: bool },

    #[error("Bitmap corrupted: {0}")]
    BitmapCorrupted(String),

    #[error("Not enough free space for {0} contiguous entries")]
    NotEnoughSpace(usize),

    #[error("Invalid block group {0}")]
    InvalidBlockGroup(i32),

    #[error("Unable to allocate block group {0}")]
    UnableToAllocateBlockGroup(i32),

    #[error("Unable to allocate more blocks: {0}")]
    UnableToAllocateMoreBlocks(String),

    // File streams
    #[error("File stream has no write access")]
    NoWriteAccess,

    #[error("Write requires a transaction")]
    MissingTransaction,

    #[error("Read rejected: inode {0} has uncommitted writes")]
    ReadWhileContentChanged(i32),

    #[error("File is already open for writing: {0}")]
    FileWriteAccessTaken(String),

    #[error("File too large: {requested} bytes exceeds the limit of {max} bytes")]
    FileTooLarge { requested: u64, max: u64 },

    #[error("Invalid file handle {0}")]
    InvalidHandle(u32),

    #[error("Seek to {position} is outside the file (length {length})")]
    SeekOutOfRange { position: i64, length: u64 },

    #[error("Unable to delete file with open handles: {0}")]
    UnableToDeleteFile(String),

    // Inodes
    #[error("Invalid inode {0}")]
    InvalidInode(i32),

    #[error("Inode {0} is not in use")]
    EmptyInode(i32),

    // Directories
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory has been disposed")]
    DirectoryDisposed,

    #[error("Cannot move a directory into itself: {0}")]
    MoveIntoSubtree(String),

    // Transactions
    #[error("Transaction {0} is committing")]
    TransactionCommitting(TransactionId),

    #[error("Transaction {0} is disposed")]
    TransactionDisposed(TransactionId),

    #[error("Handle is bound to transaction {bound}, not {given}")]
    TransactionMismatch {
        bound: TransactionId,
        given: TransactionId,
    },

    #[error("{what} holds uncommitted changes of transaction {holder}")]
    TransactionConflict { holder: TransactionId, what: String },

    #[error("Closing with {0} open transaction(s)")]
    UnsavedChanges(usize),

    // Configuration and I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(#[from] validator::ValidationErrors),
}

impl SlabError {
    /// True for faults that mean the in-memory structures and the store no
    /// longer agree. Everything else is ordinary control flow for callers.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            SlabError::WrongBit { .. }
                | SlabError::BitmapCorrupted(_)
                | SlabError::InconsistentData(_)
                | SlabError::Internal(_)
                | SlabError::UnableToAllocateBlockGroup(_)
        )
    }
}

impl From<SlabError> for std::io::Error {
    fn from(err: SlabError) -> Self {
        match err {
            SlabError::Io(inner) => inner,
            SlabError::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            SlabError::AlreadyExists(_) => {
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, err)
            }
            SlabError::NoWriteAccess => {
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, err)
            }
            SlabError::SeekOutOfRange { .. } | SlabError::InvalidArgument(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

fn bit_state(set: &bool) -> &'static str {
    if *set {
        "set"
    } else {
        "clear"
    }
}

pub type Result<T> = std::result::Result<T, SlabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_classification() {
        assert!(SlabError::WrongBit { index: 3, set: true }.is_internal());
        assert!(SlabError::InconsistentData("x".into()).is_internal());
        assert!(!SlabError::NotFound("a".into()).is_internal());
        assert!(!SlabError::AlreadyExists("a".into()).is_internal());
        assert!(!SlabError::MissingTransaction.is_internal());
    }

    #[test]
    fn test_wrong_bit_message() {
        let err = SlabError::WrongBit { index: 7, set: false };
        assert_eq!(err.to_string(), "Bitmap bit 7 is already clear");
    }

    #[test]
    fn test_io_conversion_keeps_kind() {
        let io: std::io::Error = SlabError::NotFound("/a".into()).into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
