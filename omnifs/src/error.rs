use thiserror::Error;

/// Stable error kinds reported to clients. The numeric codes are part of the
/// wire format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Success,
    NotFound,
    PermissionDenied,
    IoError,
    InvalidPath,
    FileExists,
    NoSpace,
    InvalidConfig,
    NotImplemented,
    InvalidSession,
    DirectoryNotEmpty,
    InvalidOperation,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Success => 0,
            ErrorKind::NotFound => -1,
            ErrorKind::PermissionDenied => -2,
            ErrorKind::IoError => -3,
            ErrorKind::InvalidPath => -4,
            ErrorKind::FileExists => -5,
            ErrorKind::NoSpace => -6,
            ErrorKind::InvalidConfig => -7,
            ErrorKind::NotImplemented => -8,
            ErrorKind::InvalidSession => -9,
            ErrorKind::DirectoryNotEmpty => -10,
            ErrorKind::InvalidOperation => -11,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::Success => "Operation completed successfully",
            ErrorKind::NotFound => "File/directory/user not found",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::IoError => "I/O error occurred",
            ErrorKind::InvalidPath => "Invalid path",
            ErrorKind::FileExists => "File/directory already exists",
            ErrorKind::NoSpace => "Insufficient space",
            ErrorKind::InvalidConfig => "Invalid configuration",
            ErrorKind::NotImplemented => "Feature not implemented",
            ErrorKind::InvalidSession => "Invalid session",
            ErrorKind::DirectoryNotEmpty => "Directory not empty",
            ErrorKind::InvalidOperation => "Invalid operation",
        }
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("file/directory/user not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("container I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("file/directory already exists")]
    FileExists,
    #[error("insufficient space")]
    NoSpace,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("invalid session")]
    InvalidSession,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound => ErrorKind::NotFound,
            FsError::PermissionDenied => ErrorKind::PermissionDenied,
            FsError::Io(_) => ErrorKind::IoError,
            FsError::InvalidPath(_) => ErrorKind::InvalidPath,
            FsError::FileExists => ErrorKind::FileExists,
            FsError::NoSpace => ErrorKind::NoSpace,
            FsError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            FsError::NotImplemented(_) => ErrorKind::NotImplemented,
            FsError::InvalidSession => ErrorKind::InvalidSession,
            FsError::DirectoryNotEmpty => ErrorKind::DirectoryNotEmpty,
            FsError::InvalidOperation(_) => ErrorKind::InvalidOperation,
        }
    }

    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    pub(crate) fn invalid_path(msg: impl Into<String>) -> Self {
        FsError::InvalidPath(msg.into())
    }

    pub(crate) fn invalid_op(msg: impl Into<String>) -> Self {
        FsError::InvalidOperation(msg.into())
    }

    /// Reports on-disk structures that do not decode as expected.
    pub(crate) fn corrupt(msg: &str) -> Self {
        FsError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            msg.to_string(),
        ))
    }
}
