use thiserror::Error;
use std::io::ErrorKind;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("requested resource is not a directory")]
    NotADirectory,

    #[error("requested resource already exists")]
    AlreadyExists,

    #[error("cannot find requested resource")]
    NotFound,

    #[error("name exceeds the maximum length")]
    NameTooLong,

    #[error("node is already attached to a directory")]
    AlreadyAttached,

    #[error("parameter is invalid")]
    InvalidArgument,

    #[error("node tree is not well-formed")]
    InvalidTree,

    #[error("memory allocation failed")]
    OutOfMemory,
}

pub type FsResult<T> = Result<T, FsError>;

use libc::c_int;
impl Into<c_int> for FsError {
    fn into(self) -> c_int {
        match self {
            FsError::Io(io_err) => match io_err.kind() {
                ErrorKind::NotFound => libc::ENOENT,
                ErrorKind::PermissionDenied => libc::EACCES,
                ErrorKind::AlreadyExists => libc::EEXIST,
                ErrorKind::InvalidInput => libc::EINVAL,
                ErrorKind::InvalidData => libc::EINVAL,
                ErrorKind::Interrupted => libc::EINTR,
                ErrorKind::Unsupported => libc::ENOSYS,
                ErrorKind::OutOfMemory => libc::ENOMEM,
                _ => libc::EIO,
            },
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotFound => libc::ENOENT,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::AlreadyAttached => libc::EMLINK,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::InvalidTree => libc::EINVAL,
            FsError::OutOfMemory => libc::ENOMEM,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        let e: c_int = FsError::NotADirectory.into();
        assert_eq!(e, libc::ENOTDIR);
        let e: c_int = FsError::NameTooLong.into();
        assert_eq!(e, libc::ENAMETOOLONG);
        let e: c_int = FsError::Io(std::io::Error::from(ErrorKind::WriteZero)).into();
        assert_eq!(e, libc::EIO);
    }
}
