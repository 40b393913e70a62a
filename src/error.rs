use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("out of resources: {0}")]
    OutOfResources(&'static str),

    #[error("nothing cached at {0:#x}")]
    NotFound(u64),

    #[error("write-back failed: {0}")]
    Io(#[from] io::Error),

    #[error("acquisition would block")]
    WouldBlock,
}

impl CacheError {
    /// True for write-back failures that flush accounting treats as
    /// non-retriable but non-fatal: end-of-file and write-protected.
    pub fn is_terminal_write(&self) -> bool {
        matches!(
            self,
            CacheError::Io(e)
                if e.kind() == io::ErrorKind::UnexpectedEof
                    || e.kind() == io::ErrorKind::PermissionDenied
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_write_classification() {
        let eof = CacheError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        let prot = CacheError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        let other = CacheError::Io(io::Error::new(io::ErrorKind::Other, "disk"));

        assert!(eof.is_terminal_write());
        assert!(prot.is_terminal_write());
        assert!(!other.is_terminal_write());
        assert!(!CacheError::WouldBlock.is_terminal_write());
    }

    #[test]
    fn test_io_error_conversion() {
        fn inner() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "boom"))?
        }
        assert!(matches!(inner(), Err(CacheError::Io(_))));
    }
}
