use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("{call} failed: {source}")]
    System {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PoolError {
    pub(crate) fn system(call: &'static str, errno: Errno) -> PoolError {
        PoolError::System {
            call,
            source: std::io::Error::from_raw_os_error(errno as i32),
        }
    }

    pub(crate) fn io(call: &'static str, source: std::io::Error) -> PoolError {
        PoolError::System { call, source }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
