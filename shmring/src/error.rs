use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RingError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("ring buffer operation missed its deadline")]
    Timeout,

    #[error("{call} failed: {source}")]
    System {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl RingError {
    pub(crate) fn system(call: &'static str, errno: Errno) -> RingError {
        RingError::System {
            call,
            source: std::io::Error::from_raw_os_error(errno as i32),
        }
    }
}

pub type Result<T> = std::result::Result<T, RingError>;
