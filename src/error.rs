//! Error taxonomy.
//!
//! Configuration problems are fatal at init and surface through the group's
//! `init_fail` flag. Resource exhaustion is recoverable at the scope of the
//! operation that hit it. Bridge transport errors distinguish an absent peer
//! (which is legitimate) from a malformed reply (which is not).

use std::fmt;

/// A POSIX-style error number handed back to the socket shim.
///
/// Values match the host's errno constants so the shim can surface them to
/// applications unchanged.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const AGAIN: Errno = Errno(libc::EAGAIN);
    pub const BADF: Errno = Errno(libc::EBADF);
    pub const INVAL: Errno = Errno(libc::EINVAL);
    pub const NOMEM: Errno = Errno(libc::ENOMEM);
    pub const ADDRINUSE: Errno = Errno(libc::EADDRINUSE);
    pub const CONNREFUSED: Errno = Errno(libc::ECONNREFUSED);
    pub const NOTCONN: Errno = Errno(libc::ENOTCONN);
    pub const ISCONN: Errno = Errno(libc::EISCONN);
    pub const OPNOTSUPP: Errno = Errno(libc::EOPNOTSUPP);
    pub const MFILE: Errno = Errno(libc::EMFILE);
    pub const PIPE: Errno = Errno(libc::EPIPE);

    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Errno::AGAIN => "EAGAIN",
            Errno::BADF => "EBADF",
            Errno::INVAL => "EINVAL",
            Errno::NOMEM => "ENOMEM",
            Errno::ADDRINUSE => "EADDRINUSE",
            Errno::CONNREFUSED => "ECONNREFUSED",
            Errno::NOTCONN => "ENOTCONN",
            Errno::ISCONN => "EISCONN",
            Errno::OPNOTSUPP => "EOPNOTSUPP",
            Errno::MFILE => "EMFILE",
            Errno::PIPE => "EPIPE",
            Errno(n) => return write!(f, "Errno({})", n),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    #[error("worker initialization failed")]
    InitFail,

    #[error("no worker available for placement")]
    NoStack,

    #[error("bridge: cannot connect to process {0}")]
    BridgeConnect(u8),

    #[error("bridge: malformed reply")]
    BridgeReply,

    #[error("flow rule: {0}")]
    Flow(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("os error: {0}")]
    Os(Errno),
}

impl Error {
    /// Collapse into the errno the shim reports to the application.
    pub fn errno(&self) -> Errno {
        match self {
            Error::NoStack | Error::Exhausted(_) => Errno::NOMEM,
            Error::Os(e) => *e,
            Error::Io(e) => Errno(e.raw_os_error().unwrap_or(libc::EIO)),
            _ => Errno::INVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
