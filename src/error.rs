//! One error type for every layer, from the link drivers up to the command dispatcher.  Lower
//! layers create the error, upper layers pass it through or add context; nothing swallows it.
use alloc::string::String;
use core::fmt;

/// The category of an [`Error`], as reported to the user next to the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed command arguments.
    Syntax,
    /// An operation was requested without its precondition (no bus bound, TAP state unknown).
    IllegalState,
    /// The link driver or cable failed to move bits.
    Transport,
    /// Nothing matched during device enumeration or chain detection.
    NotFound,
    /// A buffer for the requested transfer could not be allocated.
    OutOfMemory,
    /// The part, bus or session description is inconsistent.
    Config,
    /// A file could not be opened, read or written.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::IllegalState => "illegal state",
            ErrorKind::Transport => "transport",
            ErrorKind::NotFound => "not found",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Config => "configuration",
            ErrorKind::Io => "I/O",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Syntax(String),

    #[error("{0}")]
    IllegalState(String),

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    NotFound(String),

    #[error("cannot allocate {0} bytes")]
    OutOfMemory(usize),

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Io(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Syntax(_) => ErrorKind::Syntax,
            Error::IllegalState(_) => ErrorKind::IllegalState,
            Error::Transport(_) => ErrorKind::Transport,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Prefix the message with `context`, keeping the category.
    pub fn context(self, context: &str) -> Self {
        use alloc::format;
        match self {
            Error::Syntax(m) => Error::Syntax(format!("{context}: {m}")),
            Error::IllegalState(m) => Error::IllegalState(format!("{context}: {m}")),
            Error::Transport(m) => Error::Transport(format!("{context}: {m}")),
            Error::NotFound(m) => Error::NotFound(format!("{context}: {m}")),
            Error::Config(m) => Error::Config(format!("{context}: {m}")),
            Error::Io(m) => Error::Io(format!("{context}: {m}")),
            e @ Error::OutOfMemory(_) => e,
        }
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(alloc::string::ToString::to_string(&e))
    }
}

#[cfg(feature = "std")]
impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        use alloc::format;
        match e {
            rusb::Error::NoDevice | rusb::Error::NotFound => Error::NotFound(format!("USB: {e}")),
            _ => Error::Transport(format!("USB: {e}")),
        }
    }
}

#[cfg(feature = "std")]
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(alloc::string::ToString::to_string(&e))
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn context_keeps_category() {
        let e = Error::IllegalState("Bus missing".into()).context("readmem");
        assert_eq!(e.kind(), ErrorKind::IllegalState);
        assert_eq!(e.to_string(), "readmem: Bus missing");
    }

    #[test]
    fn kind_display() {
        assert_eq!(ErrorKind::IllegalState.to_string(), "illegal state");
        assert_eq!(Error::OutOfMemory(16).to_string(), "cannot allocate 16 bytes");
    }
}
