use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The device is already open by another client.
    Busy,
    /// The session was closed.
    Closed,
    /// The worker thread is gone.
    Disconnected,
    /// A link exchange failed.
    Exchange,
    /// The remote side advertised no payload.
    NoData,
    /// RESPONSE never followed REQUEST.
    HandshakeTimeout { polls: u32 },
    /// The operation would have to drop data.
    WouldBlock,
    /// Not enough room in a buffer.
    BufferFull,
    /// Rejected configuration value.
    InvalidConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Busy => write!(f, "Device busy"),
            Error::Closed => write!(f, "Session closed"),
            Error::Disconnected => write!(f, "Worker disconnected"),
            Error::Exchange => write!(f, "Link exchange failed"),
            Error::NoData => write!(f, "No payload available"),
            Error::HandshakeTimeout { polls } => {
                write!(f, "Handshake timeout after {} polls", polls)
            }
            Error::WouldBlock => write!(f, "Operation would block"),
            Error::BufferFull => write!(f, "Buffer full"),
            Error::InvalidConfig(what) => write!(f, "Invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        let kind = match err {
            Error::Busy => std::io::ErrorKind::ResourceBusy,
            Error::WouldBlock | Error::BufferFull => std::io::ErrorKind::WouldBlock,
            Error::Closed | Error::Disconnected => std::io::ErrorKind::NotConnected,
            Error::HandshakeTimeout { .. } => std::io::ErrorKind::TimedOut,
            Error::InvalidConfig(_) => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
