use crate::protocol::Fault;

#[derive(Debug)]
pub enum Error {
    Rejected(Fault),
    Aborted,
    Detached,
    GeneratorAborted,
    ChannelClosed,
    UnexpectedPayloadType(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Rejected(fault) => write!(f, "rejected: {}", fault.message),
            Error::Aborted => write!(f, "Aborted."),
            Error::Detached => write!(f, "this stub has been detached"),
            Error::GeneratorAborted => write!(f, "This generator has been aborted."),
            Error::ChannelClosed => write!(f, "channel closed before the call settled"),
            Error::UnexpectedPayloadType(expected) => {
                write!(f, "unexpected payload type, expected {}", expected)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::Rejected(fault)
    }
}
