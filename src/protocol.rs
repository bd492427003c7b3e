// Frame types exchanged by the binders. Bodies are type-erased so a frame
// listener can recognize a frame regardless of the argument and result types
// the stubs on either side were created with.

use std::any::Any;
use std::fmt;

pub type Payload = Box<dyn Any + Send>;

// The first port accompanying a call is the reply endpoint; any further
// ports are handed to the handler.
pub struct Call {
    pub args: Payload,
}

// Posted exactly once on the reply channel.
pub enum Reply {
    Resolve(Payload),
    Reject(Fault),
}

// Posted by the caller on the reply channel to request cancellation.
pub struct Abort;

// Opens a generator session. Accompanied by exactly three ports, in order
// the next, return and throw sub-channels.
pub struct Generate {
    pub args: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub message: String,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Fault {
        Fault {
            message: message.into(),
        }
    }

    pub(crate) fn no_function_registered() -> Fault {
        Fault::new("no function registered on this RPC")
    }

    pub(crate) fn unexpected_payload(expected: &'static str) -> Fault {
        Fault::new(format!("unexpected payload type, expected {}", expected))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Fault {}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Fault::new(message)
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Fault::new(message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step<Y, R> {
    Yield(Y),
    Done(Option<R>),
}

impl<Y, R> Step<Y, R> {
    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done(_))
    }
}
