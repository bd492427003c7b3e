// RPC bindings over paired in-process message ports, following the
// call/reply protocol of MessagePort-style RPC.

mod channel;
mod error;
mod generator;
mod protocol;
mod rpc;

pub use crate::channel::{channel, Envelope, ListenerId, Port};
pub use crate::error::Error;
pub use crate::generator::*;
pub use crate::protocol::*;
pub use crate::rpc::*;
