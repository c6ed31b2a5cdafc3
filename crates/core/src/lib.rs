//! Core identity and wire frame types shared by the relay gateway and its clients.

pub mod frame;
pub mod identity;

pub use frame::{
    AckFrame, ClientFrame, ExceptionPayload, ExceptionStatus, RelayEvent, ServerFrame,
    ACK_OK, CONNECT_EVENT,
};
pub use identity::{Capability, Identity, UnknownCapability};
