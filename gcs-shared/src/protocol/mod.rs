pub mod header;
pub mod messages;

pub use header::{
    Identifier, MessageCategory, MessageHeader, MessageType, NotifyId, RpcId, HEADER_LEN,
    PROTOCOL_VERSION,
};
pub use messages::*;
