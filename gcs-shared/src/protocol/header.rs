//! Wire message header: 16 bytes, little-endian, packed identifier.
//!
//! Layout of the 32-bit identifier (high bits first): 4-bit type,
//! 8-bit category, 12-bit id, 8-bit version.

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    None = 0x0,
    Request = 0x1,
    Response = 0x2,
    Notify = 0x3,
}

impl MessageType {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0x0 => Some(MessageType::None),
            0x1 => Some(MessageType::Request),
            0x2 => Some(MessageType::Response),
            0x3 => Some(MessageType::Notify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    None = 0x000,
    ComputeSystem = 0x001,
}

impl MessageCategory {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0x000 => Some(MessageCategory::None),
            0x001 => Some(MessageCategory::ComputeSystem),
            _ => None,
        }
    }
}

/// RPC request ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RpcId {
    NegotiateProtocol = 1,
    Create = 2,
    Start = 3,
    ShutdownGraceful = 4,
    ShutdownForced = 5,
    ExecuteProcess = 6,
    WaitForProcess = 7,
    SignalProcess = 8,
    ResizeConsole = 9,
    GetProperties = 10,
    ModifySettings = 11,
    DumpStacks = 12,
    DeleteContainerState = 13,
    UpdateContainer = 14,
    LifecycleNotification = 15,
}

impl RpcId {
    fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            1 => RpcId::NegotiateProtocol,
            2 => RpcId::Create,
            3 => RpcId::Start,
            4 => RpcId::ShutdownGraceful,
            5 => RpcId::ShutdownForced,
            6 => RpcId::ExecuteProcess,
            7 => RpcId::WaitForProcess,
            8 => RpcId::SignalProcess,
            9 => RpcId::ResizeConsole,
            10 => RpcId::GetProperties,
            11 => RpcId::ModifySettings,
            12 => RpcId::DumpStacks,
            13 => RpcId::DeleteContainerState,
            14 => RpcId::UpdateContainer,
            15 => RpcId::LifecycleNotification,
            _ => return None,
        })
    }
}

/// Notification kinds. Occupies the same id space as `RpcId`
/// but under `MessageType::Notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyId {
    Container = 1,
}

impl NotifyId {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(NotifyId::Container),
            _ => None,
        }
    }
}

pub const PROTOCOL_VERSION: u8 = 1;

/// A decoded 32-bit message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier {
    pub msg_type: u8,
    pub category: u16,
    pub id: u16,
    pub version: u8,
}

impl Identifier {
    pub fn request(id: RpcId) -> Self {
        Identifier {
            msg_type: MessageType::Request as u8,
            category: MessageCategory::ComputeSystem as u16,
            id: id as u16,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn notify(id: NotifyId) -> Self {
        Identifier {
            msg_type: MessageType::Notify as u8,
            category: MessageCategory::ComputeSystem as u16,
            id: id as u16,
            version: PROTOCOL_VERSION,
        }
    }

    /// The response identifier derived from a request: same bits except
    /// the type field is replaced with `Response`.
    pub fn as_response(&self) -> Self {
        Identifier {
            msg_type: MessageType::Response as u8,
            ..*self
        }
    }

    pub fn msg_type_enum(&self) -> Option<MessageType> {
        MessageType::from_bits(self.msg_type as u32)
    }

    pub fn category_enum(&self) -> Option<MessageCategory> {
        MessageCategory::from_bits(self.category as u32)
    }

    pub fn rpc_id(&self) -> Option<RpcId> {
        RpcId::from_bits(self.id as u32)
    }

    pub fn notify_id(&self) -> Option<NotifyId> {
        NotifyId::from_bits(self.id as u32)
    }

    pub fn pack(&self) -> u32 {
        ((self.msg_type as u32 & 0xF) << 28)
            | ((self.category as u32 & 0xFF) << 20)
            | ((self.id as u32 & 0xFFF) << 8)
            | (self.version as u32 & 0xFF)
    }

    pub fn unpack(bits: u32) -> Self {
        Identifier {
            msg_type: ((bits >> 28) & 0xF) as u8,
            category: ((bits >> 20) & 0xFF) as u16,
            id: ((bits >> 8) & 0xFFF) as u16,
            version: (bits & 0xFF) as u8,
        }
    }
}

/// The 16-byte wire header: identifier, total size (including header),
/// sequence id. All fields little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub identifier: Identifier,
    pub size: u32,
    pub sequence_id: u64,
}

impl MessageHeader {
    pub fn new(identifier: Identifier, payload_len: u32, sequence_id: u64) -> Self {
        MessageHeader {
            identifier,
            size: HEADER_LEN as u32 + payload_len,
            sequence_id,
        }
    }

    pub fn payload_len(&self) -> u32 {
        self.size.saturating_sub(HEADER_LEN as u32)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.identifier.pack().to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        let id_bits = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let sequence_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        MessageHeader {
            identifier: Identifier::unpack(id_bits),
            size,
            sequence_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_pack_roundtrip_for_legal_values() {
        for msg_type in 0u8..=0x3 {
            for category in [0x000u16, 0x001] {
                for id in 0u16..16 {
                    for version in [0u8, 1, 255] {
                        let ident = Identifier {
                            msg_type,
                            category,
                            id,
                            version,
                        };
                        let packed = ident.pack();
                        let back = Identifier::unpack(packed);
                        assert_eq!(ident, back);
                    }
                }
            }
        }
    }

    #[test]
    fn response_identifier_replaces_only_type_bits() {
        let req = Identifier::request(RpcId::Create);
        let resp = req.as_response();
        assert_eq!(resp.msg_type, MessageType::Response as u8);
        assert_eq!(resp.category, req.category);
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.version, req.version);
    }

    #[test]
    fn header_roundtrip_through_bytes() {
        let ident = Identifier::request(RpcId::WaitForProcess);
        let header = MessageHeader::new(ident, 42, 7);
        let bytes = header.to_bytes();
        let back = MessageHeader::from_bytes(&bytes);
        assert_eq!(header, back);
        assert_eq!(back.payload_len(), 42);
    }

    #[test]
    fn header_is_sixteen_bytes() {
        let ident = Identifier::request(RpcId::NegotiateProtocol);
        let header = MessageHeader::new(ident, 0, 0);
        assert_eq!(header.to_bytes().len(), HEADER_LEN);
    }

    #[test]
    fn rpc_id_roundtrips_through_identifier() {
        let ids = [
            RpcId::NegotiateProtocol,
            RpcId::Create,
            RpcId::Start,
            RpcId::ShutdownGraceful,
            RpcId::ShutdownForced,
            RpcId::ExecuteProcess,
            RpcId::WaitForProcess,
            RpcId::SignalProcess,
            RpcId::ResizeConsole,
            RpcId::GetProperties,
            RpcId::ModifySettings,
            RpcId::DumpStacks,
            RpcId::DeleteContainerState,
            RpcId::UpdateContainer,
            RpcId::LifecycleNotification,
        ];
        for id in ids {
            let ident = Identifier::request(id);
            assert_eq!(ident.rpc_id(), Some(id));
        }
    }

    #[test]
    fn unknown_rpc_id_surfaces_as_none() {
        let ident = Identifier {
            msg_type: MessageType::Request as u8,
            category: MessageCategory::ComputeSystem as u16,
            id: 0xFFF,
            version: PROTOCOL_VERSION,
        };
        assert!(ident.rpc_id().is_none());
    }
}
