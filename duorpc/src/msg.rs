use crate::MethodId;

/// Maximum value of a call identifier; ids occupy 30 bits of the packed
/// header word and wrap naturally past this mask.
pub const CALL_ID_MASK: u32 = (1 << 30) - 1;

/// The 2-bit message classification carried in the packed header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CallType {
    /// A call expecting exactly one `Response` or `ResponseError`.
    Request = 0,
    /// A fire-and-forget call; the peer never replies.
    VoidRequest = 1,
    /// Successful reply; payload holds the encoded return value.
    Response = 2,
    /// Failed reply; payload holds a 4-byte platform-neutral error code.
    ResponseError = 3,
}

impl CallType {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => CallType::Request,
            1 => CallType::VoidRequest,
            2 => CallType::Response,
            _ => CallType::ResponseError,
        }
    }
}

/// Fixed message header: a packed word holding the 30-bit call id and the
/// 2-bit call type, followed by the method identifier. Both words travel
/// little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub call_id: u32,
    pub call_type: CallType,
    pub method_id: MethodId,
}

impl Header {
    pub const WIRE_SIZE: usize = 8;

    #[must_use]
    pub fn new(call_id: u32, call_type: CallType, method_id: MethodId) -> Self {
        Self {
            call_id: call_id & CALL_ID_MASK,
            call_type,
            method_id,
        }
    }

    #[must_use]
    pub fn pack(&self) -> [u8; Self::WIRE_SIZE] {
        let packed = (self.call_id & CALL_ID_MASK) | ((self.call_type as u32) << 30);
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..4].copy_from_slice(&packed.to_le_bytes());
        out[4..].copy_from_slice(&self.method_id.raw().to_le_bytes());
        out
    }

    #[must_use]
    pub fn unpack(bytes: [u8; Self::WIRE_SIZE]) -> Self {
        let packed = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let method = u32::from_le_bytes(bytes[4..].try_into().unwrap());
        Self {
            call_id: packed & CALL_ID_MASK,
            call_type: CallType::from_bits(packed >> 30),
            method_id: MethodId(method),
        }
    }
}

/// One wire message: header plus an opaque payload.
///
/// For requests the payload is the encoded argument tuple; for responses the
/// encoded return value (empty for methods returning nothing); for error
/// responses exactly four bytes of error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }
}
