//! Trezor protobuf messages
//!
//! Minimal protobuf wire format: enough to build the Ethereum requests and
//! read the fields of the responses without generated code.

use crate::core::errors::WalletError;

/// Message type ids from the Trezor protocol definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Initialize = 0,
    Success = 2,
    Failure = 3,
    Features = 17,
    ButtonRequest = 26,
    ButtonAck = 27,
    EthereumGetAddress = 56,
    EthereumAddress = 57,
    EthereumSignTx = 58,
    EthereumTxRequest = 59,
    EthereumTxAck = 60,
    EthereumSignMessage = 64,
    EthereumMessageSignature = 66,
    EthereumGetPublicKey = 450,
    EthereumPublicKey = 451,
    EthereumSignTxEIP1559 = 452,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Initialize),
            2 => Some(Self::Success),
            3 => Some(Self::Failure),
            17 => Some(Self::Features),
            26 => Some(Self::ButtonRequest),
            27 => Some(Self::ButtonAck),
            56 => Some(Self::EthereumGetAddress),
            57 => Some(Self::EthereumAddress),
            58 => Some(Self::EthereumSignTx),
            59 => Some(Self::EthereumTxRequest),
            60 => Some(Self::EthereumTxAck),
            64 => Some(Self::EthereumSignMessage),
            66 => Some(Self::EthereumMessageSignature),
            450 => Some(Self::EthereumGetPublicKey),
            451 => Some(Self::EthereumPublicKey),
            452 => Some(Self::EthereumSignTxEIP1559),
            _ => None,
        }
    }
}

/// `Failure.code` values the wallet distinguishes.
pub mod failure_code {
    pub const UNEXPECTED_MESSAGE: u64 = 1;
    pub const DATA_ERROR: u64 = 3;
    pub const ACTION_CANCELLED: u64 = 4;
    pub const PIN_CANCELLED: u64 = 6;
    pub const FIRMWARE_ERROR: u64 = 99;
}

/// Trezor message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrezorMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl TrezorMessage {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Vec::new())
    }

    /// `type(2, BE) length(4, BE) payload`
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.payload.len());
        buf.extend_from_slice(&(self.msg_type as u16).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, WalletError> {
        if data.len() < 6 {
            return Err(WalletError::TransportError("Trezor message too short".to_string()));
        }

        let msg_type_val = u16::from_be_bytes([data[0], data[1]]);
        let msg_type = MessageType::from_u16(msg_type_val).ok_or_else(|| {
            WalletError::TransportError(format!("unknown Trezor message type: {}", msg_type_val))
        })?;

        let msg_len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
        if data.len() < 6 + msg_len {
            return Err(WalletError::TransportError("Trezor message truncated".to_string()));
        }

        Ok(Self {
            msg_type,
            payload: data[6..6 + msg_len].to_vec(),
        })
    }

    pub fn fields(&self) -> Result<ProtoFields, WalletError> {
        ProtoFields::parse(&self.payload)
    }
}

/// `address_n` as repeated uint32 field 1
pub fn encode_bip32_path(path: &[u32]) -> Vec<u8> {
    let mut buf = Vec::new();
    for &index in path {
        buf.push(0x08);
        encode_varint(&mut buf, index as u64);
    }
    buf
}

pub fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Returns the value and the number of bytes consumed.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), WalletError> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in data.iter().enumerate() {
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(WalletError::TransportError("varint overflow".to_string()));
        }
    }

    Err(WalletError::TransportError("varint truncated".to_string()))
}

pub fn encode_string_field(field_num: u32, value: &str) -> Vec<u8> {
    encode_bytes_field(field_num, value.as_bytes())
}

pub fn encode_bytes_field(field_num: u32, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + 4);
    encode_varint(&mut buf, ((field_num << 3) | 2) as u64);
    encode_varint(&mut buf, value.len() as u64);
    buf.extend_from_slice(value);
    buf
}

pub fn encode_uint64_field(field_num: u32, value: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_varint(&mut buf, (field_num << 3) as u64);
    encode_varint(&mut buf, value);
    buf
}

pub fn encode_uint32_field(field_num: u32, value: u32) -> Vec<u8> {
    encode_uint64_field(field_num, value as u64)
}

pub fn encode_bool_field(field_num: u32, value: bool) -> Vec<u8> {
    encode_uint32_field(field_num, u32::from(value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoValue {
    Varint(u64),
    Bytes(Vec<u8>),
}

/// Decoded message fields in wire order. Repeated fields appear once per value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtoFields {
    fields: Vec<(u32, ProtoValue)>,
}

impl ProtoFields {
    /// Parse varint and length-delimited fields. Fixed32/64 are not used by
    /// any Ethereum message and are rejected.
    pub fn parse(data: &[u8]) -> Result<Self, WalletError> {
        let mut fields = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let (key, used) = decode_varint(&data[offset..])?;
            offset += used;
            let field = (key >> 3) as u32;
            match key & 0x07 {
                0 => {
                    let (value, used) = decode_varint(&data[offset..])?;
                    offset += used;
                    fields.push((field, ProtoValue::Varint(value)));
                }
                2 => {
                    let (len, used) = decode_varint(&data[offset..])?;
                    offset += used;
                    let end = offset
                        .checked_add(len as usize)
                        .filter(|end| *end <= data.len())
                        .ok_or_else(|| WalletError::TransportError(format!("field {} truncated", field)))?;
                    fields.push((field, ProtoValue::Bytes(data[offset..end].to_vec())));
                    offset = end;
                }
                wire_type => {
                    return Err(WalletError::TransportError(format!(
                        "unsupported wire type {} for field {}",
                        wire_type, field
                    )))
                }
            }
        }

        Ok(Self { fields })
    }

    pub fn uint(&self, field: u32) -> Option<u64> {
        self.fields.iter().find_map(|(f, v)| match v {
            ProtoValue::Varint(n) if *f == field => Some(*n),
            _ => None,
        })
    }

    pub fn bool(&self, field: u32) -> Option<bool> {
        self.uint(field).map(|v| v != 0)
    }

    pub fn bytes(&self, field: u32) -> Option<&[u8]> {
        self.fields.iter().find_map(|(f, v)| match v {
            ProtoValue::Bytes(b) if *f == field => Some(b.as_slice()),
            _ => None,
        })
    }

    pub fn string(&self, field: u32) -> Option<String> {
        self.bytes(field).map(|b| String::from_utf8_lossy(b).to_string())
    }

    pub fn repeated_uint(&self, field: u32) -> Vec<u64> {
        self.fields
            .iter()
            .filter_map(|(f, v)| match v {
                ProtoValue::Varint(n) if *f == field => Some(*n),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = TrezorMessage::new(MessageType::Initialize, vec![0x01, 0x02, 0x03]);
        let serialized = msg.serialize();

        assert_eq!(&serialized[0..2], &[0x00, 0x00]);
        assert_eq!(&serialized[2..6], &[0x00, 0x00, 0x00, 0x03]);
        assert_eq!(&serialized[6..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_message_deserialization() {
        let data = vec![
            0x01, 0xC4, // EthereumSignTxEIP1559 = 452
            0x00, 0x00, 0x00, 0x02,
            0x0A, 0x0B,
        ];
        let msg = TrezorMessage::deserialize(&data).unwrap();
        assert_eq!(msg.msg_type, MessageType::EthereumSignTxEIP1559);
        assert_eq!(msg.payload, vec![0x0A, 0x0B]);
    }

    #[test]
    fn test_deserialize_rejects_unknown_and_truncated() {
        assert!(TrezorMessage::deserialize(&[0x00, 0x63, 0, 0, 0, 0]).is_err());
        assert!(TrezorMessage::deserialize(&[0x00, 0x02, 0, 0, 0, 4, 0x01]).is_err());
        assert!(TrezorMessage::deserialize(&[0x00]).is_err());
    }

    #[test]
    fn test_varint() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);
        assert_eq!(decode_varint(&buf).unwrap(), (300, 2));

        assert_eq!(decode_varint(&[0x7F]).unwrap(), (127, 1));
        assert!(decode_varint(&[0x80]).is_err());
        assert!(decode_varint(&[0xFF; 11]).is_err());
    }

    #[test]
    fn test_bip32_path_encoding() {
        let encoded = encode_bip32_path(&[0x8000002C, 0]);
        assert_eq!(encoded, vec![0x08, 0xAC, 0x80, 0x80, 0x80, 0x08, 0x08, 0x00]);
        let fields = ProtoFields::parse(&encoded).unwrap();
        assert_eq!(fields.repeated_uint(1), vec![0x8000002C, 0]);
    }

    #[test]
    fn test_field_decoding() {
        let mut payload = encode_bip32_path(&[1, 2]);
        payload.extend(encode_string_field(3, "0xabc"));
        payload.extend(encode_bytes_field(4, &[0xDE, 0xAD]));
        payload.extend(encode_bool_field(5, true));
        payload.extend(encode_uint64_field(6, u64::MAX));

        let fields = ProtoFields::parse(&payload).unwrap();
        assert_eq!(fields.repeated_uint(1), vec![1, 2]);
        assert_eq!(fields.string(3).as_deref(), Some("0xabc"));
        assert_eq!(fields.bytes(4), Some(&[0xDE, 0xAD][..]));
        assert_eq!(fields.bool(5), Some(true));
        assert_eq!(fields.uint(6), Some(u64::MAX));
        assert_eq!(fields.uint(7), None);
    }

    #[test]
    fn test_field_decoding_rejects_truncated_bytes() {
        let mut payload = encode_bytes_field(2, &[1, 2, 3, 4]);
        payload.truncate(4);
        assert!(ProtoFields::parse(&payload).is_err());
    }
}
