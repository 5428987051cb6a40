//! APDU (Application Protocol Data Unit) commands
//!
//! Short-form ISO 7816 framing as spoken by the Ledger Ethereum app and the
//! dashboard: `CLA INS P1 P2 Lc data`, answered by `data SW1 SW2`.

use crate::core::errors::WalletError;
use tracing::debug;

/// Largest data field a short APDU can carry.
pub const MAX_APDU_DATA: usize = 255;

/// P1 of the first chunk of a multi-APDU payload.
pub const P1_FIRST_CHUNK: u8 = 0x00;
/// P1 of every following chunk.
pub const P1_MORE_CHUNK: u8 = 0x80;

pub const SW_OK: u16 = 0x9000;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;

/// APDU command class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduClass {
    /// Ethereum app
    Standard = 0xE0,
    /// Device dashboard, answers whichever app is open
    Dashboard = 0xB0,
}

/// APDU instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduInstruction {
    /// Dashboard: name and version of the running app
    GetAppAndVersion = 0x01,
    GetEthPublicAddress = 0x02,
    SignTransaction = 0x04,
    GetAppConfiguration = 0x06,
    SignPersonalMessage = 0x08,
}

/// APDU command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn new(cla: ApduClass, ins: ApduInstruction, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla: cla as u8,
            ins: ins as u8,
            p1,
            p2,
            data,
        }
    }

    /// Serialize to wire bytes. An empty data field is sent as `Lc = 0`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + self.data.len());
        bytes.push(self.cla);
        bytes.push(self.ins);
        bytes.push(self.p1);
        bytes.push(self.p2);
        bytes.push(self.data.len() as u8);
        bytes.extend_from_slice(&self.data);

        debug!(
            "APDU command: CLA={:02X} INS={:02X} P1={:02X} P2={:02X} Lc={}",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len()
        );

        bytes
    }

    /// Parse wire bytes, as a device does on receipt.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        if bytes.len() < 5 {
            return Err(WalletError::TransportError(format!(
                "APDU command too short: {} bytes",
                bytes.len()
            )));
        }
        let lc = bytes[4] as usize;
        if bytes.len() != 5 + lc {
            return Err(WalletError::TransportError(format!(
                "APDU length mismatch: Lc={} but {} data bytes",
                lc,
                bytes.len() - 5
            )));
        }
        Ok(Self {
            cla: bytes[0],
            ins: bytes[1],
            p1: bytes[2],
            p2: bytes[3],
            data: bytes[5..].to_vec(),
        })
    }
}

/// Split a payload across as many commands as needed.
///
/// The first command carries `P1_FIRST_CHUNK`, every later one `P1_MORE_CHUNK`.
/// An empty payload still yields one command.
pub fn chunked_commands(cla: ApduClass, ins: ApduInstruction, payload: &[u8]) -> Vec<ApduCommand> {
    if payload.is_empty() {
        return vec![ApduCommand::new(cla, ins, P1_FIRST_CHUNK, 0x00, Vec::new())];
    }
    payload
        .chunks(MAX_APDU_DATA)
        .enumerate()
        .map(|(i, chunk)| {
            let p1 = if i == 0 { P1_FIRST_CHUNK } else { P1_MORE_CHUNK };
            ApduCommand::new(cla, ins, p1, 0x00, chunk.to_vec())
        })
        .collect()
}

/// APDU response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    pub fn new(data: Vec<u8>, status: u16) -> Self {
        Self {
            data,
            sw1: (status >> 8) as u8,
            sw2: (status & 0xFF) as u8,
        }
    }

    pub fn success(data: Vec<u8>) -> Self {
        Self::new(data, SW_OK)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        if bytes.len() < 2 {
            return Err(WalletError::TransportError("APDU response too short".to_string()));
        }

        let len = bytes.len();
        let sw1 = bytes[len - 2];
        let sw2 = bytes[len - 1];
        let data = bytes[..len - 2].to_vec();

        debug!("APDU response: SW1={:02X} SW2={:02X} DataLen={}", sw1, sw2, data.len());

        Ok(Self { data, sw1, sw2 })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.data.clone();
        bytes.push(self.sw1);
        bytes.push(self.sw2);
        bytes
    }

    pub fn is_success(&self) -> bool {
        self.status_code() == SW_OK
    }

    pub fn status_code(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    pub fn error_description(&self) -> String {
        match self.status_code() {
            0x9000 => "success".to_string(),
            0x6982 => "security status not satisfied (device locked?)".to_string(),
            0x6985 => "conditions of use not satisfied (denied by the user?)".to_string(),
            0x6A80 => "invalid data".to_string(),
            0x6A82 => "file not found".to_string(),
            0x6D00 => "instruction not supported (wrong app open?)".to_string(),
            0x6E00 => "class not supported (app not open?)".to_string(),
            0x6F00 => "unknown error".to_string(),
            0x6700 => "wrong data length".to_string(),
            0x6B00 => "invalid parameter".to_string(),
            other => format!("unknown status {:04X}", other),
        }
    }

    /// Map the status word onto the error taxonomy and return the data field.
    ///
    /// 0x6985 is what the Ethereum app answers when the user presses reject.
    pub fn into_result(self) -> Result<Vec<u8>, WalletError> {
        match self.status_code() {
            SW_OK => Ok(self.data),
            SW_CONDITIONS_NOT_SATISFIED => Err(WalletError::UserRejected(format!(
                "status {:04X}: {}",
                SW_CONDITIONS_NOT_SATISFIED,
                self.error_description()
            ))),
            status => Err(WalletError::TransportError(format!(
                "status {:04X}: {}",
                status,
                self.error_description()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apdu_command_serialization() {
        let cmd = ApduCommand::new(
            ApduClass::Standard,
            ApduInstruction::GetEthPublicAddress,
            0x00,
            0x00,
            vec![0x01, 0x02, 0x03],
        );

        let bytes = cmd.to_bytes();
        assert_eq!(bytes[0], 0xE0); // CLA
        assert_eq!(bytes[1], 0x02); // INS
        assert_eq!(bytes[2], 0x00); // P1
        assert_eq!(bytes[3], 0x00); // P2
        assert_eq!(bytes[4], 0x03); // Lc
        assert_eq!(&bytes[5..], &[0x01, 0x02, 0x03]);
        assert_eq!(ApduCommand::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_empty_data_command() {
        let cmd = ApduCommand::new(ApduClass::Dashboard, ApduInstruction::GetAppAndVersion, 0, 0, vec![]);
        let bytes = cmd.to_bytes();
        assert_eq!(bytes, vec![0xB0, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_command_parse_rejects_bad_lc() {
        assert!(ApduCommand::from_bytes(&[0xE0, 0x02, 0x00]).is_err());
        assert!(ApduCommand::from_bytes(&[0xE0, 0x02, 0x00, 0x00, 0x03, 0x01]).is_err());
    }

    #[test]
    fn test_apdu_response_parsing() {
        let response = ApduResponse::from_bytes(&[0x01, 0x02, 0x03, 0x90, 0x00]).unwrap();
        assert_eq!(response.data, vec![0x01, 0x02, 0x03]);
        assert!(response.is_success());
        assert_eq!(response.to_bytes(), vec![0x01, 0x02, 0x03, 0x90, 0x00]);
    }

    #[test]
    fn test_apdu_response_too_short() {
        assert!(ApduResponse::from_bytes(&[0x90]).is_err());
        assert!(ApduResponse::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_status_mapping() {
        let rejected = ApduResponse::new(vec![], 0x6985).into_result().unwrap_err();
        assert!(matches!(rejected, WalletError::UserRejected(_)));

        let locked = ApduResponse::new(vec![], 0x6982).into_result().unwrap_err();
        assert!(matches!(locked, WalletError::TransportError(msg) if msg.contains("6982")));

        let ok = ApduResponse::success(vec![0xAA]).into_result().unwrap();
        assert_eq!(ok, vec![0xAA]);
    }

    #[test]
    fn test_unknown_error_description() {
        let response = ApduResponse::new(vec![], 0xABCD);
        assert!(response.error_description().contains("ABCD"));
    }

    #[test]
    fn test_chunking() {
        let payload = vec![0x11u8; 600];
        let commands = chunked_commands(ApduClass::Standard, ApduInstruction::SignTransaction, &payload);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].p1, P1_FIRST_CHUNK);
        assert_eq!(commands[1].p1, P1_MORE_CHUNK);
        assert_eq!(commands[2].p1, P1_MORE_CHUNK);
        assert_eq!(commands[0].data.len(), 255);
        assert_eq!(commands[2].data.len(), 90);

        let joined: Vec<u8> = commands.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_chunking_fits_one_command() {
        let commands = chunked_commands(ApduClass::Standard, ApduInstruction::SignPersonalMessage, &[0u8; 255]);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].p1, P1_FIRST_CHUNK);
    }
}
