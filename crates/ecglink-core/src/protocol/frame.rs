//! Frame encoding/decoding

use super::{
    ChecksumPolicy, ProtocolError, FRAME_HEAD, FRAME_OVERHEAD, FRAME_TAIL, MAX_PAYLOAD_LEN,
};

/// XOR-reduce a byte slice
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Space-separated uppercase hex, for logs
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A command or response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command byte
    pub command: u8,
    /// Frame payload, at most 255 bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame, rejecting payloads the length byte cannot describe
    pub fn new(command: u8, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::InvalidInput(format!(
                "payload of {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        Ok(Self { command, payload })
    }

    /// A frame without payload
    pub fn empty(command: u8) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    /// Checksum over command, length and payload
    pub fn checksum(&self) -> u8 {
        checksum(&self.payload) ^ self.command ^ self.payload.len() as u8
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.push(FRAME_HEAD);
        bytes.push(self.command);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes.push(self.checksum());
        bytes.push(FRAME_TAIL);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Total size of the frame starting at `data[0]`, once its length byte is known
    pub fn expected_len(data: &[u8]) -> Option<usize> {
        data.get(2).map(|len| *len as usize + FRAME_OVERHEAD)
    }

    /// Decode a frame from raw bytes. Bytes after the tail are ignored.
    ///
    /// With [`ChecksumPolicy::Lenient`] only the header and payload have to be
    /// present; checksum and tail are neither required nor checked.
    pub fn from_bytes(data: &[u8], policy: ChecksumPolicy) -> Result<Self, ProtocolError> {
        if data.len() < 3 {
            return Err(ProtocolError::malformed(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != FRAME_HEAD {
            return Err(ProtocolError::malformed(format!(
                "bad head byte {:#04x}",
                data[0]
            )));
        }

        let len = data[2] as usize;
        let body_end = 3 + len;
        let required = match policy {
            ChecksumPolicy::Enforce => body_end + 2,
            ChecksumPolicy::Lenient => body_end,
        };
        if data.len() < required {
            return Err(ProtocolError::malformed(format!(
                "truncated frame: length byte says {} payload bytes, got {} bytes total",
                len,
                data.len()
            )));
        }

        if policy == ChecksumPolicy::Enforce {
            let expected = checksum(&data[1..body_end]);
            let actual = data[body_end];
            if expected != actual {
                return Err(ProtocolError::malformed(format!(
                    "checksum mismatch: expected {:#04x}, got {:#04x}",
                    expected, actual
                )));
            }
            if data[body_end + 1] != FRAME_TAIL {
                return Err(ProtocolError::malformed(format!(
                    "bad tail byte {:#04x}",
                    data[body_end + 1]
                )));
            }
        }

        Ok(Self {
            command: data[1],
            payload: data[3..body_end].to_vec(),
        })
    }
}

/// Builder for constructing frames
pub struct FrameBuilder {
    command: u8,
    payload: Vec<u8>,
}

impl FrameBuilder {
    /// Create a new frame builder
    pub fn new() -> Self {
        Self {
            command: 0,
            payload: Vec::new(),
        }
    }

    /// Set the command byte
    pub fn command(mut self, cmd: u8) -> Self {
        self.command = cmd;
        self
    }

    /// Add a single payload byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add raw payload bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the frame
    pub fn build(self) -> Result<Frame, ProtocolError> {
        Frame::new(self.command, self.payload)
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}
