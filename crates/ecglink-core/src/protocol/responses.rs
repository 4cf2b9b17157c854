//! Serial number and version payloads

use super::{
    ChecksumPolicy, Command, Frame, FrameBuilder, ProtocolError, FRAME_HEAD, SN_SUB_HEADER_LEN,
    SN_XOR_KEY,
};

/// Encode a write-SN request. Blank serial numbers are rejected.
pub fn pack_write_sn(sn: &str) -> Result<Vec<u8>, ProtocolError> {
    if sn.trim().is_empty() {
        return Err(ProtocolError::InvalidInput(
            "serial number must not be blank".to_string(),
        ));
    }
    let frame = FrameBuilder::new()
        .command(Command::WriteSn.byte())
        .bytes(sn.as_bytes())
        .build()?;
    Ok(frame.to_bytes())
}

/// Decode a read-SN response with checksum verification
pub fn parse_sn(bytes: &[u8]) -> Result<String, ProtocolError> {
    parse_sn_with(bytes, ChecksumPolicy::Enforce)
}

/// Decode a read-SN response.
///
/// The payload starts with a 4-byte sub-header; every byte after it is XORed
/// with [`SN_XOR_KEY`] on the wire.
pub fn parse_sn_with(bytes: &[u8], policy: ChecksumPolicy) -> Result<String, ProtocolError> {
    if bytes.len() < 5 {
        return Err(ProtocolError::malformed(format!(
            "SN response too short: {} bytes",
            bytes.len()
        )));
    }
    expect_header(bytes, Command::ReadSn)?;

    let frame = Frame::from_bytes(bytes, policy)?;
    if frame.payload.len() < SN_SUB_HEADER_LEN {
        return Err(ProtocolError::malformed(format!(
            "SN payload of {} bytes is shorter than its sub-header",
            frame.payload.len()
        )));
    }

    let plain: Vec<u8> = frame.payload[SN_SUB_HEADER_LEN..]
        .iter()
        .map(|b| b ^ SN_XOR_KEY)
        .collect();
    String::from_utf8(plain)
        .map_err(|e| ProtocolError::malformed(format!("SN is not valid UTF-8: {}", e)))
}

/// Decode a read-version response with checksum verification
pub fn parse_version(bytes: &[u8]) -> Result<String, ProtocolError> {
    parse_version_with(bytes, ChecksumPolicy::Enforce)
}

/// Decode a read-version response. The payload is plain UTF-8.
pub fn parse_version_with(bytes: &[u8], policy: ChecksumPolicy) -> Result<String, ProtocolError> {
    if bytes.len() < 3 {
        return Err(ProtocolError::malformed(format!(
            "version response too short: {} bytes",
            bytes.len()
        )));
    }
    expect_header(bytes, Command::ReadVersion)?;

    let frame = Frame::from_bytes(bytes, policy)?;
    String::from_utf8(frame.payload)
        .map_err(|e| ProtocolError::malformed(format!("version is not valid UTF-8: {}", e)))
}

fn expect_header(bytes: &[u8], command: Command) -> Result<(), ProtocolError> {
    if bytes[0] != FRAME_HEAD || bytes[1] != command.byte() {
        return Err(ProtocolError::malformed(format!(
            "expected header {:02X} {:02X}, got {:02X} {:02X}",
            FRAME_HEAD,
            command.byte(),
            bytes[0],
            bytes[1]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::checksum;
    use pretty_assertions::assert_eq;

    /// Read-SN response captured from a Gen3 monitor
    const SN_RESPONSE: [u8; 26] = [
        0xA5, 0x06, 0x15, 0x43, 0x31, 0x32, 0x20, 0x52, 0x20, 0x23, 0x23, 0x21, 0x23, 0x22, 0x21,
        0x22, 0x21, 0x25, 0x21, 0x21, 0x21, 0x21, 0x21, 0x21, 0x26, 0x5A,
    ];

    fn sn_response(sn: &str) -> Vec<u8> {
        let mut payload = vec![0x43, 0x31, 0x32, 0x20];
        payload.extend(sn.bytes().map(|b| b ^ SN_XOR_KEY));
        Frame::new(Command::ReadSn.byte(), payload).unwrap().to_bytes()
    }

    #[test]
    fn test_parse_captured_sn() {
        assert_eq!(parse_sn(&SN_RESPONSE).unwrap(), "C1220230304000000");
    }

    #[test]
    fn test_sn_roundtrip() {
        for sn in ["A", "C1220230304000000", "sn-with-ü", "  padded  "] {
            assert_eq!(parse_sn(&sn_response(sn)).unwrap(), sn);
        }
    }

    #[test]
    fn test_parse_sn_rejects_short_and_wrong_header() {
        assert!(parse_sn(&[]).unwrap_err().is_malformed());
        assert!(parse_sn(&[0xA5, 0x06, 0x00, 0x06]).unwrap_err().is_malformed());

        let mut wrong = SN_RESPONSE;
        wrong[1] = 0x05;
        assert!(parse_sn(&wrong).unwrap_err().is_malformed());
    }

    #[test]
    fn test_parse_sn_checksum_policy() {
        let mut corrupt = SN_RESPONSE;
        corrupt[24] = 0x00;
        assert!(parse_sn(&corrupt).is_err());
        assert_eq!(
            parse_sn_with(&corrupt, ChecksumPolicy::Lenient).unwrap(),
            "C1220230304000000"
        );
    }

    #[test]
    fn test_parse_version() {
        let bytes = Frame::new(0x05, b"V2.3.1".to_vec()).unwrap().to_bytes();
        assert_eq!(parse_version(&bytes).unwrap(), "V2.3.1");
        assert!(parse_version(&[0x00]).unwrap_err().is_malformed());
        assert!(parse_version(&[0xA5, 0x06, 0x00, 0x06, 0x5A]).is_err());
    }

    #[test]
    fn test_pack_write_sn() {
        let bytes = pack_write_sn("C12").unwrap();
        assert_eq!(&bytes[..6], &[0xA5, 0x02, 0x03, b'C', b'1', b'2']);
        assert_eq!(bytes[6], checksum(&bytes[1..6]));
        assert_eq!(bytes[7], 0x5A);
    }

    #[test]
    fn test_pack_write_sn_checksum_property() {
        for sn in ["X", "C1220230304000000", "0123456789abcdef0123456789", "序列号"] {
            let bytes = pack_write_sn(sn).unwrap();
            let len = sn.len();
            assert_eq!(bytes[2] as usize, len);
            assert_eq!(bytes[3 + len], checksum(&bytes[1..3 + len]));
        }
    }

    #[test]
    fn test_pack_write_sn_rejects_blank() {
        for sn in ["", "   ", "\t\n"] {
            assert!(matches!(
                pack_write_sn(sn),
                Err(ProtocolError::InvalidInput(_))
            ));
        }
    }
}
