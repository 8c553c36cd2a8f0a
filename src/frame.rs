//! Modbus RTU frame checksum helpers.
//!
//! Standard requests (read input registers, write single register) are framed by
//! `tokio-modbus`. Vendor commands such as the PZEM-004T energy reset are not, so
//! their frames are assembled here: the payload followed by the CRC-16 (Modbus
//! variant) in little endian byte order.
//!
//! ```
//! use pzem004t_lib::frame;
//!
//! let frame = frame::build_frame(&[0x01, 0x42]);
//! assert_eq!(frame, [0x01, 0x42, 0x80, 0x11]);
//! assert!(frame::is_valid_frame(&frame));
//! ```

use crate::protocol::{Error, FrameFault};

/// Initial register value of the Modbus CRC-16.
pub const CRC16_INIT: u16 = 0xFFFF;
/// Reflected generator polynomial of the Modbus CRC-16.
pub const CRC16_POLYNOMIAL: u16 = 0xA001;
/// Number of checksum bytes trailing every frame.
pub const CRC_LENGTH: usize = 2;

/// Calculates the Modbus CRC-16 over `data`.
///
/// Returns [`CRC16_INIT`] for an empty slice.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC16_POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Appends the checksum of `payload` (low byte first) and returns the frame.
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + CRC_LENGTH);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc16(payload).to_le_bytes());
    frame
}

/// Assembles a command payload `[address, function code, data...]`.
pub fn command_payload(address: u8, function_code: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + data.len());
    payload.push(address);
    payload.push(function_code);
    payload.extend_from_slice(data);
    payload
}

/// Checks the trailing checksum of a received frame.
///
/// # Errors
///
/// [`Error::InvalidFrame`] if the frame is shorter than the checksum itself or if the
/// checksum does not match the preceding bytes.
pub fn validate_frame(frame: &[u8]) -> Result<(), Error> {
    if frame.len() < CRC_LENGTH {
        return Err(Error::InvalidFrame(FrameFault::TooShort(frame.len())));
    }
    let (payload, checksum) = frame.split_at(frame.len() - CRC_LENGTH);
    let received = u16::from_le_bytes([checksum[0], checksum[1]]);
    let calculated = crc16(payload);
    if received != calculated {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} frame={frame:02X?}"
        );
        return Err(Error::InvalidFrame(FrameFault::ChecksumMismatch {
            calculated,
            received,
        }));
    }
    Ok(())
}

/// Boolean form of [`validate_frame`].
pub fn is_valid_frame(frame: &[u8]) -> bool {
    validate_frame(frame).is_ok()
}
