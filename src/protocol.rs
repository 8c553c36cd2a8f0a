//! Register map and data types of the PZEM-004T (v3) power meter.
//!
//! The module talks Modbus RTU. All measurements live in ten consecutive input
//! registers starting at `0x0000` and are fetched with a single
//! read-input-registers request. Multi-register quantities are stored high word
//! first. The slave address is kept in holding register `0x0002`. Resetting the
//! energy counter uses the vendor function code `0x42`, which standard Modbus
//! clients cannot send, so its frame is built with [`crate::frame`].
//!
//! Every type in here is plain data: decoding and encoding never touch I/O.

use crate::frame;
use std::fmt;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Reason a frame failed validation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    /// Fewer bytes than the checksum needs.
    #[error("frame of {0} bytes is too short to carry a checksum")]
    TooShort(usize),
    /// Recomputed checksum differs from the received one.
    #[error("checksum mismatch, calculated {calculated:#06X} but received {received:#06X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
}

/// Errors of the protocol layer. None of them involve the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The register block does not have the expected number of words.
    #[error("Expected {expected} registers but got {actual}")]
    InvalidRegisterCount { expected: usize, actual: usize },

    /// A slave address outside of the assignable range.
    #[error(
        "The address value {0} is outside the valid assignable range of {min} to {max}",
        min = Address::MIN,
        max = Address::MAX
    )]
    InvalidAddress(u16),

    /// A frame with a missing or wrong checksum.
    #[error("Invalid frame: {0}")]
    InvalidFrame(FrameFault),
}

fn check_register_count(words: &[u16], expected: u16) -> Result<(), Error> {
    if words.len() != expected as usize {
        return Err(Error::InvalidRegisterCount {
            expected: expected as usize,
            actual: words.len(),
        });
    }
    Ok(())
}

/// Combines two registers where the lower address holds the high word.
fn u32_from_words(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Modbus slave address of a PZEM-004T (1 to 247).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u16", into = "u8"))]
pub struct Address(u8);

impl Address {
    /// Holding register storing the slave address.
    pub const ADDRESS: u16 = 0x0002;
    /// Number of registers of the slave address.
    pub const QUANTITY: u16 = 1;
    /// Smallest assignable address.
    pub const MIN: u8 = 1;
    /// Largest assignable address.
    pub const MAX: u8 = 247;

    /// Register value for a write-single-register request.
    pub fn encode_for_write_register(&self) -> u16 {
        self.0 as u16
    }
}

impl std::ops::Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for Address {
    /// Factory default address.
    fn default() -> Self {
        Self(0x01)
    }
}

impl TryFrom<u16> for Address {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if (Self::MIN as u16..=Self::MAX as u16).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(Error::InvalidAddress(value))
        }
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from(value as u16)
    }
}

impl From<Address> for u8 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// One reading of all electrical quantities.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Measurement {
    /// RMS voltage in volts.
    pub voltage: f64,
    /// RMS current in amperes.
    pub current: f64,
    /// Active power in watts.
    pub power: f64,
    /// Accumulated active energy in watt-hours.
    pub energy: u32,
    /// Line frequency in hertz.
    pub frequency: f64,
    /// Power factor, nominally 0.00 to 1.00.
    pub power_factor: f64,
}

impl Measurement {
    /// First input register of the measurement block.
    pub const ADDRESS: u16 = 0x0000;
    /// Number of input registers in the block. The last one is the alarm status,
    /// which is read along but left undecoded.
    pub const QUANTITY: u16 = 10;

    const VOLTAGE_SCALE: f64 = 10.0;
    const CURRENT_SCALE: f64 = 1000.0;
    const POWER_SCALE: f64 = 10.0;
    const FREQUENCY_SCALE: f64 = 10.0;
    const POWER_FACTOR_SCALE: f64 = 100.0;

    /// Decodes the register block returned by a read-input-registers request.
    ///
    /// Values are taken as-is; implausible magnitudes from a miswired sensor are
    /// not rejected.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRegisterCount`] unless exactly [`Self::QUANTITY`] words are given.
    pub fn decode_from_input_registers(words: &[u16]) -> Result<Self, Error> {
        check_register_count(words, Self::QUANTITY)?;
        Ok(Self {
            voltage: words[0] as f64 / Self::VOLTAGE_SCALE,
            current: u32_from_words(words[1], words[2]) as f64 / Self::CURRENT_SCALE,
            power: u32_from_words(words[3], words[4]) as f64 / Self::POWER_SCALE,
            energy: u32_from_words(words[5], words[6]),
            frequency: words[7] as f64 / Self::FREQUENCY_SCALE,
            power_factor: words[8] as f64 / Self::POWER_FACTOR_SCALE,
        })
    }

    /// True if every quantity reads zero.
    ///
    /// A sensor that lost mains power, or a reply picked up from the wrong device on a
    /// shared bus, reads like this. Pollers treat it as a failed read.
    pub fn is_all_zero(&self) -> bool {
        self.voltage == 0.0
            && self.current == 0.0
            && self.power == 0.0
            && self.energy == 0
            && self.frequency == 0.0
            && self.power_factor == 0.0
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} V, {:.3} A, {:.1} W, {} Wh, {:.1} Hz, PF {:.2}",
            self.voltage,
            self.current,
            self.power,
            self.energy,
            self.frequency,
            self.power_factor
        )
    }
}

/// The vendor specific "reset energy" command.
#[derive(Debug, Clone, Copy)]
pub struct ResetEnergy;

impl ResetEnergy {
    /// Vendor function code.
    pub const FUNCTION_CODE: u8 = 0x42;
    /// Function code of an error reply (`0x42 | 0x80`).
    pub const ERROR_FUNCTION_CODE: u8 = Self::FUNCTION_CODE | 0x80;
    /// Length of the request frame, which is also the length of the normal reply.
    pub const FRAME_LENGTH: usize = 4;
    /// An error reply carries one extra abort code byte.
    pub const ERROR_REPLY_LENGTH: usize = 5;

    /// Builds the request frame `[address, 0x42, crc_lo, crc_hi]`.
    pub fn encode_request(address: Address) -> Vec<u8> {
        frame::build_frame(&frame::command_payload(*address, Self::FUNCTION_CODE, &[]))
    }
}

/// Whatever the device sent back after a reset energy request.
///
/// This is diagnostic information only. Depending on the firmware the device echoes
/// the request, sends an error reply or stays silent, so a received reply does not
/// prove that the counter was cleared.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResetEnergyResponse {
    raw: Vec<u8>,
}

impl ResetEnergyResponse {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    /// The received bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Nothing was received before the timeout.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The received bytes form a frame with a correct checksum.
    pub fn has_valid_crc(&self) -> bool {
        frame::is_valid_frame(&self.raw)
    }

    /// The device echoed the request frame sent to `address`.
    pub fn is_echo_of(&self, address: Address) -> bool {
        self.raw == ResetEnergy::encode_request(address)
    }

    /// The device answered with the error function code.
    pub fn is_error_reply(&self) -> bool {
        self.raw.get(1) == Some(&ResetEnergy::ERROR_FUNCTION_CODE)
    }
}

impl fmt::Display for ResetEnergyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            return write!(f, "<no response>");
        }
        for (i, byte) in self.raw.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn decode_known_vector() {
        let m = Measurement::decode_from_input_registers(&[
            2200, 0, 1000, 0, 5000, 0, 1234, 500, 95, 0,
        ])
        .unwrap();
        assert_eq!(m.voltage, 220.0);
        assert_eq!(m.current, 1.0);
        assert_eq!(m.power, 500.0);
        assert_eq!(m.energy, 1234);
        assert_eq!(m.frequency, 50.0);
        assert_eq!(m.power_factor, 0.95);
    }

    #[test]
    fn decode_low_word_of_current() {
        let m = Measurement::decode_from_input_registers(&[0, 0, 1, 0, 0, 0, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(m.current, 0.001);
        assert_eq!(m.power, 0.0);
    }

    #[test]
    fn decode_high_word_first() {
        let m = Measurement::decode_from_input_registers(&[
            0, 0x0001, 0x0002, 0x0001, 0x0000, 0x0001, 0x86A0, 0, 0, 0,
        ])
        .unwrap();
        // 0x0001_0002 = 65538
        assert_eq!(m.current, 65.538);
        // 0x0001_0000 = 65536
        assert_eq!(m.power, 6553.6);
        // 0x0001_86A0 = 100000
        assert_eq!(m.energy, 100_000);
    }

    #[test]
    fn decode_maximum_values() {
        let m = Measurement::decode_from_input_registers(&[u16::MAX; 10]).unwrap();
        assert_eq!(m.voltage, 6553.5);
        assert_eq!(m.current, u32::MAX as f64 / 1000.0);
        assert_eq!(m.energy, u32::MAX);
        assert_eq!(m.power_factor, 655.35);
    }

    #[test]
    fn decode_ignores_alarm_register() {
        let mut words = [2301, 0, 250, 0, 575, 0, 42, 499, 100, 0];
        let quiet = Measurement::decode_from_input_registers(&words).unwrap();
        words[9] = 0xFFFF;
        let alarmed = Measurement::decode_from_input_registers(&words).unwrap();
        assert_eq!(quiet, alarmed);
    }

    #[test]
    fn decode_wrong_register_count() {
        for len in [0usize, 1, 9, 11, 20] {
            let words = vec![0u16; len];
            assert_matches!(
                Measurement::decode_from_input_registers(&words),
                Err(Error::InvalidRegisterCount { expected: 10, actual }) if actual == len
            );
        }
    }

    #[test]
    fn all_zero_measurement() {
        let zero = Measurement::decode_from_input_registers(&[0; 10]).unwrap();
        assert!(zero.is_all_zero());
        let energy_only =
            Measurement::decode_from_input_registers(&[0, 0, 0, 0, 0, 0, 1, 0, 0, 0]).unwrap();
        assert!(!energy_only.is_all_zero());
    }

    #[test]
    fn measurement_display() {
        let m = Measurement::decode_from_input_registers(&[
            2200, 0, 1000, 0, 5000, 0, 1234, 500, 95, 0,
        ])
        .unwrap();
        assert_eq!(
            m.to_string(),
            "220.0 V, 1.000 A, 500.0 W, 1234 Wh, 50.0 Hz, PF 0.95"
        );
    }

    #[test]
    fn address_range() {
        assert_matches!(Address::try_from(0u16), Err(Error::InvalidAddress(0)));
        assert_matches!(Address::try_from(248u16), Err(Error::InvalidAddress(248)));
        assert_matches!(Address::try_from(300u16), Err(Error::InvalidAddress(300)));
        assert_matches!(Address::try_from(255u8), Err(Error::InvalidAddress(255)));
        assert_eq!(*Address::try_from(1u16).unwrap(), 1);
        assert_eq!(*Address::try_from(1u8).unwrap(), 1);
        assert_eq!(*Address::try_from(247u16).unwrap(), 247);
    }

    #[test]
    fn address_encoding() {
        let address = Address::try_from(0xA5u8).unwrap();
        assert_eq!(address.encode_for_write_register(), 0x00A5);
        assert_eq!(address.to_string(), "0xa5");
        assert_eq!(Address::default().to_string(), "0x01");
        assert_eq!(
            Error::InvalidAddress(0).to_string(),
            "The address value 0 is outside the valid assignable range of 1 to 247"
        );
    }

    #[test]
    fn reset_energy_request() {
        assert_eq!(
            ResetEnergy::encode_request(Address::default()),
            [0x01, 0x42, 0x80, 0x11]
        );
        let request = ResetEnergy::encode_request(Address::try_from(0xA5u8).unwrap());
        assert_eq!(request, [0xA5, 0x42, 0xFA, 0xD1]);
        assert_eq!(request.len(), ResetEnergy::FRAME_LENGTH);
    }

    #[test]
    fn reset_energy_response_diagnostics() {
        let address = Address::default();

        let silent = ResetEnergyResponse::default();
        assert!(silent.is_empty());
        assert!(!silent.has_valid_crc());
        assert_eq!(silent.to_string(), "<no response>");

        let echo = ResetEnergyResponse::new(vec![0x01, 0x42, 0x80, 0x11]);
        assert!(echo.is_echo_of(address));
        assert!(echo.has_valid_crc());
        assert!(!echo.is_error_reply());
        assert_eq!(echo.to_string(), "01 42 80 11");

        let error = ResetEnergyResponse::new(frame::build_frame(&[0x01, 0xC2, 0x04]));
        assert!(error.is_error_reply());
        assert!(error.has_valid_crc());
        assert!(!error.is_echo_of(address));

        let garbled = ResetEnergyResponse::new(vec![0x01, 0x42, 0x80]);
        assert!(!garbled.has_valid_crc());
        assert!(!garbled.is_echo_of(address));
    }
}
