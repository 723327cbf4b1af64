//! MODBUS RTU style framing used over the BLE link.
//!
//! ```text
//! request   [addr][func][startHi][startLo][cntHi][cntLo][crcLo][crcHi]
//! response  [addr][func][byteCount][payload...][crcLo][crcHi]
//! exception [addr][func|0x80][code][crcLo][crcHi]
//! ```
//!
//! Register addresses and counts are big-endian, the CRC is MODBUS CRC-16 sent low byte first.

use crate::error::DecodeError;
use crate::registers::RegisterValues;
use crc16::{State, MODBUS};
use serde::{Deserialize, Serialize};

/// Unit address of the power station on the link.
pub const DEVICE_ADDRESS: u8 = 0x01;

pub const REQUEST_LENGTH: usize = 8;

/// The one byte count field caps a response at this many registers.
pub const MAX_RESPONSE_REGISTERS: usize = 127;

// address + function + one byte + crc, the size of an exception response
const MIN_FRAME_LENGTH: usize = 5;
const CRC_LENGTH: usize = 2;
const ERROR_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
}

impl TryFrom<u8> for FunctionCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            other => Err(DecodeError::Unsupported(other)),
        }
    }
}

/// Compute the MODBUS CRC-16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

fn append_crc(buffer: &mut Vec<u8>) {
    let crc = crc16(buffer);
    buffer.extend_from_slice(&crc.to_le_bytes());
}

fn validate_len(buffer: &[u8], min_size: usize) -> Result<(), DecodeError> {
    if buffer.len() < min_size {
        log::warn!(
            "Invalid frame size - required={} received={}",
            min_size,
            buffer.len()
        );
        return Err(DecodeError::Truncated);
    }
    Ok(())
}

fn validate_checksum(buffer: &[u8]) -> Result<u16, DecodeError> {
    let (body, tail) = buffer.split_at(buffer.len() - CRC_LENGTH);
    let calculated = crc16(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:04X} received={:04X} buffer={:02X?}",
            calculated,
            received,
            buffer
        );
        return Err(DecodeError::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(received)
}

/// One read command: which registers to fetch and with which function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub function: FunctionCode,
    pub start_register: u16,
    pub register_count: u16,
}

impl CommandDescriptor {
    /// # Panics
    ///
    /// If `register_count` is zero.
    pub fn new(function: FunctionCode, start_register: u16, register_count: u16) -> Self {
        assert!(register_count >= 1, "a read must cover at least one register");
        Self {
            function,
            start_register,
            register_count,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_LENGTH] {
        encode(self.function, self.start_register, self.register_count)
    }

    /// Parse an 8 byte request frame, as a device would on receipt.
    pub fn decode_request(buffer: &[u8]) -> Result<Self, DecodeError> {
        validate_len(buffer, REQUEST_LENGTH)?;
        let buffer = &buffer[..REQUEST_LENGTH];
        validate_checksum(buffer)?;
        let function = FunctionCode::try_from(buffer[1])?;
        let register_count = u16::from_be_bytes([buffer[4], buffer[5]]);
        if register_count == 0 {
            log::warn!("Request without registers: {buffer:02X?}");
            return Err(DecodeError::EmptyRead);
        }
        Ok(Self {
            function,
            start_register: u16::from_be_bytes([buffer[2], buffer[3]]),
            register_count,
        })
    }
}

/// Build a request frame.
///
/// # Panics
///
/// If `register_count` is zero.
pub fn encode(
    function: FunctionCode,
    start_register: u16,
    register_count: u16,
) -> [u8; REQUEST_LENGTH] {
    assert!(register_count >= 1, "a read must cover at least one register");
    let start = start_register.to_be_bytes();
    let count = register_count.to_be_bytes();
    let mut tx_buffer = [
        DEVICE_ADDRESS,
        function as u8,
        start[0],
        start[1],
        count[0],
        count[1],
        0,
        0,
    ];
    let crc = crc16(&tx_buffer[..REQUEST_LENGTH - CRC_LENGTH]).to_le_bytes();
    tx_buffer[6] = crc[0];
    tx_buffer[7] = crc[1];
    tx_buffer
}

/// A validated response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub function: FunctionCode,
    pub payload: Vec<u8>,
    pub checksum: u16,
}

/// Validate a response frame and split out its payload.
///
/// The CRC is checked before anything else, so an exception response is only reported
/// as [`DecodeError::DeviceError`] when it arrived intact.
pub fn decode(rx_buffer: &[u8]) -> Result<Frame, DecodeError> {
    validate_len(rx_buffer, MIN_FRAME_LENGTH)?;
    let checksum = validate_checksum(rx_buffer)?;

    let raw_function = rx_buffer[1];
    if raw_function & ERROR_FLAG != 0 {
        log::debug!(
            "Exception response - function={:02X} code={:02X}",
            raw_function & !ERROR_FLAG,
            rx_buffer[2]
        );
        return Err(DecodeError::DeviceError(rx_buffer[2]));
    }
    let function = FunctionCode::try_from(raw_function)?;

    let byte_count = usize::from(rx_buffer[2]);
    let body_end = rx_buffer.len() - CRC_LENGTH;
    validate_len(&rx_buffer[..body_end], 3 + byte_count)?;
    if body_end > 3 + byte_count {
        log::debug!(
            "Ignoring {} bytes after the announced payload",
            body_end - 3 - byte_count
        );
    }

    Ok(Frame {
        address: rx_buffer[0],
        function,
        payload: rx_buffer[3..3 + byte_count].to_vec(),
        checksum,
    })
}

/// Decode a response and interpret its payload as registers starting at `start_register`.
pub fn decode_registers(
    rx_buffer: &[u8],
    start_register: u16,
) -> Result<RegisterValues, DecodeError> {
    let frame = decode(rx_buffer)?;
    Ok(RegisterValues::decode(start_register, &frame.payload))
}

/// Build a successful read response carrying `words`, as a device would send it.
///
/// # Panics
///
/// If there are more than [`MAX_RESPONSE_REGISTERS`] words.
pub fn encode_response(function: FunctionCode, words: &[u16]) -> Vec<u8> {
    assert!(
        words.len() <= MAX_RESPONSE_REGISTERS,
        "a response carries at most {MAX_RESPONSE_REGISTERS} registers"
    );
    let mut buffer = Vec::with_capacity(3 + words.len() * 2 + CRC_LENGTH);
    buffer.push(DEVICE_ADDRESS);
    buffer.push(function as u8);
    buffer.push((words.len() * 2) as u8);
    for word in words {
        buffer.extend_from_slice(&word.to_be_bytes());
    }
    append_crc(&mut buffer);
    buffer
}

/// Build an exception response for `function` with the given exception code.
pub fn encode_exception(function: FunctionCode, code: u8) -> Vec<u8> {
    let mut buffer = vec![DEVICE_ADDRESS, function as u8 | ERROR_FLAG, code];
    append_crc(&mut buffer);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        let payload = [
            0x01, 0x03, 0x18, 0x24, 0x0c, 0x00, 0x00, 0x02, 0xa7, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(crc16(&payload), 0x90bc);
    }

    #[test]
    fn test_crc_matches_bitwise_reference() {
        fn reference(data: &[u8]) -> u16 {
            let mut crc: u16 = 0xFFFF;
            for b in data {
                crc ^= u16::from(*b);
                for _ in 0..8 {
                    crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
                }
            }
            crc
        }
        let samples: [&[u8]; 4] = [
            &[],
            &[0x01, 0x03, 0x01, 0x00, 0x00, 0x01],
            &[0xff; 17],
            &[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0],
        ];
        for sample in samples {
            assert_eq!(crc16(sample), reference(sample), "{sample:02X?}");
        }
    }

    #[test]
    fn test_encode_battery_request() {
        assert_eq!(
            encode(FunctionCode::ReadHoldingRegisters, 0x0100, 1),
            [0x01, 0x03, 0x01, 0x00, 0x00, 0x01, 0x85, 0xf6]
        );
    }

    #[test]
    fn test_encode_input_registers() {
        let frame = encode(FunctionCode::ReadInputRegisters, 0x0201, 2);
        assert_eq!(&frame[..6], &[0x01, 0x04, 0x02, 0x01, 0x00, 0x02]);
        assert_eq!(crc16(&frame[..6]).to_le_bytes(), [frame[6], frame[7]]);
    }

    #[test]
    #[should_panic]
    fn test_encode_zero_registers() {
        encode(FunctionCode::ReadHoldingRegisters, 0x0100, 0);
    }

    #[test]
    fn test_decode_request_without_registers() {
        let mut frame = vec![0x01, 0x03, 0x01, 0x00, 0x00, 0x00];
        append_crc(&mut frame);
        assert_eq!(
            CommandDescriptor::decode_request(&frame),
            Err(DecodeError::EmptyRead)
        );
    }

    #[test]
    fn test_encode_largest_response() {
        let words = [0x1234; MAX_RESPONSE_REGISTERS];
        let frame = encode_response(FunctionCode::ReadHoldingRegisters, &words);
        assert_eq!(frame[2], 254);
        assert_eq!(decode(&frame).unwrap().payload.len(), 254);
    }

    #[test]
    #[should_panic]
    fn test_encode_oversized_response() {
        encode_response(FunctionCode::ReadHoldingRegisters, &[0; 128]);
    }

    #[test]
    fn test_request_round_trip() {
        for (function, start, count) in [
            (FunctionCode::ReadHoldingRegisters, 0x0100, 1),
            (FunctionCode::ReadHoldingRegisters, 0x0101, 3),
            (FunctionCode::ReadInputRegisters, 0xfffe, 0x7d),
        ] {
            let frame = encode(function, start, count);
            let request = CommandDescriptor::decode_request(&frame).unwrap();
            assert_eq!(request, CommandDescriptor::new(function, start, count));
        }
    }

    #[test]
    fn test_decode_battery_response() {
        let rx = [0x01, 0x03, 0x02, 0x00, 0x4b, 0xf8, 0x73];
        let frame = decode(&rx).unwrap();
        assert_eq!(frame.address, DEVICE_ADDRESS);
        assert_eq!(frame.function, FunctionCode::ReadHoldingRegisters);
        assert_eq!(frame.payload, vec![0x00, 0x4b]);
        assert_eq!(frame.checksum, 0x73f8);

        let values = decode_registers(&rx, 0x0100).unwrap();
        assert_eq!(values.battery_level, Some(75));
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(decode(&[0x01, 0x03, 0x02, 0x00]), Err(DecodeError::Truncated));
        assert_eq!(decode(&[]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_byte_count_past_end() {
        // announces 4 bytes but carries 2, with a valid crc over what is there
        let mut rx = vec![0x01, 0x03, 0x04, 0x00, 0x4b];
        append_crc(&mut rx);
        assert_eq!(decode(&rx), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_corrupted_payload() {
        let rx = [0x01, 0x03, 0x02, 0x00, 0x4c, 0xf8, 0x73];
        assert!(matches!(
            decode(&rx),
            Err(DecodeError::ChecksumMismatch {
                received: 0x73f8,
                ..
            })
        ));
    }

    #[test]
    fn test_every_single_bit_flip_is_detected() {
        let valid = encode_response(FunctionCode::ReadHoldingRegisters, &[75, 1200, 300, 1]);
        assert!(decode(&valid).is_ok());
        for byte in 0..valid.len() {
            for bit in 0..8 {
                let mut corrupted = valid.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    matches!(decode(&corrupted), Err(DecodeError::ChecksumMismatch { .. })),
                    "flip of bit {bit} in byte {byte} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn test_decode_exception() {
        let rx = encode_exception(FunctionCode::ReadHoldingRegisters, 0x02);
        assert_eq!(rx, vec![0x01, 0x83, 0x02, 0xc0, 0xf1]);
        assert_eq!(decode(&rx), Err(DecodeError::DeviceError(0x02)));
    }

    #[test]
    fn test_decode_exception_needs_valid_crc() {
        let rx = [0x01, 0x83, 0x02, 0xc0, 0xf2];
        assert!(matches!(decode(&rx), Err(DecodeError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_decode_unsupported_function() {
        let mut rx = vec![0x01, 0x06, 0x02, 0x00, 0x01];
        append_crc(&mut rx);
        assert_eq!(decode(&rx), Err(DecodeError::Unsupported(0x06)));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes_inside_crc() {
        let mut rx = vec![0x01, 0x04, 0x02, 0x00, 0x01, 0xaa];
        append_crc(&mut rx);
        let frame = decode(&rx).unwrap();
        assert_eq!(frame.function, FunctionCode::ReadInputRegisters);
        assert_eq!(frame.payload, vec![0x00, 0x01]);
    }

    #[test]
    fn test_function_code_from_byte() {
        assert_eq!(FunctionCode::try_from(0x03), Ok(FunctionCode::ReadHoldingRegisters));
        assert_eq!(FunctionCode::try_from(0x04), Ok(FunctionCode::ReadInputRegisters));
        assert_eq!(FunctionCode::try_from(0x83), Err(DecodeError::Unsupported(0x83)));
    }
}
