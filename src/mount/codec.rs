//
// brexos2pmc8 - PMC8 protocol bridge for the Bresser EXOS-2 GoTo mount
// Copyright (c) 2024 the brexos2pmc8 developers
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Binary frame codec of the mount's serial protocol.
//!
//! Every command and every response is framed as `55 AA 01 <len> <payload>`;
//! multi-byte integers are big-endian, encoder counts are 24-bit signed.
//!

use crate::mount::{Axis, MountError};
use std::io::Read;

pub const HEADER: [u8; 3] = [0x55, 0xaa, 0x01];

/// No valid frame exceeds this.
pub const MAX_FRAME_LEN: usize = 16;

mod opcode {
    /// Low 5 bits of the command discriminator; the axis index occupies the high 3.
    pub const SLEW: u8 = 1;
    pub const GOTO: u8 = 2;
    pub const INQUIRY: u8 = 4;
}

pub fn enable_motors(enable: bool) -> [u8; 5] {
    [0x55, 0xaa, 0x01, 0x01, if enable { 0xff } else { 0x00 }]
}

pub fn inquiry(axis: Axis) -> [u8; 5] {
    [0x55, 0xaa, 0x01, 0x01, axis.as_u8() << 5 | opcode::INQUIRY]
}

pub fn slew(axis: Axis, direction: u8, rate: u16) -> [u8; 8] {
    [
        0x55, 0xaa, 0x01, 0x04,
        axis.as_u8() << 5 | opcode::SLEW,
        direction,
        (rate >> 8) as u8, rate as u8
    ]
}

pub fn go_to(axis: Axis, rate: u16, target: u32) -> [u8; 10] {
    [
        0x55, 0xaa, 0x01, 0x06,
        axis.as_u8() << 5 | opcode::GOTO,
        (rate >> 8) as u8, rate as u8,
        (target >> 16) as u8, (target >> 8) as u8, target as u8
    ]
}

pub fn cmd_0f(param: u16) -> [u8; 7] {
    [0x55, 0xaa, 0x01, 0x03, 0x0f, (param >> 8) as u8, param as u8]
}

pub fn cmd_10() -> [u8; 5] {
    [0x55, 0xaa, 0x01, 0x01, 0x10]
}

/// Reads into `buf` until at least `min` bytes have arrived in total.
///
/// Returns the number of bytes read. Fails if any underlying read delivers
/// nothing (which is what a serial timeout looks like with a 0-min-char
/// port setup).
///
#[must_use]
pub fn read_at_least<T: Read>(src: &mut T, buf: &mut [u8], min: usize) -> Result<usize, MountError> {
    let mut num_read_total = 0;

    while num_read_total < min {
        let num_read = src.read(&mut buf[num_read_total..])?;
        if num_read == 0 {
            return Err(MountError::IO(std::io::ErrorKind::UnexpectedEof.into()));
        }
        num_read_total += num_read;
    }

    Ok(num_read_total)
}

/// Reads one framed response into `buf`; returns the frame length
/// (header + length byte + payload).
#[must_use]
pub fn read_response<T: Read>(src: &mut T, buf: &mut [u8; MAX_FRAME_LEN]) -> Result<usize, MountError> {
    let num_read = read_at_least(src, &mut buf[..], 4)?;

    if buf[0..3] != HEADER {
        return Err(MountError::InvalidFrame);
    }

    let frame_len = buf[3] as usize + 4;
    if frame_len > MAX_FRAME_LEN {
        return Err(MountError::InvalidFrame);
    }

    if frame_len > num_read {
        read_at_least(src, &mut buf[num_read..frame_len], frame_len - num_read)?;
    }

    Ok(frame_len)
}

/// Decodes an inquiry response: status byte and 24-bit signed encoder count.
#[must_use]
pub fn parse_inquiry(frame: &[u8]) -> Result<(u8, i32), MountError> {
    if frame.len() < 9 || frame[3] != 5 {
        return Err(MountError::UnexpectedResponse);
    }

    let status = frame[5];
    let mut count = (frame[6] as i8) as i32;
    count = count << 8 | frame[7] as i32;
    count = count << 8 | frame[8] as i32;

    Ok((status, count))
}

/// Decodes a cmd10 response: one big-endian 16-bit parameter.
#[must_use]
pub fn parse_cmd10(frame: &[u8]) -> Result<u16, MountError> {
    if frame.len() < 7 || frame[3] != 3 {
        return Err(MountError::UnexpectedResponse);
    }

    Ok((frame[5] as u16) << 8 | frame[6] as u16)
}
