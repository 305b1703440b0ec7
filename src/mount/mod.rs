//
// brexos2pmc8 - PMC8 protocol bridge for the Bresser EXOS-2 GoTo mount
// Copyright (c) 2024 the brexos2pmc8 developers
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Telescope mount module.
//!

pub mod codec;
pub mod engine;
#[cfg(test)]
pub mod mock;

pub use engine::{AxisState, Brexos2};

#[derive(Copy, Clone, Debug, PartialEq, strum_macros::EnumIter)]
pub enum Axis { RA, Dec }

impl Axis {
    pub fn as_index(&self) -> usize {
        match self {
            Axis::RA => 0,
            Axis::Dec => 1
        }
    }

    pub fn as_u8(&self) -> u8 {
        self.as_index() as u8
    }
}

#[derive(Debug)]
pub enum MountError {
    SerialPort(serialport::Error),
    IO(std::io::Error),
    /// Response does not start with a valid frame header, or its declared
    /// length exceeds the read buffer.
    InvalidFrame,
    /// Well-formed frame whose payload is not what the command expects.
    UnexpectedResponse,
    /// Engine mutex was poisoned by a panicking thread.
    Lock,
    /// Free slewing rejected: the axis is not in free-run slew mode
    /// (a goto is running, or the motors have only just been enabled).
    NotSlewing,
    /// The axis is not idle; the request was recorded but no motor command
    /// was issued.
    Busy
}

impl From<std::io::Error> for MountError {
    fn from(e: std::io::Error) -> MountError {
        MountError::IO(e)
    }
}

impl From<serialport::Error> for MountError {
    fn from(e: serialport::Error) -> MountError {
        MountError::SerialPort(e)
    }
}

/// Opens the serial device and creates a mount engine on it.
///
/// # Parameters
///
/// * `device` - System device name the mount is attached to,
///     e.g., "/dev/ttyUSB0" on Linux.
///
/// The manager task is not running yet; call `start_manager` on the result.
///
#[must_use]
pub fn connect(device: &str) -> Result<Brexos2<Box<dyn serialport::SerialPort>>, MountError> {
    let port = serialport::new(device, 9600)
        .data_bits(serialport::DataBits::Eight)
        .flow_control(serialport::FlowControl::None)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(std::time::Duration::from_millis(500))
        .open()?;

    Brexos2::new(port)
}
