//
// brexos2pmc8 - PMC8 protocol bridge for the Bresser EXOS-2 GoTo mount
// Copyright (c) 2024 the brexos2pmc8 developers
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! PMC8 protocol server.
//!
//! Serves one TCP client at a time with the ASCII `ES…!` protocol, scaling
//! positions and rates between the client's step units and the mount's.
//! Unknown or malformed frames are dropped without a response.
//!

use crate::mount::{Axis, Brexos2};
use std::io::{Read, Write};

/// Mount encoder steps to client steps.
const STEP_RATIO: f64 = 48.0 / 38.0;

/// Client rate units to mount slew-rate units (applied together with `STEP_RATIO`).
const RATE_RATIO: f64 = 5.0 / 38.0;

const FIRMWARE_VERSION: &str = "ESGvES6B10A0!";

/// Rate requested with every goto; the actual motion rate is managed by the engine.
const GOTO_RATE: i32 = 128 * 5;

/// Client-side view of one axis.
struct ClientAxis {
    /// Slew direction applied to `ESSr` requests (1 = positive).
    direction: u8,
    /// Last commanded goto target (client steps).
    target: i32,
    /// Added to the scaled mount position to obtain the client position.
    offset: i32
}

impl Default for ClientAxis {
    fn default() -> ClientAxis {
        ClientAxis{ direction: 0, target: 0, offset: 0 }
    }
}

pub struct Pmc8Server<'a, T: Read + Write + Send + 'static> {
    mount: &'a Brexos2<T>,
    axes: [ClientAxis; 2]
}

/// Parses uppercase hex; any invalid digit reads as 0.
fn parse_uint(digits: &[u8]) -> u32 {
    let mut result = 0;

    for &digit in digits {
        let mut value = (digit as u32).wrapping_sub('0' as u32);

        if value > 9 {
            value = value.wrapping_sub('A' as u32 - '0' as u32 - 10);
            if value > 15 { value = 0; }
        }

        result = result << 4 | value;
    }

    result
}

fn sign_extend_24(value: u32) -> i32 {
    ((value << 8) as i32) >> 8
}

fn wire_axis(digit: u8) -> Option<Axis> {
    match digit {
        b'0' => Some(Axis::RA),
        b'1' => Some(Axis::Dec),
        _ => None
    }
}

/// The set-request echo: the received frame with the verb turned into a get.
fn echoed_as_get(message: &[u8]) -> Vec<u8> {
    let mut response = message.to_vec();
    response[2] = b'G';
    response
}

impl<'a, T: Read + Write + Send + 'static> Pmc8Server<'a, T> {
    pub fn new(mount: &'a Brexos2<T>) -> Pmc8Server<'a, T> {
        Pmc8Server{ mount, axes: [ClientAxis::default(), ClientAxis::default()] }
    }

    /// Accepts clients forever; serves one at a time.
    pub fn run(&mut self, port: u16) -> Result<(), std::io::Error> {
        let listener = std::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port))?;
        log::info!("PMC8 server listening on port {}", port);

        loop {
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    log::info!("client connected from {}", addr);
                    self.handle_client(&mut stream);
                    log::info!("client disconnected");
                },

                Err(e) => log::warn!("client connection failed: {}", e)
            }
        }
    }

    fn handle_client<S: Read + Write>(&mut self, stream: &mut S) {
        let mut buf = [0u8; 16];

        loop {
            let num_read = match stream.read(&mut buf) {
                Ok(n) => n,
                Err(_) => break
            };
            if num_read <= 4 { break; }

            if buf[0] != b'E' || buf[1] != b'S' || buf[num_read - 1] != b'!' { continue; }

            let response: Option<Vec<u8>> = match (buf[2], buf[3]) {
                (b'G', b'd') if num_read == 6 =>
                    wire_axis(buf[4]).map(|axis| self.axis_direction(axis)),

                (b'G', b'v') =>
                    Some(FIRMWARE_VERSION.as_bytes().to_vec()),

                (b'G', b'p') if num_read == 6 =>
                    wire_axis(buf[4]).and_then(|axis| self.axis_position(axis)),

                (b'G', b'r') if num_read == 6 =>
                    wire_axis(buf[4]).and_then(|axis| self.axis_rate(axis)),

                (b'P', b't') if num_read == 12 => {
                    if let Some(axis) = wire_axis(buf[4]) {
                        let target = sign_extend_24(parse_uint(&buf[5..11]));
                        self.go_to(axis, target);
                    }
                    Some(echoed_as_get(&buf[..num_read]))
                },

                (b'S', b'd') if num_read == 7 => {
                    if let Some(axis) = wire_axis(buf[4]) {
                        let direction = buf[5].wrapping_sub(b'0');
                        if direction <= 1 {
                            self.axes[axis.as_index()].direction = direction;
                        }
                    }
                    Some(echoed_as_get(&buf[..num_read]))
                },

                (b'S', b'p') if num_read == 12 => {
                    if let Some(axis) = wire_axis(buf[4]) {
                        let position = sign_extend_24(parse_uint(&buf[5..11]));
                        self.set_axis_position(axis, position);
                    }
                    Some(echoed_as_get(&buf[..num_read]))
                },

                (b'S', b'r') if num_read == 10 => {
                    if let Some(axis) = wire_axis(buf[4]) {
                        self.set_axis_slew_rate(axis, parse_uint(&buf[5..9]));
                    }
                    Some(echoed_as_get(&buf[..num_read]))
                },

                (b'T', b'r') if num_read == 9 => {
                    self.set_precision_tracking_rate(parse_uint(&buf[4..8]));
                    let mut response = echoed_as_get(&buf[..num_read]);
                    response[3] = b'x';
                    Some(response)
                },

                _ => None
            };

            if let Some(response) = response {
                if stream.write_all(&response).is_err() { break; }
            }
        }
    }

    fn axis_direction(&self, axis: Axis) -> Vec<u8> {
        format!("ESGd{}{:01X}!", axis.as_index(), self.axes[axis.as_index()].direction).into_bytes()
    }

    fn axis_position(&self, axis: Axis) -> Option<Vec<u8>> {
        let (_, count) = self.mount.inquiry(axis).ok()?;
        let client_count = (count as f64 * STEP_RATIO).round() as i32 + self.axes[axis.as_index()].offset;
        Some(format!("ESGp{}{:06X}!", axis.as_index(), client_count & 0xffffff).into_bytes())
    }

    fn axis_rate(&self, axis: Axis) -> Option<Vec<u8>> {
        let rate = self.mount.get_rate(axis).ok()?;
        let client_rate = (rate as f64 * STEP_RATIO).round() as i32;
        Some(format!("ESGr{}{:04X}!", axis.as_index(), client_rate.abs()).into_bytes())
    }

    /// Recalibrates the axis offset so that the current mount position reads
    /// as `position` in client steps.
    fn set_axis_position(&mut self, axis: Axis, position: i32) {
        log::debug!("axis {}: new position {:06X}", axis.as_index(), position & 0xffffff);

        if let Ok((_, count)) = self.mount.inquiry(axis) {
            let client_count = (count as f64 * STEP_RATIO).round() as i32;
            self.axes[axis.as_index()].offset = position - client_count;
        }
    }

    fn set_axis_slew_rate(&self, axis: Axis, rate: u32) {
        let mut slew_rate = (rate as f64 / STEP_RATIO * RATE_RATIO).round() as i32;
        if slew_rate > 4000 { slew_rate = 4000; }
        if self.axes[axis.as_index()].direction == 0 { slew_rate = -slew_rate; }

        log::debug!("axis {}: slew rate {}", axis.as_index(), slew_rate);
        let _ = self.mount.slew(axis, slew_rate);
    }

    fn set_precision_tracking_rate(&self, rate: u32) {
        let tracking_rate = (rate as f64 / 25.0 / STEP_RATIO * RATE_RATIO).round() as i32;
        log::debug!("tracking rate {:04X} -> {}", rate, tracking_rate);

        if tracking_rate >= 0 && tracking_rate < 10 {
            let _ = self.mount.slew(Axis::Dec, 0);
            let _ = self.mount.track(Axis::RA, tracking_rate);
        }
    }

    fn go_to(&mut self, axis: Axis, target: i32) {
        let axis_data = &mut self.axes[axis.as_index()];
        axis_data.target = target;
        let mount_target = ((axis_data.target - axis_data.offset) as f64 / STEP_RATIO).round() as i32;

        log::debug!("axis {}: goto target {:06X}", axis.as_index(), mount_target & 0xffffff);
        let _ = self.mount.go_to(axis, GOTO_RATE, mount_target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::engine::status;
    use crate::mount::mock::MockPort;
    use std::collections::VecDeque;

    const ACK: [u8; 4] = [0x55, 0xaa, 0x01, 0x00];

    fn inquiry_reply(axis: Axis, status: u8, count: i32) -> Vec<u8> {
        let count = count as u32;
        vec![
            0x55, 0xaa, 0x01, 0x05,
            axis.as_u8() << 5 | 4,
            status,
            (count >> 16) as u8, (count >> 8) as u8, count as u8
        ]
    }

    fn new_engine(port: &MockPort) -> Brexos2<MockPort> {
        port.push_response(&inquiry_reply(Axis::RA, status::DISABLED, 0));
        port.push_response(&inquiry_reply(Axis::Dec, status::DISABLED, 0));
        let engine = Brexos2::new(port.handle()).unwrap();
        port.take_written();
        engine
    }

    /// One client message per read; EOF once the queue drains.
    struct TestStream {
        messages: VecDeque<Vec<u8>>,
        output: Vec<u8>
    }

    impl TestStream {
        fn new(messages: &[&[u8]]) -> TestStream {
            TestStream{
                messages: messages.iter().map(|m| m.to_vec()).collect(),
                output: vec![]
            }
        }
    }

    impl std::io::Read for TestStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.messages.pop_front() {
                Some(message) => {
                    buf[..message.len()].copy_from_slice(&message);
                    Ok(message.len())
                },
                None => Ok(0)
            }
        }
    }

    impl std::io::Write for TestStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn hex_parse() {
        assert_eq!(0x0a50, parse_uint(b"0A50"));
        assert_eq!(0xffffff, parse_uint(b"FFFFFF"));
        assert_eq!(0, parse_uint(b"0000"));
        // lowercase and punctuation read as zero digits
        assert_eq!(0x0050, parse_uint(b"0a50"));
        assert_eq!(0x0120, parse_uint(b"/12 "));
    }

    #[test]
    fn hex_format_parse_round_trip() {
        for &value in &[0i32, 1, -1, -512, 0x7fffff, -0x800000, 0x123abc] {
            let formatted = format!("{:06X}", value & 0xffffff);
            assert_eq!(value & 0xffffff, parse_uint(formatted.as_bytes()) as i32);
            assert_eq!(value, sign_extend_24(parse_uint(formatted.as_bytes())));
        }
    }

    #[test]
    fn firmware_version_query() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        let mut stream = TestStream::new(&[b"ESGv!"]);
        server.handle_client(&mut stream);

        assert_eq!(b"ESGvES6B10A0!".to_vec(), stream.output);
    }

    #[test]
    fn direction_set_and_get() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        let mut stream = TestStream::new(&[b"ESSd11!", b"ESGd1!", b"ESGd0!"]);
        server.handle_client(&mut stream);

        assert_eq!(b"ESGd11!ESGd11!ESGd00!".to_vec(), stream.output);
    }

    #[test]
    fn position_set_then_get_round_trips_exactly() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        // set: mount reads 38 -> scaled 48 -> offset = 0x100 - 48
        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 38));
        // get: same mount position, the offset absorbs the ratio remainder
        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 38));

        let mut stream = TestStream::new(&[b"ESSp0000100!", b"ESGp0!"]);
        server.handle_client(&mut stream);

        assert_eq!(b"ESGp0000100!ESGp0000100!".to_vec(), stream.output);
    }

    #[test]
    fn negative_positions_wrap_to_24_bits() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 0));
        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 0));

        let mut stream = TestStream::new(&[b"ESSp0FFFF00!", b"ESGp0!"]);
        server.handle_client(&mut stream);

        assert_eq!(b"ESGp0FFFF00!ESGp0FFFF00!".to_vec(), stream.output);
    }

    #[test]
    fn slew_rate_is_scaled_and_signed_by_direction() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        // direction stays at the default (negative): 0x779 scales to -199
        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 0));
        port.push_response(&ACK);

        let mut stream = TestStream::new(&[b"ESSr00779!"]);
        server.handle_client(&mut stream);

        assert_eq!(b"ESGr00779!".to_vec(), stream.output);
        assert_eq!(-199, engine.axis_state(Axis::RA).unwrap().slew_rate);
        assert_eq!(-199, engine.axis_state(Axis::RA).unwrap().rate);
    }

    #[test]
    fn rate_query_reports_the_scaled_magnitude() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        // set a slew rate of -199, then read it back
        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 0));
        port.push_response(&ACK);
        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 0));

        let mut stream = TestStream::new(&[b"ESSr00779!", b"ESGr0!"]);
        server.handle_client(&mut stream);

        // round(-199 * 48/38) = -251 = -0xFB
        assert_eq!(b"ESGr00779!ESGr000FB!".to_vec(), stream.output);
    }

    #[test]
    fn tracking_request_stops_dec_and_tracks_ra() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        // 0x8CA / 240 = 9.375 -> 9; slew(Dec, 0), then track(RA, 9)
        port.push_response(&inquiry_reply(Axis::Dec, status::SLEWING, 0));
        port.push_response(&ACK);
        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 0));
        port.push_response(&ACK);

        let mut stream = TestStream::new(&[b"ESTr08CA!"]);
        server.handle_client(&mut stream);

        assert_eq!(b"ESGx08CA!".to_vec(), stream.output);
        assert_eq!(9, engine.axis_state(Axis::RA).unwrap().tracking_rate);
        assert_eq!(0, engine.axis_state(Axis::Dec).unwrap().rate);
    }

    #[test]
    fn overly_fast_tracking_request_is_ignored_but_echoed() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        // 0xA50 / 240 = 11: out of the precision-tracking range
        let mut stream = TestStream::new(&[b"ESTr0A50!"]);
        server.handle_client(&mut stream);

        assert_eq!(b"ESGx0A50!".to_vec(), stream.output);
        assert_eq!(0, engine.axis_state(Axis::RA).unwrap().tracking_rate);
        assert_eq!(0, port.take_written().len());
    }

    #[test]
    fn goto_scales_the_target_into_mount_steps() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        port.push_response(&inquiry_reply(Axis::RA, status::SLEWING, 0));
        port.push_response(&ACK);

        let mut stream = TestStream::new(&[b"ESPt0100000!"]);
        server.handle_client(&mut stream);

        assert_eq!(b"ESGt0100000!".to_vec(), stream.output);
        // round(0x100000 * 38/48) = 830123
        assert_eq!(830123, engine.axis_state(Axis::RA).unwrap().goto_target);
        assert_eq!(20, engine.axis_state(Axis::RA).unwrap().goto_rate);
    }

    #[test]
    fn unknown_frames_are_dropped_silently() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        let mut stream = TestStream::new(&[b"ESXy0!", b"ABCDEF!", b"ESGv!"]);
        server.handle_client(&mut stream);

        // the stream stays open across the bad frames
        assert_eq!(b"ESGvES6B10A0!".to_vec(), stream.output);
    }

    #[test]
    fn invalid_axis_digit_yields_no_get_response() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        let mut stream = TestStream::new(&[b"ESGd7!", b"ESGp9!"]);
        server.handle_client(&mut stream);

        assert!(stream.output.is_empty());
    }

    #[test]
    fn short_client_message_disconnects() {
        let port = MockPort::new();
        let engine = new_engine(&port);
        let mut server = Pmc8Server::new(&engine);

        let mut stream = TestStream::new(&[b"ES!", b"ESGv!"]);
        server.handle_client(&mut stream);

        assert!(stream.output.is_empty());
    }
}
