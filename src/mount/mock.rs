//
// brexos2pmc8 - PMC8 protocol bridge for the Bresser EXOS-2 GoTo mount
// Copyright (c) 2024 the brexos2pmc8 developers
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Scripted serial port stand-in for tests.
//!

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

struct State {
    /// Pending response chunks; one chunk is delivered per `read` call.
    script: VecDeque<Vec<u8>>,
    written: Vec<u8>
}

/// A `Read + Write` device fed with canned response bytes.
///
/// All handles created from one port share the same script and the same
/// record of written bytes, so a test can keep feeding responses and
/// inspecting commands while the engine owns another handle.
///
pub struct MockPort {
    state: Arc<Mutex<State>>
}

impl MockPort {
    pub fn new() -> MockPort {
        MockPort{
            state: Arc::new(Mutex::new(State{ script: VecDeque::new(), written: vec![] }))
        }
    }

    pub fn handle(&self) -> MockPort {
        MockPort{ state: Arc::clone(&self.state) }
    }

    /// Queues `bytes` to be returned by a single subsequent `read`.
    pub fn push_response(&self, bytes: &[u8]) {
        self.state.lock().unwrap().script.push_back(bytes.to_vec());
    }

    /// Queues `bytes` split into chunks of the given sizes, one chunk per `read`.
    pub fn push_response_split(&self, bytes: &[u8], chunk_sizes: &[usize]) {
        assert_eq!(bytes.len(), chunk_sizes.iter().sum::<usize>());

        let mut state = self.state.lock().unwrap();
        let mut offset = 0;
        for &size in chunk_sizes {
            state.script.push_back(bytes[offset..offset + size].to_vec());
            offset += size;
        }
    }

    /// Returns and clears everything written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().written)
    }

    pub fn num_pending_responses(&self) -> usize {
        self.state.lock().unwrap().script.len()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().unwrap();

        match state.script.front_mut() {
            Some(chunk) => {
                let num_read = buf.len().min(chunk.len());
                buf[..num_read].copy_from_slice(&chunk[..num_read]);
                chunk.drain(..num_read);
                if chunk.is_empty() { state.script.pop_front(); }
                Ok(num_read)
            },

            // an empty script behaves like a serial read timeout
            None => Err(std::io::ErrorKind::TimedOut.into())
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.state.lock().unwrap().written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
