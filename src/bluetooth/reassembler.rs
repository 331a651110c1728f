// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reassembly of length-prefixed frames from arbitrary read chunks.

use tracing::debug;

/// Size of the little-endian length header.
const HEADER_LEN: usize = 2;

/// Collects read chunks and splits them into complete frames.
///
/// Handles frames split across several reads as well as several frames
/// coalesced into one read.
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// Create a new frame assembler.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Feed one read chunk.
    ///
    /// Returns every frame completed by this chunk, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < HEADER_LEN {
                break;
            }
            let expected = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
            if self.buffer.len() < HEADER_LEN + expected {
                debug!(
                    "Waiting for more data: have {} of {} bytes",
                    self.buffer.len() - HEADER_LEN,
                    expected
                );
                break;
            }

            let frame = self.buffer[HEADER_LEN..HEADER_LEN + expected].to_vec();
            self.buffer.drain(..HEADER_LEN + expected);
            frames.push(frame);
        }

        frames
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Check if a frame is partially received.
    pub fn is_in_progress(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get current buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
