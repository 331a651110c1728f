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

//! Chat message definitions and frame encoding.
//!
//! A frame is `<sender name>` + `^` + `<text>`, UTF-8 encoded. The reference
//! wire format carries no length prefix: one write on the sending side is
//! expected to arrive as one read on the receiving side. [`Framing::LengthPrefixed`]
//! adds a two byte little-endian length header for links where that does not hold.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte separating the sender name from the message text.
pub const SEPARATOR: u8 = b'^';

/// Errors produced while encoding or decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large for length prefix: {0} bytes")]
    TooLarge(usize),
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Display name of the sender.
    pub sender_name: String,

    /// Message body.
    pub text: String,

    /// Whether the message was written on this device.
    pub is_from_current_user: bool,
}

impl Message {
    /// Create a new message.
    pub fn new(
        sender_name: impl Into<String>,
        text: impl Into<String>,
        is_from_current_user: bool,
    ) -> Self {
        Self {
            sender_name: sender_name.into(),
            text: text.into(),
            is_from_current_user,
        }
    }

    /// Create a message written on this device.
    pub fn local(sender_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(sender_name, text, true)
    }

    /// Encode into a wire frame.
    ///
    /// Fails if either field contains the separator, as the peer could not
    /// split the frame again.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let separator = SEPARATOR as char;
        if self.sender_name.contains(separator) {
            return Err(FrameError::MalformedFrame(
                "separator in sender name".to_string(),
            ));
        }
        if self.text.contains(separator) {
            return Err(FrameError::MalformedFrame("separator in text".to_string()));
        }

        let mut frame = Vec::with_capacity(self.sender_name.len() + self.text.len() + 1);
        frame.extend_from_slice(self.sender_name.as_bytes());
        frame.push(SEPARATOR);
        frame.extend_from_slice(self.text.as_bytes());
        Ok(frame)
    }

    /// Decode a wire frame.
    ///
    /// Invalid UTF-8 sequences are replaced rather than rejected. The frame
    /// must contain exactly one separator.
    pub fn decode(bytes: &[u8], is_from_current_user: bool) -> Result<Self, FrameError> {
        let content = String::from_utf8_lossy(bytes);
        let mut parts = content.split(SEPARATOR as char);

        let sender_name = parts.next().unwrap_or_default();
        let text = parts
            .next()
            .ok_or_else(|| FrameError::MalformedFrame("missing separator".to_string()))?;

        if parts.next().is_some() {
            return Err(FrameError::MalformedFrame(
                "more than one separator".to_string(),
            ));
        }

        Ok(Self::new(sender_name, text, is_from_current_user))
    }
}

/// How frames are delimited on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One read chunk is one frame. Compatible with reference peers.
    #[default]
    Raw,
    /// Every frame is preceded by its length as a little-endian `u16`.
    LengthPrefixed,
}

impl Framing {
    /// Prepare an encoded frame for writing.
    pub fn wrap(&self, frame: Vec<u8>) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Raw => Ok(frame),
            Self::LengthPrefixed => {
                let len = u16::try_from(frame.len())
                    .map_err(|_| FrameError::TooLarge(frame.len()))?;
                let mut wrapped = Vec::with_capacity(frame.len() + 2);
                wrapped.extend_from_slice(&len.to_le_bytes());
                wrapped.extend_from_slice(&frame);
                Ok(wrapped)
            }
        }
    }
}
