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

//! Bluetooth communication module.
//!
//! Handles discovery, RFCOMM connections in both roles and the chat
//! session running over them.

#[cfg(feature = "bluez")]
mod bluez;
pub mod constants;
mod controller;
mod protocol;
pub mod radio;
mod reassembler;
mod session;
pub mod simulated;

#[cfg(feature = "bluez")]
pub use bluez::BluezRadio;
pub use controller::{ConnectionAttempt, ConnectionOutcome, Controller};
pub use protocol::{FrameError, Framing, Message, SEPARATOR};
pub use radio::{Authorization, BondStateEvent, Radio, RadioError, RadioListener, RadioSocket};
pub use reassembler::FrameAssembler;
pub use session::{SessionError, SessionTransport};
pub use simulated::{SimNetwork, SimRadio};
