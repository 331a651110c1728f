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

//! Service identifier and protocol defaults.

use uuid::Uuid;

/// RFCOMM service UUID shared by the listening and dialing side.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xbe5866ce_9dcf_4807_a65c_b3f7d8b3aebd);

/// Service name registered with the SDP server.
pub const SERVICE_NAME: &str = "bluechat_session_service";

/// Default timing and buffer values.
pub mod defaults {
    /// Length of one discovery cycle.
    pub const DISCOVERY_SECS: u32 = 12;

    /// How long a listening endpoint waits for a peer.
    pub const ACCEPT_TIMEOUT_SECS: u64 = 300;

    /// How long a dial may take before it is abandoned.
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;

    /// Size of the read buffer. Raw frames longer than this are cut.
    pub const READ_BUFFER_SIZE: usize = 1024;

    /// Pending transient error messages kept for slow observers.
    pub const ERROR_FEED_CAPACITY: usize = 20;

    /// Sender name used when the adapter has no name.
    pub const UNKNOWN_SENDER: &str = "(No Name)";
}
