// Simulator UDP circuits for virtual-world clients driven by a poll reactor.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::time::Duration;

/// Tunables of simulator circuits.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SimConfig {
    /// Time after which an unacknowledged reliable packet is sent again.
    pub resend_timeout: Duration,
    /// Number of resends after which a reliable packet is given up.
    pub max_resends: u8,
    /// Circuit is considered dead if nothing was received from the simulator for this time.
    pub disconnect_timeout: Duration,
    /// Period of the reactor timer driving resends, ack flushes and inactivity checks.
    pub housekeeping_interval: Duration,
    /// Number of most recent inbound reliable sequence numbers remembered to drop duplicates.
    pub inbox_window: usize,
    /// Maximum number of pending acks piggybacked on a single outgoing packet.
    pub max_appended_acks: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            resend_timeout: Duration::from_secs(4),
            max_resends: 3,
            disconnect_timeout: Duration::from_secs(15),
            housekeeping_interval: Duration::from_millis(500),
            inbox_window: 1024,
            max_appended_acks: 64,
        }
    }
}
