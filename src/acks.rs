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

//! Reliable delivery bookkeeping of a single circuit.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use crate::packet::mark_resent;
use crate::{SimConfig, Timestamp};

#[derive(Clone, Debug)]
struct Unacked {
    datagram: Vec<u8>,
    sent_at: Timestamp,
    resends: u8,
}

/// Outcome of [`AckTracker::resend_due`].
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Resends {
    /// Datagrams to be sent again, already marked as resent.
    pub datagrams: Vec<Vec<u8>>,
    /// Sequence numbers given up after reaching the resend limit.
    pub abandoned: Vec<u16>,
}

/// Tracks outbound reliable packets waiting for acknowledgement, inbound reliable packets
/// already seen and acks which still have to be sent to the peer.
#[derive(Clone, Debug)]
pub struct AckTracker {
    need_ack: BTreeMap<u16, Unacked>,
    inbox: VecDeque<u16>,
    seen: HashSet<u16>,
    window: usize,
    outbox: Vec<u32>,
}

impl Default for AckTracker {
    fn default() -> Self { AckTracker::new(SimConfig::default().inbox_window) }
}

impl AckTracker {
    /// Creates tracker remembering up to `window` recent inbound sequence numbers.
    pub fn new(window: usize) -> Self {
        AckTracker {
            need_ack: empty!(),
            inbox: VecDeque::with_capacity(window),
            seen: HashSet::with_capacity(window),
            window,
            outbox: empty!(),
        }
    }

    /// Remembers a reliable datagram sent with `sequence` until it gets acknowledged.
    ///
    /// # Returns
    ///
    /// `false` if a packet sent with the same sequence number before the counter wrapped was still
    /// waiting for an ack. That packet is dropped from tracking: an ack for the sequence number
    /// can only refer to the newer one.
    pub fn track(&mut self, sequence: u16, datagram: Vec<u8>, now: Timestamp) -> bool {
        let stale = self.need_ack.insert(sequence, Unacked {
            datagram,
            sent_at: now,
            resends: 0,
        });
        match stale {
            None => true,
            Some(stale) => {
                #[cfg(feature = "log")]
                log::warn!(target: "simconn", "Sequence number {sequence} wrapped onto an unacked packet sent at {}, which is no longer tracked", stale.sent_at);
                false
            }
        }
    }

    /// Marks outbound packet as acknowledged by the peer, returning whether it was waited for.
    pub fn acknowledge(&mut self, sequence: u16) -> bool { self.need_ack.remove(&sequence).is_some() }

    pub fn unacked_len(&self) -> usize { self.need_ack.len() }

    /// Sequence number of the longest-waiting unacknowledged packet.
    pub fn oldest_unacked(&self) -> Option<u16> {
        self.need_ack.iter().min_by_key(|(_, unacked)| unacked.sent_at).map(|(seq, _)| *seq)
    }

    /// Registers inbound reliable packet.
    ///
    /// # Returns
    ///
    /// `false` if the packet was already received, i.e. it is a duplicate which must be
    /// acknowledged again but not processed.
    pub fn receive(&mut self, sequence: u16) -> bool {
        if self.window == 0 {
            return true;
        }
        if !self.seen.insert(sequence) {
            return false;
        }
        self.inbox.push_back(sequence);
        if self.inbox.len() > self.window {
            if let Some(oldest) = self.inbox.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Queues an ack to be sent to the peer.
    pub fn queue_ack(&mut self, sequence: u16) { self.outbox.push(sequence as u32) }

    pub fn pending_acks(&self) -> usize { self.outbox.len() }

    /// Takes up to `max` queued acks, oldest first.
    pub fn take_acks(&mut self, max: usize) -> Vec<u32> {
        let count = self.outbox.len().min(max);
        self.outbox.drain(..count).collect()
    }

    /// Puts back acks taken with [`AckTracker::take_acks`] which did not leave, ahead of the
    /// ones queued since.
    pub fn requeue_acks(&mut self, mut acks: Vec<u32>) {
        acks.append(&mut self.outbox);
        self.outbox = acks;
    }

    /// Collects reliable packets which were not acknowledged within `timeout`.
    ///
    /// Packets resent `max_resends` times already are dropped from tracking and reported as
    /// abandoned.
    pub fn resend_due(&mut self, now: Timestamp, timeout: Duration, max_resends: u8) -> Resends {
        let mut resends = Resends::default();
        for (seq, unacked) in self.need_ack.iter_mut() {
            if now.duration_since(unacked.sent_at) < timeout {
                continue;
            }
            if unacked.resends >= max_resends {
                resends.abandoned.push(*seq);
                continue;
            }
            unacked.resends += 1;
            unacked.sent_at = now;
            mark_resent(&mut unacked.datagram);
            resends.datagrams.push(unacked.datagram.clone());
        }
        for seq in &resends.abandoned {
            self.need_ack.remove(seq);
        }
        resends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Flags, MessageId, Packet};

    #[test]
    fn acknowledge() {
        let now = Timestamp::from_millis(1000);
        let mut tracker = AckTracker::new(16);
        assert!(tracker.track(1, vec![0x40, 0, 0, 1, 1], now));
        assert!(tracker.track(2, vec![0x40, 0, 0, 2, 1], now + Duration::from_millis(5)));
        assert_eq!(tracker.unacked_len(), 2);
        assert_eq!(tracker.oldest_unacked(), Some(1));

        assert!(tracker.acknowledge(1));
        assert!(!tracker.acknowledge(1));
        assert_eq!(tracker.oldest_unacked(), Some(2));
        assert!(tracker.acknowledge(2));
        assert_eq!(tracker.oldest_unacked(), None);
    }

    #[test]
    fn wrapped_sequence_replaces_stale_packet() {
        let timeout = Duration::from_secs(4);
        let start = Timestamp::from_millis(1000);
        let mut tracker = AckTracker::new(16);
        assert!(tracker.track(1, vec![0x40, 0, 0, 1, 1], start));

        let later = start + Duration::from_secs(2);
        assert!(!tracker.track(1, vec![0x40, 0, 0, 1, 2], later), "stale packet is replaced");
        assert_eq!(tracker.unacked_len(), 1);

        // Resend timing and content follow the newer packet
        assert!(tracker.resend_due(start + timeout, timeout, 3).datagrams.is_empty());
        let resends = tracker.resend_due(later + timeout, timeout, 3);
        assert_eq!(resends.datagrams, vec![vec![0x60, 0, 0, 1, 2]]);

        assert!(tracker.acknowledge(1));
        assert_eq!(tracker.unacked_len(), 0);
    }

    #[test]
    fn default_window_suppresses_duplicates() {
        let mut tracker = AckTracker::default();
        assert!(tracker.receive(7));
        assert!(!tracker.receive(7));
        for seq in 8..(8 + SimConfig::default().inbox_window as u16) {
            assert!(tracker.receive(seq));
        }
        // 7 fell out of the window
        assert!(tracker.receive(7));
    }

    #[test]
    fn duplicates_within_window() {
        let mut tracker = AckTracker::new(2);
        assert!(tracker.receive(10));
        assert!(!tracker.receive(10));
        assert!(tracker.receive(11));
        assert!(tracker.receive(12));
        // 10 fell out of the window
        assert!(tracker.receive(10));
        assert!(!tracker.receive(12));

        let mut forgetful = AckTracker::new(0);
        assert!(forgetful.receive(1));
        assert!(forgetful.receive(1));
    }

    #[test]
    fn ack_outbox() {
        let mut tracker = AckTracker::default();
        for seq in 1..=5 {
            tracker.queue_ack(seq);
        }
        assert_eq!(tracker.take_acks(2), vec![1, 2]);
        assert_eq!(tracker.pending_acks(), 3);
        tracker.queue_ack(6);
        tracker.requeue_acks(vec![1, 2]);
        assert_eq!(tracker.pending_acks(), 6);
        assert_eq!(tracker.take_acks(10), vec![1, 2, 3, 4, 5, 6]);
        assert!(tracker.take_acks(10).is_empty());
    }

    #[test]
    fn resends() {
        let timeout = Duration::from_secs(4);
        let start = Timestamp::from_millis(10_000);
        let mut packet = Packet::new(MessageId::High(1), vec![]).reliable();
        packet.sequence = 9;

        let mut tracker = AckTracker::new(16);
        tracker.track(9, packet.encode().unwrap(), start);

        assert_eq!(tracker.resend_due(start + Duration::from_secs(1), timeout, 2), Resends::default());

        let mut now = start + timeout;
        for _ in 0..2 {
            let resends = tracker.resend_due(now, timeout, 2);
            assert_eq!(resends.datagrams.len(), 1);
            assert!(resends.abandoned.is_empty());
            let resent = Packet::decode(&resends.datagrams[0]).unwrap();
            assert!(resent.flags.contains(Flags::RESENT | Flags::RELIABLE));
            assert_eq!(resent.sequence, 9);
            now += timeout;
        }

        let resends = tracker.resend_due(now, timeout, 2);
        assert!(resends.datagrams.is_empty());
        assert_eq!(resends.abandoned, vec![9]);
        assert_eq!(tracker.unacked_len(), 0);
    }
}
