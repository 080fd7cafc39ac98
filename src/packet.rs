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

//! Packet framing of the simulator UDP protocol.
//!
//! ```text
//! byte 0     flags
//! byte 1     reserved
//! bytes 2-3  sequence number, network order
//! then       message id: 1 byte (high frequency), 0xFF + 1 byte (medium frequency) or
//!            0xFF 0xFF + 2 bytes in network order (low frequency)
//! then       message body
//! trailer    if APPENDED_ACKS flag is set: acknowledged sequence numbers as u32 in network
//!            order followed by a single byte with their count
//! ```
//!
//! When the ZEROCODED flag is set, message id and body are [`crate::zerocode`]d; neither the
//! 4-byte prefix nor the ack trailer are.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::ops::BitOr;

use crate::zerocode::{self, ZerocodeError};

/// Length of the fixed packet prefix: flags, reserved byte and sequence number.
pub const PREFIX_LEN: usize = 4;

/// Maximum number of acks which can be appended to a single packet.
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;

/// Packet header flags.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Debug)]
pub struct Flags(u8);

impl Flags {
    /// Message id and body are zerocoded.
    pub const ZEROCODED: Flags = Flags(0x80);
    /// Receiver must acknowledge the packet.
    pub const RELIABLE: Flags = Flags(0x40);
    /// Packet is a resend of a reliable packet which was not acknowledged in time.
    pub const RESENT: Flags = Flags(0x20);
    /// Packet carries acknowledgements in its trailer.
    pub const APPENDED_ACKS: Flags = Flags(0x10);

    pub const fn empty() -> Self { Flags(0) }
    pub const fn from_bits(bits: u8) -> Self { Flags(bits) }
    pub const fn bits(self) -> u8 { self.0 }

    pub fn contains(self, other: Flags) -> bool { self.0 & other.0 == other.0 }
    pub fn insert(&mut self, other: Flags) { self.0 |= other.0 }
    pub fn remove(&mut self, other: Flags) { self.0 &= !other.0 }
    pub fn set(&mut self, other: Flags, value: bool) {
        if value {
            self.insert(other)
        } else {
            self.remove(other)
        }
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output { Flags(self.0 | rhs.0) }
}

impl Display for Flags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names = [
            (Flags::ZEROCODED, "zerocoded"),
            (Flags::RELIABLE, "reliable"),
            (Flags::RESENT, "resent"),
            (Flags::APPENDED_ACKS, "acks"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Message number together with its frequency class, which defines the width of the id on the
/// wire.
///
/// High and medium frequency ids must be below `0xFF`: this value marks the next frequency class,
/// so such ids are refused by [`Packet::encode`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum MessageId {
    #[display("high:{0}")]
    High(u8),
    #[display("medium:{0}")]
    Medium(u8),
    #[display("low:{0}")]
    Low(u16),
}

impl MessageId {
    /// Checks that the id can be written unambiguously.
    pub fn validate(self) -> Result<(), EncodeError> {
        match self {
            MessageId::High(0xFF) | MessageId::Medium(0xFF) => Err(EncodeError::MessageId(self)),
            _ => Ok(()),
        }
    }

    fn write(self, buf: &mut Vec<u8>) {
        match self {
            MessageId::High(id) => buf.push(id),
            MessageId::Medium(id) => buf.extend([0xFF, id]),
            MessageId::Low(id) => {
                buf.extend([0xFF, 0xFF]);
                buf.extend(id.to_be_bytes());
            }
        }
    }

    /// Reads message id from the start of the payload, returning it with its length.
    fn read(payload: &[u8]) -> Result<(MessageId, usize), DecodeError> {
        match *payload {
            [0xFF, 0xFF, hi, lo, ..] => Ok((MessageId::Low(u16::from_be_bytes([hi, lo])), 4)),
            [0xFF, 0xFF, ..] | [0xFF] | [] => Err(DecodeError::MessageId),
            [0xFF, id, ..] => Ok((MessageId::Medium(id), 2)),
            [id, ..] => Ok((MessageId::High(id), 1)),
        }
    }
}

/// Errors encoding a [`Packet`] into a datagram.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum EncodeError {
    /// message id {0} collides with the frequency class marker 0xFF.
    MessageId(MessageId),
}

/// Errors decoding a datagram into a [`Packet`].
#[derive(Clone, Eq, PartialEq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum DecodeError {
    /// datagram of {0} bytes is too short to contain a packet header.
    Truncated(usize),

    /// appended ack trailer of {0} entries does not fit into the datagram.
    AckTrailer(usize),

    /// packet payload is not correctly zerocoded: {0}
    #[from]
    Zerocode(ZerocodeError),

    /// message id is incomplete.
    MessageId,
}

/// Single protocol packet.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub flags: Flags,
    /// Sequence number. Outgoing packets get it assigned by the connection when sent.
    pub sequence: u16,
    pub message: MessageId,
    pub body: Vec<u8>,
    /// Acknowledged sequence numbers carried by the packet trailer.
    pub acks: Vec<u32>,
}

impl Packet {
    pub fn new(message: MessageId, body: Vec<u8>) -> Self {
        Packet {
            flags: Flags::empty(),
            sequence: 0,
            message,
            body,
            acks: vec![],
        }
    }

    /// Marks packet as requiring an acknowledgement from the receiver.
    pub fn reliable(mut self) -> Self {
        self.flags.insert(Flags::RELIABLE);
        self
    }

    /// Marks packet to be zerocoded on the wire.
    pub fn zerocoded(mut self) -> Self {
        self.flags.insert(Flags::ZEROCODED);
        self
    }

    pub fn is_reliable(&self) -> bool { self.flags.contains(Flags::RELIABLE) }
    pub fn is_resent(&self) -> bool { self.flags.contains(Flags::RESENT) }
    pub fn is_zerocoded(&self) -> bool { self.flags.contains(Flags::ZEROCODED) }

    /// Serializes packet into a datagram.
    ///
    /// The APPENDED_ACKS flag is derived from the ack list, which is truncated to
    /// [`MAX_APPENDED_ACKS`] entries.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.message.validate()?;
        let acks = &self.acks[..self.acks.len().min(MAX_APPENDED_ACKS)];
        let mut flags = self.flags;
        flags.set(Flags::APPENDED_ACKS, !acks.is_empty());

        let mut payload = Vec::with_capacity(self.body.len() + 4);
        self.message.write(&mut payload);
        payload.extend_from_slice(&self.body);

        let mut data = Vec::with_capacity(PREFIX_LEN + payload.len() + acks.len() * 4 + 1);
        data.push(flags.bits());
        data.push(0x00);
        data.extend(self.sequence.to_be_bytes());
        if flags.contains(Flags::ZEROCODED) {
            data.extend(zerocode::encode(&payload));
        } else {
            data.extend(payload);
        }
        if !acks.is_empty() {
            for ack in acks {
                data.extend(ack.to_be_bytes());
            }
            data.push(acks.len() as u8);
        }
        Ok(data)
    }

    /// Parses datagram into a packet.
    ///
    /// ```
    /// use simconn::packet::{MessageId, Packet};
    ///
    /// let packet = Packet::decode(&[0x40, 0x00, 0x00, 0x07, 0x01, 0xAB]).unwrap();
    /// assert!(packet.is_reliable());
    /// assert_eq!(packet.sequence, 7);
    /// assert_eq!(packet.message, MessageId::High(1));
    /// assert_eq!(packet.body, vec![0xAB]);
    /// ```
    pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
        if data.len() <= PREFIX_LEN {
            return Err(DecodeError::Truncated(data.len()));
        }
        let flags = Flags::from_bits(data[0]);
        let sequence = u16::from_be_bytes([data[2], data[3]]);

        let mut end = data.len();
        let mut acks = vec![];
        if flags.contains(Flags::APPENDED_ACKS) {
            let count = data[end - 1] as usize;
            let trailer = count * 4 + 1;
            if end < PREFIX_LEN + trailer {
                return Err(DecodeError::AckTrailer(count));
            }
            end -= trailer;
            acks = data[end..end + count * 4]
                .chunks_exact(4)
                .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
        }

        let payload = &data[PREFIX_LEN..end];
        let payload = if flags.contains(Flags::ZEROCODED) {
            Cow::Owned(zerocode::decode(payload)?)
        } else {
            Cow::Borrowed(payload)
        };
        let (message, offset) = MessageId::read(&payload)?;

        Ok(Packet {
            flags,
            sequence,
            message,
            body: payload[offset..].to_vec(),
            acks,
        })
    }
}

/// Sets the RESENT flag in an already encoded datagram.
pub(crate) fn mark_resent(datagram: &mut [u8]) {
    if let Some(flags) = datagram.first_mut() {
        *flags |= Flags::RESENT.bits();
    }
}
