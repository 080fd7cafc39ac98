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

//! Circuit control messages handled by the crate itself. Bodies of all other messages are left
//! to the application.

use crate::packet::{MessageId, Packet};

pub const START_PING_CHECK: MessageId = MessageId::High(1);
pub const COMPLETE_PING_CHECK: MessageId = MessageId::High(2);
pub const USE_CIRCUIT_CODE: MessageId = MessageId::Low(3);
pub const PACKET_ACK: MessageId = MessageId::Low(0xFFFB);
pub const CLOSE_CIRCUIT: MessageId = MessageId::Low(0xFFFD);

/// Errors parsing control message bodies.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum MessageError {
    /// body of {0} message is truncated.
    Truncated(MessageId),
}

/// 128-bit identifier issued by the login service.
#[derive(Wrapper, Copy, Clone, Eq, PartialEq, Hash, Default, Debug, From)]
#[wrapper(Deref)]
pub struct Uuid([u8; 16]);

/// Identifiers sent with `UseCircuitCode` to bind the circuit to a login session.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Debug)]
pub struct SessionKeys {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

/// Reliable packet opening a circuit.
pub fn use_circuit_code(code: u32, keys: SessionKeys) -> Packet {
    let mut body = Vec::with_capacity(36);
    body.extend(code.to_le_bytes());
    body.extend_from_slice(keys.session_id.as_slice());
    body.extend_from_slice(keys.agent_id.as_slice());
    Packet::new(USE_CIRCUIT_CODE, body).reliable()
}

/// Parses `UseCircuitCode` body, returning circuit code and session keys.
pub fn parse_use_circuit_code(body: &[u8]) -> Result<(u32, SessionKeys), MessageError> {
    if body.len() < 36 {
        return Err(MessageError::Truncated(USE_CIRCUIT_CODE));
    }
    let code = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let mut session_id = [0u8; 16];
    let mut agent_id = [0u8; 16];
    session_id.copy_from_slice(&body[4..20]);
    agent_id.copy_from_slice(&body[20..36]);
    Ok((code, SessionKeys {
        agent_id: agent_id.into(),
        session_id: session_id.into(),
    }))
}

pub fn close_circuit() -> Packet { Packet::new(CLOSE_CIRCUIT, vec![]) }

/// Packet acknowledging the provided sequence numbers.
pub fn packet_ack(ids: &[u32]) -> Packet {
    let ids = &ids[..ids.len().min(u8::MAX as usize)];
    let mut body = Vec::with_capacity(1 + ids.len() * 4);
    body.push(ids.len() as u8);
    for id in ids {
        body.extend(id.to_le_bytes());
    }
    Packet::new(PACKET_ACK, body)
}

pub fn parse_packet_ack(body: &[u8]) -> Result<Vec<u32>, MessageError> {
    let Some((count, ids)) = body.split_first() else {
        return Err(MessageError::Truncated(PACKET_ACK));
    };
    let count = *count as usize;
    if ids.len() < count * 4 {
        return Err(MessageError::Truncated(PACKET_ACK));
    }
    Ok(ids[..count * 4]
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub fn start_ping_check(ping_id: u8, oldest_unacked: u32) -> Packet {
    let mut body = vec![ping_id];
    body.extend(oldest_unacked.to_le_bytes());
    Packet::new(START_PING_CHECK, body)
}

/// Parses `StartPingCheck` body into ping id and the oldest sequence the sender waits an ack for.
pub fn parse_start_ping_check(body: &[u8]) -> Result<(u8, u32), MessageError> {
    match *body {
        [ping_id, a, b, c, d, ..] => Ok((ping_id, u32::from_le_bytes([a, b, c, d]))),
        _ => Err(MessageError::Truncated(START_PING_CHECK)),
    }
}

pub fn complete_ping_check(ping_id: u8) -> Packet {
    Packet::new(COMPLETE_PING_CHECK, vec![ping_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_code() {
        let keys = SessionKeys {
            agent_id: Uuid::from([0xA1; 16]),
            session_id: Uuid::from([0x5E; 16]),
        };
        let packet = use_circuit_code(0xDEADBEEF, keys);
        assert!(packet.is_reliable());
        assert_eq!(packet.message, USE_CIRCUIT_CODE);
        assert_eq!(&packet.body[..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(parse_use_circuit_code(&packet.body), Ok((0xDEADBEEF, keys)));
        assert!(parse_use_circuit_code(&packet.body[..35]).is_err());
    }

    #[test]
    fn acks() {
        let packet = packet_ack(&[1, 0x0102]);
        assert!(!packet.is_reliable());
        assert_eq!(packet.body, vec![2, 1, 0, 0, 0, 2, 1, 0, 0]);
        assert_eq!(parse_packet_ack(&packet.body), Ok(vec![1, 0x0102]));
        assert_eq!(parse_packet_ack(&[]), Err(MessageError::Truncated(PACKET_ACK)));
        assert_eq!(parse_packet_ack(&[2, 1, 0, 0, 0]), Err(MessageError::Truncated(PACKET_ACK)));
    }

    #[test]
    fn ping() {
        let packet = start_ping_check(7, 42);
        assert_eq!(parse_start_ping_check(&packet.body), Ok((7, 42)));
        assert!(parse_start_ping_check(&[7, 0]).is_err());
        assert_eq!(complete_ping_check(7).body, vec![7]);
        assert!(close_circuit().body.is_empty());
    }
}
