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

//! Zerocoding: run-length compression of zero bytes used by packets marked with
//! [`crate::packet::Flags::ZEROCODED`].
//!
//! Each run of zeros is replaced by a single `0x00` byte followed by the length of the run.
//! Runs longer than 255 bytes are split.

/// Errors decoding zerocoded data.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ZerocodeError {
    /// zero byte at position {0} is not followed by a run length.
    Truncated(usize),
}

/// Compresses zero runs in the data.
///
/// ```
/// assert_eq!(simconn::zerocode::encode(&[1, 0, 0, 0, 2]), vec![1, 0, 3, 2]);
/// ```
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut run = 0u8;
    for byte in data {
        if *byte == 0 {
            if run == u8::MAX {
                out.extend([0x00, run]);
                run = 0;
            }
            run += 1;
        } else {
            if run > 0 {
                out.extend([0x00, run]);
                run = 0;
            }
            out.push(*byte);
        }
    }
    if run > 0 {
        out.extend([0x00, run]);
    }
    out
}

/// Expands zero runs compressed with [`encode`].
pub fn decode(data: &[u8]) -> Result<Vec<u8>, ZerocodeError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut iter = data.iter().enumerate();
    while let Some((pos, byte)) = iter.next() {
        if *byte == 0 {
            let (_, run) = iter.next().ok_or(ZerocodeError::Truncated(pos))?;
            out.resize(out.len() + *run as usize, 0x00);
        } else {
            out.push(*byte);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs() {
        assert_eq!(encode(&[]), Vec::<u8>::new());
        assert_eq!(encode(&[0]), vec![0, 1]);
        assert_eq!(encode(&[7, 0, 0, 9, 0]), vec![7, 0, 2, 9, 0, 1]);
        assert_eq!(decode(&[7, 0, 2, 9, 0, 1]).unwrap(), vec![7, 0, 0, 9, 0]);
    }

    #[test]
    fn long_run_is_split() {
        let data = vec![0u8; 300];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![0, 255, 0, 45]);
        assert_eq!(decode(&encoded).unwrap(), data);

        let data = vec![0u8; 255];
        assert_eq!(encode(&data), vec![0, 255]);
    }

    #[test]
    fn truncated_run() {
        assert_eq!(decode(&[5, 6, 0]), Err(ZerocodeError::Truncated(2)));
        assert!(ZerocodeError::Truncated(2).to_string().contains("position 2"));
    }

    #[test]
    fn zero_length_run_expands_to_nothing() {
        assert_eq!(decode(&[1, 0, 0, 2]).unwrap(), vec![1, 2]);
    }
}
