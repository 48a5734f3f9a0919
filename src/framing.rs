// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Byte framing for the shared tracker bus.
//!
//! Every frame starts with [`PACKET_HEADER`]; a literal header byte anywhere
//! after that is escaped by stuffing a single zero byte behind it. This keeps
//! frame boundaries unambiguous on a raw byte stream without length prefixes,
//! at the cost of doubling the worst-case payload size. Devices apply the same
//! stuffing on their replies, so the zero stuffed after a reply's leading
//! header byte doubles as the "to host" address byte.

use std::io;

use log::debug;

use crate::Result;

/// First byte of every frame on the bus. Escaped wherever it occurs as data.
pub const PACKET_HEADER: u8 = 0xFF;

/// Escapes a payload by inserting a zero byte after each [`PACKET_HEADER`]
/// occurrence, including adjacent ones.
pub fn encode_escaped(payload: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(payload.len());
    for &byte in payload {
        encoded.push(byte);
        if byte == PACKET_HEADER {
            encoded.push(0x00);
        }
    }
    encoded
}

/// Reads exactly `count` logical bytes, dropping the stuffed marker that
/// follows each raw [`PACKET_HEADER`].
///
/// Fails with [`Error::LinkTimeout`](crate::Error::LinkTimeout) when the link
/// stalls mid-sequence.
pub fn decode_escaped(reader: &mut impl io::Read, count: usize) -> Result<Vec<u8>> {
    let mut decoded = Vec::with_capacity(count);
    while decoded.len() < count {
        let byte = read_byte(reader)?;
        if byte == PACKET_HEADER {
            read_byte(reader)?;
        }
        decoded.push(byte);
    }
    Ok(decoded)
}

/// Discards raw bytes until a host-destined reply header ([`PACKET_HEADER`]
/// followed by address byte zero) has been consumed.
///
/// Recovers framing after noise or a partial read. Never succeeds without a
/// valid header; a stalled link surfaces as
/// [`Error::LinkTimeout`](crate::Error::LinkTimeout).
pub fn synchronize(reader: &mut impl io::Read) -> Result<()> {
    let mut discarded = 0usize;
    let mut byte = read_byte(reader)?;
    loop {
        while byte == PACKET_HEADER {
            let next = read_byte(reader)?;
            if next == 0x00 {
                if discarded > 0 {
                    debug!("discarded {discarded} bytes while resynchronizing");
                }
                return Ok(());
            }
            // A header byte directly after another one restarts the match.
            discarded += 1;
            byte = next;
        }
        discarded += 1;
        byte = read_byte(reader)?;
    }
}

pub(crate) fn read_byte(reader: &mut impl io::Read) -> Result<u8> {
    let mut buf = [0u8];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}
