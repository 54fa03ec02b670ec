// Copyright (C) 2026 The xsend Authors
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Splits file content into padded 128-byte blocks and serializes them
//! into checksum-protected frames.

use crate::protocol::*;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("payload must be exactly {BLOCK_SIZE} bytes, got {len}")]
    InvalidPayloadSize { len: usize },
}

pub type Block = [u8; BLOCK_SIZE];

// ============================================================================
// Block Partitioning
// ============================================================================

/// Splits `data` into consecutive 128-byte blocks in file order.
///
/// The final block is right-padded with SUB. Empty input yields a single
/// block consisting entirely of padding, so the result is never empty.
pub fn chunk(data: &[u8]) -> Vec<Block> {
    if data.is_empty() {
        return vec![[SUB; BLOCK_SIZE]];
    }

    data.chunks(BLOCK_SIZE)
        .map(|piece| {
            let mut block = [SUB; BLOCK_SIZE];
            block[..piece.len()].copy_from_slice(piece);
            block
        })
        .collect()
}

// ============================================================================
// Frame Construction
// ============================================================================

/// Additive checksum: sum of the payload bytes, carry discarded.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Wire block number for the 0-based block `cursor`: 1..=255, then back to 1.
pub fn block_number(cursor: usize) -> u8 {
    (cursor % 255 + 1) as u8
}

/// Builds the 132-byte frame `SOH | n | 255-n | payload | checksum`.
pub fn build_frame(number: u8, payload: &[u8]) -> Result<Vec<u8>, FramerError> {
    if payload.len() != BLOCK_SIZE {
        return Err(FramerError::InvalidPayloadSize { len: payload.len() });
    }

    let mut frame = Vec::with_capacity(FRAME_SIZE);
    frame.push(SOH);
    frame.push(number);
    frame.push(255 - number);
    frame.extend_from_slice(payload);
    frame.push(checksum(payload));
    Ok(frame)
}

// ============================================================================
// Tests
// ============================================================================
