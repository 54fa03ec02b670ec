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

//! XMODEM (checksum variant) wire constants

/// Start of header - begins every 128-byte frame
pub const SOH: u8 = 0x01;

/// Acknowledge - receiver accepted the last frame
pub const ACK: u8 = 0x06;

/// Negative acknowledge - receiver wants the last frame again
pub const NAK: u8 = 0x15;

/// Substitute (Ctrl-Z) - pads the final short block
pub const SUB: u8 = 0x1A;

/// Payload bytes carried by one frame
pub const BLOCK_SIZE: usize = 128;

/// SOH + block number + complement + payload + checksum
pub const FRAME_SIZE: usize = BLOCK_SIZE + 4;
