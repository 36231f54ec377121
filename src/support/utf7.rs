//-
// Copyright (c) 2022, The Mettmail Developers
//
// This file is part of Mettmail.
//
// Mettmail is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, version 3 of the License.
//
// Mettmail is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mettmail. If not, see <http://www.gnu.org/licenses/>.

//! IMAP's "modified UTF-7" (RFC 3501 section 5.1.3), encode direction only.
//!
//! The relay only ever needs to *send* one mailbox name, so there is no
//! decoder.

use std::borrow::Cow;

const SHIFT_IN: u8 = b'&';

/// Encode `s` as a mailbox name on the wire.
///
/// The result is minimal (no unnecessary shift sequences) and normalised
/// (direct characters are never encoded, `&` is always written as `&-`, and
/// every encoded run has an explicit shift-out).
pub fn encode_mailbox(s: &str) -> Cow<'_, str> {
    let mut transformed = String::new();

    let mut direct_start = 0;
    let mut direct_end = 0;
    for (ix, byte) in s.as_bytes().iter().copied().enumerate() {
        if is_direct(byte) {
            if ix != direct_end {
                encode_group(&mut transformed, s, direct_start, direct_end, ix);
                direct_start = ix;
            }
            direct_end = ix + 1;
        } else if SHIFT_IN == byte {
            encode_group(&mut transformed, s, direct_start, direct_end, ix);
            transformed.push_str("&-");
            direct_start = ix + 1;
            direct_end = ix + 1;
        }
    }

    if transformed.is_empty() && direct_end == s.len() {
        Cow::Borrowed(s)
    } else {
        encode_group(&mut transformed, s, direct_start, direct_end, s.len());
        Cow::Owned(transformed)
    }
}

fn encode_group(
    dst: &mut String,
    src: &str,
    direct_start: usize,
    direct_end: usize,
    indirect_end: usize,
) {
    dst.push_str(&src[direct_start..direct_end]);

    if direct_end < indirect_end {
        let mut buf = Vec::<u8>::with_capacity((indirect_end - direct_end) * 2);
        for unit in src[direct_end..indirect_end].encode_utf16() {
            buf.extend_from_slice(&unit.to_be_bytes());
        }

        dst.push(SHIFT_IN.into());
        dst.push_str(&base64::encode_config(&buf, base64::IMAP_MUTF7));
        dst.push('-');
    }
}

fn is_direct(byte: u8) -> bool {
    byte >= b' ' && byte < 0x7F && SHIFT_IN != byte
}
