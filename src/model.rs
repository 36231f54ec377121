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

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An IMAP UID.
///
/// Only meaningful together with the UIDVALIDITY of the session it came
/// from.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl Uid {
    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// The custom IMAP keyword marking a message as delivered.
///
/// Keywords are atoms and compare case-insensitively, so `Mettmail-Fetched`
/// on the server counts as ours.
#[derive(Clone, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Keyword(String);

pub const DEFAULT_DONE_FLAG: &str = "mettmail-fetched";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeywordError {
    Empty,
    SystemFlag,
    NotAnAtom,
}

impl fmt::Display for KeywordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            KeywordError::Empty => write!(f, "keyword is empty"),
            KeywordError::SystemFlag => {
                write!(f, "system flags (\\...) cannot be used as keyword")
            }
            KeywordError::NotAnAtom => {
                write!(f, "keyword contains characters not allowed in an atom")
            }
        }
    }
}

impl Keyword {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the given flag, as reported by the server, is this keyword.
    pub fn matches(&self, flag: &str) -> bool {
        self.0.eq_ignore_ascii_case(flag)
    }
}

impl Default for Keyword {
    fn default() -> Self {
        Keyword(DEFAULT_DONE_FLAG.to_owned())
    }
}

impl FromStr for Keyword {
    type Err = KeywordError;

    fn from_str(s: &str) -> Result<Self, KeywordError> {
        if s.is_empty() {
            Err(KeywordError::Empty)
        } else if s.starts_with('\\') {
            Err(KeywordError::SystemFlag)
        } else if s.as_bytes().iter().copied().all(is_atom_char) {
            Ok(Keyword(s.to_owned()))
        } else {
            Err(KeywordError::NotAnAtom)
        }
    }
}

impl std::convert::TryFrom<String> for Keyword {
    type Error = KeywordError;

    fn try_from(s: String) -> Result<Self, KeywordError> {
        s.parse()
    }
}

impl From<Keyword> for String {
    fn from(kw: Keyword) -> String {
        kw.0
    }
}

impl PartialEq for Keyword {
    fn eq(&self, other: &Keyword) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for Keyword {}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Keyword as fmt::Display>::fmt(self, f)
    }
}

pub fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

/// A message exactly as the IMAP server handed it out.
///
/// The bytes are never parsed or re-encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: Uid,
    /// The flags the message carried when it was fetched.
    pub flags: Vec<String>,
    pub data: Vec<u8>,
}

impl RawMessage {
    pub fn has_flag(&self, keyword: &Keyword) -> bool {
        self.flags.iter().any(|f| keyword.matches(f))
    }
}

/// The LMTP envelope every relayed message is sent with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipient: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keyword_parsing() {
        assert_eq!(
            "mettmail-fetched",
            "mettmail-fetched".parse::<Keyword>().unwrap().as_str()
        );
        assert_eq!(
            "$Forwarded",
            "$Forwarded".parse::<Keyword>().unwrap().as_str()
        );
        assert_eq!(Err(KeywordError::Empty), "".parse::<Keyword>());
        assert_eq!(Err(KeywordError::SystemFlag), "\\Seen".parse::<Keyword>());
        assert_eq!(
            Err(KeywordError::NotAnAtom),
            "two words".parse::<Keyword>()
        );
        assert_eq!(Err(KeywordError::NotAnAtom), "br]acket".parse::<Keyword>());
        assert_eq!(Err(KeywordError::NotAnAtom), "föö".parse::<Keyword>());
    }

    #[test]
    fn keyword_matching_ignores_case() {
        let kw = Keyword::default();
        assert!(kw.matches("mettmail-fetched"));
        assert!(kw.matches("MettMail-Fetched"));
        assert!(!kw.matches("mettmail-fetched2"));
        assert_eq!(kw, "METTMAIL-FETCHED".parse::<Keyword>().unwrap());
    }

    #[test]
    fn raw_message_flag_check() {
        let message = RawMessage {
            uid: Uid::of(3).unwrap(),
            flags: vec!["\\Seen".to_owned(), "METTMAIL-FETCHED".to_owned()],
            data: b"Subject: x\r\n\r\n".to_vec(),
        };
        assert!(message.has_flag(&Keyword::default()));
        assert!(!message.has_flag(&"other".parse().unwrap()));
    }

    #[test]
    fn uid_zero_is_rejected() {
        assert!(Uid::of(0).is_none());
        assert_eq!(10, Uid::of(10).unwrap().get());
    }
}
