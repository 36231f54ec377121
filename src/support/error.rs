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

use std::io;

use thiserror::Error;

use super::sysexits::*;
use crate::model::Uid;

/// Everything that can stop the relay, plus `NotFound`, which the relay
/// recovers from locally.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Server closed the connection: {0}")]
    Bye(String),
    #[error("Connection refused by server: {0}")]
    Refused(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server does not support {0}")]
    Unsupported(String),
    #[error("UIDVALIDITY changed from {old} to {new}")]
    UidValidityChanged { old: u32, new: u32 },
    #[error("Message {0} not found")]
    NotFound(Uid),
    #[error("LMTP temporary failure: {0}")]
    LmtpTransient(String),
    #[error("LMTP permanent failure: {0}")]
    LmtpPermanent(String),
    #[error("Message {uid} rejected by LMTP server: {code} {text}")]
    Rejected { uid: Uid, code: u16, text: String },
    #[error("Invalid configuration: {0}")]
    Config(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad credentials. Restarting will not help until the operator steps in.
    Auth,
    /// Transport, TLS, timeouts, or the server hanging up.
    Connection,
    /// Malformed or unexpected server behaviour.
    Protocol,
    /// The message vanished between search and fetch.
    NotFound,
    /// The LMTP server failed temporarily, or its answer was ambiguous.
    Transient,
    /// The LMTP server refused the transaction or the recipient for good.
    Permanent,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::Auth(..) => ErrorKind::Auth,
            Error::Io(..)
            | Error::Ssl(..)
            | Error::Handshake(..)
            | Error::Timeout(..)
            | Error::Bye(..)
            | Error::Refused(..) => ErrorKind::Connection,
            Error::Protocol(..)
            | Error::Unsupported(..)
            | Error::UidValidityChanged { .. } => ErrorKind::Protocol,
            Error::NotFound(..) => ErrorKind::NotFound,
            Error::LmtpTransient(..) => ErrorKind::Transient,
            Error::LmtpPermanent(..) | Error::Rejected { .. } => {
                ErrorKind::Permanent
            }
            Error::Config(..) => ErrorKind::Config,
        }
    }

    /// The exit status the process should terminate with after this error.
    pub fn exit_code(&self) -> Sysexit {
        match self.kind() {
            ErrorKind::Auth => EX_NOPERM,
            ErrorKind::Connection => EX_UNAVAILABLE,
            ErrorKind::Protocol | ErrorKind::Permanent => EX_PROTOCOL,
            ErrorKind::Transient => EX_TEMPFAIL,
            ErrorKind::Config => EX_CONFIG,
            // Never escapes the orchestrator; if it does, that's a bug.
            ErrorKind::NotFound => EX_SOFTWARE,
        }
    }
}

/// Whether this I/O error is a read timeout firing rather than a real
/// failure.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Convert an I/O error, naming what was being waited for if it was a
/// timeout.
pub fn timeout_as(e: io::Error, what: &'static str) -> Error {
    if is_timeout(&e) {
        Error::Timeout(what)
    } else {
        Error::Io(e)
    }
}
