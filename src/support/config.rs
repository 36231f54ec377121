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

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::Error;
use crate::model::{Envelope, Keyword};

/// The relay configuration.
///
/// This is stored in a TOML file, `mettmail.toml` in the working directory
/// unless given on the command line.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// The keyword set on messages once they have been delivered.
    #[serde(default)]
    pub done_flag: Keyword,

    pub imap: ImapConfig,

    pub lmtp: LmtpConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS from the first byte.
    Tls,
    /// Cleartext greeting, then upgrade with STARTTLS.
    StartTls,
    /// No TLS at all.
    Plain,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ImapConfig {
    pub host: String,
    /// Defaults to 993 for `tls` and 143 otherwise.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_imap_tls")]
    pub tls: TlsMode,
    /// Skip certificate verification. Only for test setups.
    #[serde(default)]
    pub allow_insecure_tls: bool,
    pub user: String,
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Seconds to wait for the TCP connection to be established.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds to wait for the server to answer any command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    /// Seconds after which IDLE is restarted even without activity.
    ///
    /// RFC 2177 has servers drop idling clients after 30 minutes, so the
    /// default stays just below that.
    #[serde(default = "default_idle_refresh")]
    pub idle_refresh: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LmtpConfig {
    /// Host to connect to over TCP. Exactly one of `host` and `socket` must be
    /// given.
    #[serde(default)]
    pub host: Option<String>,
    /// Path of a UNIX socket to connect to instead of TCP.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    /// Defaults to 24.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_lmtp_tls")]
    pub tls: TlsMode,
    #[serde(default)]
    pub allow_insecure_tls: bool,
    /// Used only for the envelope; never confused with the `From` header.
    #[serde(default = "default_envelope_sender")]
    pub envelope_sender: String,
    /// All mail goes to this one recipient.
    pub envelope_recipient: String,
    /// The name announced in LHLO.
    #[serde(default = "default_local_hostname")]
    pub local_hostname: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

fn default_imap_tls() -> TlsMode {
    TlsMode::Tls
}

fn default_lmtp_tls() -> TlsMode {
    TlsMode::Plain
}

fn default_mailbox() -> String {
    "INBOX".to_owned()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    60
}

fn default_idle_refresh() -> u64 {
    29 * 60
}

fn default_envelope_sender() -> String {
    "mettmail@localhost".to_owned()
}

fn default_local_hostname() -> String {
    "localhost".to_owned()
}

impl RelayConfig {
    /// Read, parse, and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read(path).map_err(|e| {
            Error::Config(format!("error reading '{}': {}", path.display(), e))
        })?;
        let config: RelayConfig = toml::from_slice(&raw).map_err(|e| {
            Error::Config(format!("error in '{}': {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.imap.validate()?;
        self.lmtp.validate()
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            sender: self.lmtp.envelope_sender.clone(),
            recipient: self.lmtp.envelope_recipient.clone(),
        }
    }
}

impl ImapConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("imap.host is empty".to_owned()));
        }
        if self.mailbox.is_empty() {
            return Err(Error::Config("imap.mailbox is empty".to_owned()));
        }
        if 0 == self.connect_timeout
            || 0 == self.command_timeout
            || 0 == self.idle_refresh
        {
            return Err(Error::Config(
                "imap timeouts must be at least one second".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.tls {
            TlsMode::Tls => 993,
            TlsMode::StartTls | TlsMode::Plain => 143,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn idle_refresh(&self) -> Duration {
        Duration::from_secs(self.idle_refresh)
    }
}

impl LmtpConfig {
    fn validate(&self) -> Result<(), Error> {
        match (&self.host, &self.socket) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "lmtp.host and lmtp.socket are mutually exclusive"
                        .to_owned(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "one of lmtp.host or lmtp.socket is required".to_owned(),
                ))
            }
            (Some(host), None) if host.is_empty() => {
                return Err(Error::Config("lmtp.host is empty".to_owned()))
            }
            (None, Some(_)) if TlsMode::Plain != self.tls => {
                return Err(Error::Config(
                    "TLS is not supported over lmtp.socket".to_owned(),
                ))
            }
            _ => (),
        }

        if self.envelope_recipient.is_empty() {
            return Err(Error::Config(
                "lmtp.envelope_recipient is required".to_owned(),
            ));
        }
        if self.envelope_sender.is_empty() {
            return Err(Error::Config(
                "lmtp.envelope_sender is empty".to_owned(),
            ));
        }
        if 0 == self.connect_timeout || 0 == self.command_timeout {
            return Err(Error::Config(
                "lmtp timeouts must be at least one second".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(24)
    }

    /// A short name for the endpoint, for log messages.
    pub fn endpoint(&self) -> String {
        match (&self.host, &self.socket) {
            (Some(host), _) => format!("{}:{}", host, self.port()),
            (None, Some(socket)) => socket.display().to_string(),
            (None, None) => "<unset>".to_owned(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}
