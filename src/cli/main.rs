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


use std::path::PathBuf;

use structopt::StructOpt;

use crate::support::sysexits::*;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    Run(RunSubcommand),
    /// Connect to both servers, report what would be relayed, and
    /// disconnect.
    ///
    /// Nothing is delivered and no flags are changed. Use this to verify the
    /// configuration and credentials before starting the relay for real.
    Check(CommonOptions),
}

#[derive(StructOpt)]
pub(super) struct CommonOptions {
    /// The configuration file.
    #[structopt(
        long,
        short,
        parse(from_os_str),
        default_value = "mettmail.toml"
    )]
    pub(super) config: PathBuf,

    /// Log the IMAP and LMTP conversations. Passwords are censored and
    /// message bodies are not shown.
    #[structopt(long)]
    pub(super) trace: bool,
}

/// Relay mail from the IMAP mailbox to the LMTP server until interrupted.
///
/// Every message in the mailbox lacking the done-flag is delivered over LMTP
/// and then flagged. After that, the relay waits for new mail with IMAP IDLE.
///
/// The process exits on the first error, with a status from sysexits.h
/// describing what went wrong. It is meant to be restarted by a supervisor;
/// messages that were not confirmed delivered are picked up again by the
/// next run.
#[derive(StructOpt)]
pub(super) struct RunSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Log at debug level.
    #[structopt(long)]
    pub(super) debug: bool,

    /// Configure logging with this log4rs configuration file instead.
    #[structopt(long, parse(from_os_str), conflicts_with = "syslog")]
    pub(super) log_config: Option<PathBuf>,

    /// Log to syslog (mail facility) instead of standard error.
    #[structopt(long)]
    pub(super) syslog: bool,
}

impl RunSubcommand {
    fn log_level(&self) -> log::LevelFilter {
        if self.common.trace {
            log::LevelFilter::Trace
        } else if self.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let exit = match cmd {
        Command::Run(cmd) => {
            init_logging(&cmd);
            super::run::run(cmd)
        }
        Command::Check(cmd) => {
            crate::init_simple_log(if cmd.trace {
                log::LevelFilter::Trace
            } else {
                log::LevelFilter::Warn
            });
            super::run::check(cmd)
        }
    };

    if EX_OK != exit {
        log::info!("Exiting with status {}", exit);
        exit.exit();
    }
}

fn init_logging(cmd: &RunSubcommand) {
    if let Some(ref log_config_file) = cmd.log_config {
        if let Err(e) =
            log4rs::init_file(log_config_file, log_config_deserializers())
        {
            eprintln!(
                "Failed to load logging configuration from '{}': {}",
                log_config_file.display(),
                e
            );
            EX_CONFIG.exit();
        }
    } else if cmd.syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let logger = match syslog::unix(formatter) {
            Ok(logger) => logger,
            Err(e) => {
                eprintln!("Failed to connect to syslog: {}", e);
                EX_UNAVAILABLE.exit()
            }
        };
        let level = cmd.log_level();
        if let Err(e) =
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(level))
        {
            eprintln!("Failed to initialise logging: {}", e);
            EX_SOFTWARE.exit();
        }
    } else {
        crate::init_simple_log(cmd.log_level());
    }
}

fn log_config_deserializers() -> log4rs::file::Deserializers {
    log4rs::file::Deserializers::new()
}
