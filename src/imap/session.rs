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

//! The relay's view of an IMAP server: one authenticated connection with one
//! selected mailbox.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::client::Client;
use super::response::{self, Code, Cond, FetchAtt, Response, Status, Untagged};
use crate::model::{Keyword, RawMessage, Uid};
use crate::support::config::{ImapConfig, TlsMode};
use crate::support::error::Error;
use crate::support::shutdown::Shutdown;
use crate::support::transport::Transport;
use crate::support::utf7;

/// How often the IDLE wait wakes up to look at the shutdown flag.
const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleEvent {
    /// The mailbox may have new messages.
    NewActivity,
    /// The refresh interval passed without anything happening.
    Timeout,
    /// Shutdown was requested while waiting.
    Interrupted,
}

pub struct ImapSession {
    client: Client,
    /// Upper-cased.
    capabilities: Vec<String>,
    uid_validity: Option<u32>,
    /// Set when an `EXISTS` shows up, cleared when a search starts.
    pending_activity: bool,
}

impl ImapSession {
    /// Connect to the server, log in, and select the configured mailbox.
    pub fn connect(
        config: &ImapConfig,
        done_flag: &Keyword,
        trace: bool,
    ) -> Result<Self, Error> {
        let transport = Transport::connect_tcp(
            &config.host,
            config.port(),
            config.connect_timeout(),
        )?;
        let transport = if TlsMode::Tls == config.tls {
            transport.set_read_timeout(Some(config.command_timeout()))?;
            transport.start_tls(&config.host, config.allow_insecure_tls)?
        } else {
            transport
        };

        let client = Client::new(
            transport,
            format!("imap[{}]", config.host),
            trace,
            config.command_timeout(),
        )?;
        Self::handshake(client, config, done_flag)
    }

    /// Everything `connect` does after the transport is up.
    fn handshake(
        client: Client,
        config: &ImapConfig,
        done_flag: &Keyword,
    ) -> Result<Self, Error> {
        let mut session = ImapSession {
            client,
            capabilities: Vec::new(),
            uid_validity: None,
            pending_activity: false,
        };

        let preauth = session.read_greeting()?;
        if TlsMode::StartTls == config.tls {
            if preauth {
                return Err(Error::Unsupported(
                    "STARTTLS on a pre-authenticated connection".to_owned(),
                ));
            }
            session = session.start_tls(config)?;
        }

        if !preauth {
            session.authenticate(&config.user, &config.password)?;
        }
        if session.capabilities.is_empty() {
            session.refresh_capabilities()?;
        }
        if !session.has_idle() {
            warn!(
                "{} Server does not support IDLE; new mail will only be \
                 picked up on restart",
                session.client.log_prefix()
            );
        }

        session.select(&config.mailbox, done_flag)?;
        Ok(session)
    }

    pub fn has_idle(&self) -> bool {
        self.has_capability("IDLE")
    }

    fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    pub fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    /// Return the UIDs of all messages lacking `flag`, ascending.
    pub fn search_unflagged(
        &mut self,
        flag: &Keyword,
    ) -> Result<Vec<Uid>, Error> {
        // Anything that arrives from here on is covered by this search, or
        // will trigger another one.
        self.pending_activity = false;

        let command = format!("UID SEARCH UNKEYWORD {}", flag);
        let mut buffer = Vec::new();
        let (untagged, status) = self.command(&command, &mut buffer)?;
        require_ok(&command, &status)?;

        let mut uids = untagged
            .into_iter()
            .filter_map(|u| match u {
                Untagged::Search(hits) => Some(hits),
                _ => None,
            })
            .flatten()
            .filter_map(Uid::of)
            .collect::<Vec<_>>();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    /// Fetch the full message with the given UID without marking it
    /// `\Seen`.
    pub fn fetch(&mut self, uid: Uid) -> Result<RawMessage, Error> {
        let command =
            format!("UID FETCH {} (UID FLAGS RFC822.SIZE BODY.PEEK[])", uid);
        let mut buffer = Vec::new();
        let (untagged, status) = self.command(&command, &mut buffer)?;
        require_ok(&command, &status)?;

        let fetches = untagged
            .into_iter()
            .filter_map(|u| match u {
                Untagged::Fetch(_, atts) => Some(atts),
                _ => None,
            })
            .collect::<Vec<_>>();

        // Other FETCH responses may be unsolicited flag updates for other
        // messages.
        let mut matching = fetches
            .iter()
            .filter(|atts| {
                atts.iter()
                    .any(|a| matches!(*a, FetchAtt::Uid(u) if u == uid.get()))
            })
            .collect::<Vec<_>>();

        if matching.is_empty() {
            let anonymous = fetches
                .iter()
                .filter(|atts| {
                    !atts.iter().any(|a| matches!(*a, FetchAtt::Uid(_)))
                        && atts.iter().any(|a| matches!(*a, FetchAtt::Body(_)))
                })
                .collect::<Vec<_>>();
            if 1 == anonymous.len() {
                warn!(
                    "{} FETCH response for UID {} lacks the UID item",
                    self.client.log_prefix(),
                    uid
                );
                matching = anonymous;
            }
        }

        if matching.is_empty() {
            return Err(Error::NotFound(uid));
        }

        let mut flags: Option<Vec<String>> = None;
        let mut size: Option<u32> = None;
        let mut body: Option<Vec<u8>> = None;
        for atts in matching {
            for att in atts {
                match *att {
                    FetchAtt::Flags(ref f) => {
                        flags = Some(f.iter().map(|f| f.to_string()).collect())
                    }
                    FetchAtt::Rfc822Size(s) => size = Some(s),
                    FetchAtt::Body(ref b) => {
                        body = b.as_ref().map(|b| b.to_vec())
                    }
                    FetchAtt::Uid(_) | FetchAtt::Other(_) => (),
                }
            }
        }

        let data = body.ok_or_else(|| {
            Error::Protocol(format!("No BODY[] returned for UID {}", uid))
        })?;
        match size {
            Some(size) if size as usize == data.len() => (),
            Some(size) => {
                return Err(Error::Protocol(format!(
                    "UID {} has RFC822.SIZE {} but BODY[] is {} bytes",
                    uid,
                    size,
                    data.len()
                )))
            }
            None => {
                return Err(Error::Protocol(format!(
                    "No RFC822.SIZE returned for UID {}",
                    uid
                )))
            }
        }

        Ok(RawMessage {
            uid,
            flags: flags.unwrap_or_default(),
            data,
        })
    }

    /// Add `flag` to the message with the given UID.
    pub fn set_done_flag(
        &mut self,
        uid: Uid,
        flag: &Keyword,
    ) -> Result<(), Error> {
        let command = format!("UID STORE {} +FLAGS.SILENT ({})", uid, flag);
        let mut buffer = Vec::new();
        let (_, status) = self.command(&command, &mut buffer)?;
        require_ok(&command, &status)
    }

    /// Wait until the mailbox changes, `timeout` passes, or shutdown is
    /// requested.
    ///
    /// If an earlier command already saw new messages arrive, this returns
    /// `NewActivity` without going idle.
    pub fn idle_wait(
        &mut self,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<IdleEvent, Error> {
        if self.pending_activity {
            self.pending_activity = false;
            return Ok(IdleEvent::NewActivity);
        }
        if shutdown.is_requested() {
            return Ok(IdleEvent::Interrupted);
        }

        let tag = self.client.send_command("IDLE")?;
        self.await_continuation(|status| {
            Error::Protocol(format!("IDLE refused: {}", status.quip))
        })?;
        debug!("{} Idling", self.client.log_prefix());

        let tick = IDLE_TICK.min(timeout).max(Duration::from_millis(10));
        self.client.set_read_timeout(Some(tick))?;
        let event = self.idle_loop(Instant::now() + timeout, tick, shutdown);
        self.client.restore_read_timeout()?;
        let event = event?;

        self.client.write_raw(b"DONE\r\n")?;
        let mut buffer = Vec::new();
        let responses =
            self.client.read_responses_until_tagged(&tag, &mut buffer)?;
        let (_, status) = self.finish(responses)?;
        require_ok("IDLE", &status)?;

        if IdleEvent::NewActivity == event {
            self.pending_activity = false;
        }
        debug!("{} Idle ended: {:?}", self.client.log_prefix(), event);
        Ok(event)
    }

    fn idle_loop(
        &mut self,
        deadline: Instant,
        tick: Duration,
        shutdown: &Shutdown,
    ) -> Result<IdleEvent, Error> {
        let mut line = Vec::new();
        loop {
            // Also covers EXISTS seen before the continuation.
            if line.is_empty() && self.pending_activity {
                return Ok(IdleEvent::NewActivity);
            }

            if self.client.poll_logical_line(&mut line)? {
                match response::parse(&line[..line.len() - 2])? {
                    Response::Untagged(u) => self.observe(&u)?,
                    Response::Continuation(_) => (),
                    Response::Tagged(..) => {
                        return Err(Error::Protocol(format!(
                            "Unexpected completion during IDLE: {}",
                            response::excerpt(&line)
                        )))
                    }
                }
                line.clear();
                self.client.set_read_timeout(Some(tick))?;
            }

            let now = Instant::now();
            if !line.is_empty() {
                // Half a line; DONE can't be sent until the rest is in.
                if now >= deadline + self.client.command_timeout() {
                    return Err(Error::Timeout("IMAP response"));
                }
                continue;
            }

            if shutdown.is_requested() {
                return Ok(IdleEvent::Interrupted);
            }
            if now >= deadline {
                return Ok(IdleEvent::Timeout);
            }
        }
    }

    /// Log out. Failures are only logged since the session is being thrown
    /// away either way.
    pub fn logout(mut self) {
        let mut buffer = Vec::new();
        match self.client.command("LOGOUT", &mut buffer) {
            Ok(_) => debug!("{} Logged out", self.client.log_prefix()),
            Err(e) => {
                debug!("{} LOGOUT failed: {}", self.client.log_prefix(), e)
            }
        }
    }

    fn read_greeting(&mut self) -> Result<bool, Error> {
        let mut buffer = Vec::new();
        let status = match self.client.read_one_response(&mut buffer)? {
            Response::Untagged(Untagged::Status(status)) => status,
            other => {
                return Err(Error::Protocol(format!(
                    "Bad greeting: {:?}",
                    other
                )))
            }
        };

        self.observe_code(&status.code);
        match status.cond {
            Cond::Ok => Ok(false),
            Cond::Preauth => Ok(true),
            Cond::Bye => Err(Error::Refused(status.quip.into_owned())),
            Cond::No | Cond::Bad => Err(Error::Protocol(format!(
                "Bad greeting: {:?} {}",
                status.cond, status.quip
            ))),
        }
    }

    fn start_tls(mut self, config: &ImapConfig) -> Result<Self, Error> {
        if self.capabilities.is_empty() {
            self.refresh_capabilities()?;
        }
        if !self.has_capability("STARTTLS") {
            return Err(Error::Unsupported("STARTTLS".to_owned()));
        }

        let mut buffer = Vec::new();
        let (_, status) = self.command("STARTTLS", &mut buffer)?;
        require_ok("STARTTLS", &status)?;

        let ImapSession {
            client,
            uid_validity,
            pending_activity,
            ..
        } = self;
        let client = client.start_tls(&config.host, config.allow_insecure_tls)?;
        debug!("{} TLS established", client.log_prefix());

        // Anything learnt before the handshake can't be trusted.
        let mut session = ImapSession {
            client,
            capabilities: Vec::new(),
            uid_validity,
            pending_activity,
        };
        session.refresh_capabilities()?;
        Ok(session)
    }

    fn authenticate(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<(), Error> {
        if self.capabilities.is_empty() {
            self.refresh_capabilities()?;
        }

        if !self.client.is_tls() {
            warn!(
                "{} Sending credentials over an unencrypted connection",
                self.client.log_prefix()
            );
        }

        let tag = if self.has_capability("AUTH=PLAIN") {
            self.authenticate_plain(user, password)?
        } else if self.has_capability("LOGINDISABLED") {
            return Err(Error::Auth(
                "server disallows LOGIN and does not offer AUTH=PLAIN"
                    .to_owned(),
            ));
        } else {
            self.login(user, password)?
        };

        // The server may advertise more once we're logged in.
        self.capabilities.clear();

        let mut buffer = Vec::new();
        let responses =
            self.client.read_responses_until_tagged(&tag, &mut buffer)?;
        let (_, status) = self.finish(responses)?;
        match status.cond {
            Cond::Ok => {
                info!("{} Logged in as {}", self.client.log_prefix(), user);
                Ok(())
            }
            Cond::No => Err(Error::Auth(status.quip.into_owned())),
            _ => Err(Error::Protocol(format!(
                "Login rejected: {}",
                status.quip
            ))),
        }
    }

    /// Send `AUTHENTICATE PLAIN` with its response; returns the tag whose
    /// completion is still to be read.
    fn authenticate_plain(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<String, Error> {
        let tag = self.client.send_command("AUTHENTICATE PLAIN")?;
        self.await_continuation(|status| {
            Error::Auth(format!("AUTHENTICATE refused: {}", status.quip))
        })?;

        let mut credentials =
            Vec::with_capacity(user.len() + password.len() + 2);
        credentials.push(0);
        credentials.extend_from_slice(user.as_bytes());
        credentials.push(0);
        credentials.extend_from_slice(password.as_bytes());
        let mut line = base64::encode(&credentials);
        line.push_str("\r\n");
        self.client.write_raw_censored(line.as_bytes())?;
        Ok(tag)
    }

    /// Send `LOGIN`, using literals for anything that can't be quoted.
    fn login(&mut self, user: &str, password: &str) -> Result<String, Error> {
        let tag = self.client.allocate_tag();
        let mut pending = format!("{} LOGIN", tag).into_bytes();
        for value in &[user, password] {
            pending.push(b' ');
            if let Some(quoted) = quote(value) {
                pending.extend_from_slice(quoted.as_bytes());
            } else {
                pending.extend_from_slice(
                    format!("{{{}}}\r\n", value.len()).as_bytes(),
                );
                self.client.write_raw_censored(&pending)?;
                pending.clear();
                self.await_continuation(|status| {
                    Error::Auth(format!("LOGIN refused: {}", status.quip))
                })?;
                pending.extend_from_slice(value.as_bytes());
            }
        }
        pending.extend_from_slice(b"\r\n");
        self.client.write_raw_censored(&pending)?;
        Ok(tag)
    }

    fn select(
        &mut self,
        mailbox: &str,
        done_flag: &Keyword,
    ) -> Result<(), Error> {
        let encoded = utf7::encode_mailbox(mailbox);
        let command = format!(
            "SELECT {}",
            quote(&encoded).ok_or_else(|| Error::Config(format!(
                "Mailbox name {:?} cannot be sent to the server",
                mailbox
            )))?
        );

        let mut buffer = Vec::new();
        let (untagged, status) = self.command(&command, &mut buffer)?;
        require_ok(&command, &status)?;

        if let Some(Code::Other(ref code)) = status.code {
            if code.eq_ignore_ascii_case("READ-ONLY") {
                return Err(Error::Unsupported(format!(
                    "writing to mailbox {}",
                    mailbox
                )));
            }
        }

        let storable = untagged
            .iter()
            .filter_map(|u| match *u {
                Untagged::Status(Status {
                    code: Some(Code::PermanentFlags(ref flags)),
                    ..
                }) => Some(flags),
                _ => None,
            })
            .flatten()
            .any(|f| "\\*" == f || done_flag.matches(f));
        if !storable {
            return Err(Error::Unsupported(format!(
                "storing the {} keyword in {}",
                done_flag, mailbox
            )));
        }

        let uid_validity = self.uid_validity.ok_or_else(|| {
            Error::Protocol(format!("No UIDVALIDITY for {}", mailbox))
        })?;
        info!(
            "{} Selected {} (UIDVALIDITY {})",
            self.client.log_prefix(),
            mailbox,
            uid_validity
        );

        // The initial scan covers whatever SELECT reported.
        self.pending_activity = false;
        Ok(())
    }

    fn refresh_capabilities(&mut self) -> Result<(), Error> {
        let mut buffer = Vec::new();
        let (_, status) = self.command("CAPABILITY", &mut buffer)?;
        require_ok("CAPABILITY", &status)?;
        debug!(
            "{} Capabilities: {}",
            self.client.log_prefix(),
            self.capabilities.join(" ")
        );
        Ok(())
    }

    /// Read responses until a continuation request arrives. A tagged
    /// response instead is turned into an error with `refused`.
    fn await_continuation(
        &mut self,
        refused: impl FnOnce(&Status<'_>) -> Error,
    ) -> Result<(), Error> {
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match self.client.read_one_response(&mut buffer)? {
                Response::Continuation(_) => return Ok(()),
                Response::Untagged(u) => self.observe(&u)?,
                Response::Tagged(_, status) => return Err(refused(&status)),
            }
        }
    }

    fn command<'a>(
        &mut self,
        command: &str,
        buffer: &'a mut Vec<u8>,
    ) -> Result<(Vec<Untagged<'a>>, Status<'a>), Error> {
        let responses = self.client.command(command, buffer)?;
        self.finish(responses)
    }

    /// Split a command's responses into the untagged ones and the final
    /// status, applying everything the untagged responses tell us.
    fn finish<'a>(
        &mut self,
        mut responses: Vec<Response<'a>>,
    ) -> Result<(Vec<Untagged<'a>>, Status<'a>), Error> {
        let status = match responses.pop() {
            Some(Response::Tagged(_, status)) => status,
            _ => {
                return Err(Error::Protocol(
                    "Command did not complete".to_owned(),
                ))
            }
        };

        let mut untagged = Vec::with_capacity(responses.len());
        for response in responses {
            if let Response::Untagged(u) = response {
                self.observe(&u)?;
                untagged.push(u);
            }
        }

        self.observe_code(&status.code);
        Ok((untagged, status))
    }

    fn observe(&mut self, response: &Untagged<'_>) -> Result<(), Error> {
        match *response {
            Untagged::Status(ref status) => {
                if Cond::Bye == status.cond {
                    return Err(Error::Bye(status.quip.clone().into_owned()));
                }

                if let Some(Code::UidValidity(new)) = status.code {
                    match self.uid_validity {
                        Some(old) if old != new => {
                            return Err(Error::UidValidityChanged { old, new })
                        }
                        _ => self.uid_validity = Some(new),
                    }
                }

                if Cond::No == status.cond || Cond::Bad == status.cond {
                    warn!(
                        "{} Server warning: {}",
                        self.client.log_prefix(),
                        status.quip
                    );
                }

                self.observe_code(&status.code);
            }
            Untagged::Capability(ref caps) => {
                self.set_capabilities(caps);
            }
            Untagged::Exists(n) => {
                debug!(
                    "{} {} messages in mailbox",
                    self.client.log_prefix(),
                    n
                );
                self.pending_activity = true;
            }
            _ => (),
        }

        Ok(())
    }

    fn observe_code(&mut self, code: &Option<Code<'_>>) {
        if let Some(Code::Capability(ref caps)) = *code {
            self.set_capabilities(caps);
        }
    }

    fn set_capabilities(&mut self, caps: &[std::borrow::Cow<'_, str>]) {
        self.capabilities =
            caps.iter().map(|c| c.to_ascii_uppercase()).collect();
    }
}

fn require_ok(command: &str, status: &Status<'_>) -> Result<(), Error> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "{} failed: {:?} {}",
            command, status.cond, status.quip
        )))
    }
}

/// Format `s` as an IMAP quoted string, if it can be one.
fn quote(s: &str) -> Option<String> {
    if !s.bytes().all(|b| (b' '..=b'~').contains(&b)) {
        return None;
    }

    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for ch in s.chars() {
        if '"' == ch || '\\' == ch {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    Some(quoted)
}

#[cfg(test)]
mod test {
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::thread::{self, JoinHandle};

    use super::*;

    const GREETING: &str =
        "* OK [CAPABILITY IMAP4rev1 IDLE AUTH=PLAIN] Fake IMAP ready\r\n";
    const SELECTED: &str = "* FLAGS (\\Seen \\Deleted)\r\n\
         * OK [PERMANENTFLAGS (\\Seen \\Deleted \\*)] Ok\r\n\
         * 3 EXISTS\r\n\
         * OK [UIDVALIDITY 42] Ok\r\n\
         $TAG OK [READ-WRITE] Selected\r\n";

    type Script = Vec<(&'static str, &'static str)>;

    /// Run a fake server over a socket pair.
    ///
    /// Each step reads one line from the client (unless the expectation is
    /// empty), checks that the command after the tag starts with the
    /// expectation, and sends the answer with `$TAG` replaced by the tag of
    /// the last tagged command. An expectation starting with `~` is matched
    /// against a whole untagged line.
    fn serve(script: Script) -> (Client, JoinHandle<()>) {
        crate::init_test_log();

        let (client_io, server_io) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let mut reader = BufReader::new(server_io.try_clone().unwrap());
            let mut writer = server_io;
            let mut tag = String::new();

            for (expected, answer) in script {
                if !expected.is_empty() {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    let line = line.trim_end_matches("\r\n");

                    if expected.starts_with('~') {
                        assert_eq!(&expected[1..], line);
                    } else {
                        let mut parts = line.splitn(2, ' ');
                        tag = parts.next().unwrap().to_owned();
                        let command = parts.next().unwrap_or("");
                        assert!(
                            command.starts_with(expected),
                            "Expected {:?}, got {:?}",
                            expected,
                            command
                        );
                    }
                }

                writer
                    .write_all(answer.replace("$TAG", &tag).as_bytes())
                    .unwrap();
            }
        });

        let client = Client::new(
            Transport::from(client_io),
            "imap[test]".to_owned(),
            true,
            Duration::from_secs(5),
        )
        .unwrap();
        (client, server)
    }

    fn config(extra: &str) -> ImapConfig {
        toml::from_str(&format!(
            "host = \"imap.test\"\n\
             tls = \"plain\"\n\
             user = \"me\"\n\
             password = \"hunter2\"\n\
             {}",
            extra
        ))
        .unwrap()
    }

    fn flag() -> Keyword {
        Keyword::default()
    }

    fn login_script() -> Script {
        vec![
            ("", GREETING),
            ("AUTHENTICATE PLAIN", "+ \r\n"),
            (
                "~AG1lAGh1bnRlcjI=",
                "$TAG OK [CAPABILITY IMAP4rev1 IDLE] Logged in\r\n",
            ),
            ("SELECT \"INBOX\"", SELECTED),
        ]
    }

    fn session_with(steps: Script) -> (ImapSession, JoinHandle<()>) {
        let mut script = login_script();
        script.extend(steps);
        let (client, server) = serve(script);
        let session =
            ImapSession::handshake(client, &config(""), &flag()).unwrap();
        (session, server)
    }

    fn uids(raw: &[u32]) -> Vec<Uid> {
        raw.iter().map(|&u| Uid::of(u).unwrap()).collect()
    }

    #[test]
    fn connect_with_auth_plain() {
        let (session, server) = session_with(vec![]);
        assert!(session.has_idle());
        assert_eq!(Some(42), session.uid_validity());
        assert!(!session.pending_activity);
        server.join().unwrap();
    }

    #[test]
    fn login_fallback_uses_literals_when_needed() {
        let (client, server) = serve(vec![
            ("", "* OK Fake IMAP ready\r\n"),
            ("CAPABILITY", "* CAPABILITY IMAP4rev1\r\n$TAG OK Done\r\n"),
            ("LOGIN \"me\" {7}", "+ go on\r\n"),
            ("~pässwd", "$TAG OK Logged in\r\n"),
            ("CAPABILITY", "* CAPABILITY IMAP4rev1\r\n$TAG OK Done\r\n"),
            ("SELECT \"INBOX\"", SELECTED),
        ]);

        let mut config = config("");
        config.password = "pässwd".to_owned();
        let session =
            ImapSession::handshake(client, &config, &flag()).unwrap();
        assert!(!session.has_idle());
        server.join().unwrap();
    }

    #[test]
    fn bad_credentials_are_an_auth_error() {
        let (client, server) = serve(vec![
            ("", GREETING),
            ("AUTHENTICATE PLAIN", "+ \r\n"),
            (
                "~AG1lAGh1bnRlcjI=",
                "$TAG NO [AUTHENTICATIONFAILED] Nope\r\n",
            ),
        ]);

        assert_matches!(
            Err(Error::Auth(_)),
            ImapSession::handshake(client, &config(""), &flag()).map(|_| ())
        );
        server.join().unwrap();
    }

    #[test]
    fn login_disabled_without_plain_is_an_auth_error() {
        let (client, server) = serve(vec![(
            "",
            "* OK [CAPABILITY IMAP4rev1 LOGINDISABLED STARTTLS] Hi\r\n",
        )]);

        assert_matches!(
            Err(Error::Auth(_)),
            ImapSession::handshake(client, &config(""), &flag()).map(|_| ())
        );
        server.join().unwrap();
    }

    #[test]
    fn bye_greeting_is_refused() {
        let (client, server) =
            serve(vec![("", "* BYE Too many connections\r\n")]);
        match ImapSession::handshake(client, &config(""), &flag()) {
            Err(Error::Refused(ref msg)) => {
                assert_eq!("Too many connections", msg)
            }
            r => panic!("Unexpected result: {:?}", r.map(|_| ())),
        }
        server.join().unwrap();
    }

    #[test]
    fn preauth_skips_login_and_mailbox_is_encoded() {
        let (client, server) = serve(vec![
            ("", "* PREAUTH [CAPABILITY IMAP4rev1 IDLE] Welcome\r\n"),
            ("SELECT \"Entw&APw-rfe\"", SELECTED),
        ]);

        let session = ImapSession::handshake(
            client,
            &config("mailbox = \"Entwürfe\""),
            &flag(),
        )
        .unwrap();
        assert!(session.has_idle());
        server.join().unwrap();
    }

    #[test]
    fn select_requires_storable_keywords() {
        let (client, server) = serve(vec![
            ("", "* PREAUTH [CAPABILITY IMAP4rev1] Welcome\r\n"),
            (
                "SELECT",
                "* OK [PERMANENTFLAGS (\\Seen \\Deleted)] Ok\r\n\
                 * OK [UIDVALIDITY 1] Ok\r\n\
                 $TAG OK [READ-WRITE] Selected\r\n",
            ),
        ]);

        assert_matches!(
            Err(Error::Unsupported(_)),
            ImapSession::handshake(client, &config(""), &flag()).map(|_| ())
        );
        server.join().unwrap();
    }

    #[test]
    fn explicitly_permitted_keyword_is_storable() {
        let (client, server) = serve(vec![
            ("", "* PREAUTH [CAPABILITY IMAP4rev1] Welcome\r\n"),
            (
                "SELECT",
                "* OK [PERMANENTFLAGS (\\Seen Mettmail-Fetched)] Ok\r\n\
                 * OK [UIDVALIDITY 1] Ok\r\n\
                 $TAG OK [READ-WRITE] Selected\r\n",
            ),
        ]);

        ImapSession::handshake(client, &config(""), &flag()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn read_only_mailbox_is_unsupported() {
        let (client, server) = serve(vec![
            ("", "* PREAUTH [CAPABILITY IMAP4rev1] Welcome\r\n"),
            (
                "SELECT",
                "* OK [PERMANENTFLAGS (\\*)] Ok\r\n\
                 * OK [UIDVALIDITY 1] Ok\r\n\
                 $TAG OK [READ-ONLY] Selected\r\n",
            ),
        ]);

        assert_matches!(
            Err(Error::Unsupported(_)),
            ImapSession::handshake(client, &config(""), &flag()).map(|_| ())
        );
        server.join().unwrap();
    }

    #[test]
    fn starttls_requires_capability() {
        let (client, server) =
            serve(vec![("", "* OK [CAPABILITY IMAP4rev1] Hi\r\n")]);

        let mut config = config("");
        config.tls = TlsMode::StartTls;
        assert_matches!(
            Err(Error::Unsupported(_)),
            ImapSession::handshake(client, &config, &flag()).map(|_| ())
        );
        server.join().unwrap();
    }

    #[test]
    fn search_is_sorted_and_deduplicated() {
        let (mut session, server) = session_with(vec![(
            "UID SEARCH UNKEYWORD mettmail-fetched",
            "* SEARCH 12 10\r\n* SEARCH 11 10\r\n$TAG OK Done\r\n",
        )]);

        assert_eq!(
            uids(&[10, 11, 12]),
            session.search_unflagged(&flag()).unwrap()
        );
        server.join().unwrap();
    }

    #[test]
    fn fetch_returns_exact_bytes_and_flags() {
        let (mut session, server) = session_with(vec![(
            "UID FETCH 10 (UID FLAGS RFC822.SIZE BODY.PEEK[])",
            "* 7 FETCH (FLAGS (\\Seen) UID 3)\r\n\
             * 1 FETCH (UID 10 FLAGS (\\Seen $Junk) RFC822.SIZE 14 \
             BODY[] {14}\r\nSubject: x\r\n\r\n)\r\n\
             $TAG OK Done\r\n",
        )]);

        let message = session.fetch(Uid::of(10).unwrap()).unwrap();
        assert_eq!(Uid::of(10).unwrap(), message.uid);
        assert_eq!(
            vec!["\\Seen".to_owned(), "$Junk".to_owned()],
            message.flags
        );
        assert_eq!(b"Subject: x\r\n\r\n".to_vec(), message.data);
        server.join().unwrap();
    }

    #[test]
    fn fetch_accepts_lone_response_without_uid() {
        let (mut session, server) = session_with(vec![(
            "UID FETCH 10",
            "* 7 FETCH (FLAGS (\\Seen))\r\n\
             * 1 FETCH (FLAGS () RFC822.SIZE 3 BODY[] {3}\r\nabc)\r\n\
             $TAG OK Done\r\n",
        )]);

        let message = session.fetch(Uid::of(10).unwrap()).unwrap();
        assert_eq!(Uid::of(10).unwrap(), message.uid);
        assert!(message.flags.is_empty());
        assert_eq!(b"abc".to_vec(), message.data);
        server.join().unwrap();
    }

    #[test]
    fn fetch_of_vanished_message_is_not_found() {
        let (mut session, server) = session_with(vec![(
            "UID FETCH 11",
            "$TAG OK Nothing to fetch\r\n",
        )]);

        match session.fetch(Uid::of(11).unwrap()) {
            Err(Error::NotFound(uid)) => assert_eq!(11, uid.get()),
            r => panic!("Unexpected result: {:?}", r),
        }
        server.join().unwrap();
    }

    #[test]
    fn fetch_size_mismatch_is_a_protocol_error() {
        let (mut session, server) = session_with(vec![(
            "UID FETCH 10",
            "* 1 FETCH (UID 10 FLAGS () RFC822.SIZE 99 BODY[] {3}\r\nabc)\r\n\
             $TAG OK Done\r\n",
        )]);

        assert_matches!(
            Err(Error::Protocol(_)),
            session.fetch(Uid::of(10).unwrap())
        );
        server.join().unwrap();
    }

    #[test]
    fn store_adds_flag_silently() {
        let (mut session, server) = session_with(vec![
            (
                "UID STORE 10 +FLAGS.SILENT (mettmail-fetched)",
                "$TAG OK Stored\r\n",
            ),
            ("UID STORE 11", "$TAG NO Permission denied\r\n"),
        ]);

        session.set_done_flag(Uid::of(10).unwrap(), &flag()).unwrap();
        assert_matches!(
            Err(Error::Protocol(_)),
            session.set_done_flag(Uid::of(11).unwrap(), &flag())
        );
        server.join().unwrap();
    }

    #[test]
    fn uid_validity_change_is_fatal() {
        let (mut session, server) = session_with(vec![(
            "UID SEARCH",
            "* OK [UIDVALIDITY 43] Mailbox recreated\r\n$TAG OK Done\r\n",
        )]);

        assert_matches!(
            Err(Error::UidValidityChanged { old: 42, new: 43 }),
            session.search_unflagged(&flag())
        );
        server.join().unwrap();
    }

    #[test]
    fn untagged_bye_is_a_connection_error() {
        let (mut session, server) = session_with(vec![(
            "UID SEARCH",
            "* BYE Shutting down\r\n",
        )]);

        match session.search_unflagged(&flag()) {
            Err(e) => assert_eq!(
                crate::support::error::ErrorKind::Connection,
                e.kind()
            ),
            r => panic!("Unexpected result: {:?}", r),
        }
        server.join().unwrap();
    }

    #[test]
    fn idle_reports_new_mail() {
        let (mut session, server) = session_with(vec![
            ("IDLE", "+ idling\r\n* 4 EXISTS\r\n"),
            ("~DONE", "$TAG OK IDLE terminated\r\n"),
        ]);

        assert_eq!(
            IdleEvent::NewActivity,
            session
                .idle_wait(Duration::from_secs(10), &Shutdown::manual())
                .unwrap()
        );
        assert!(!session.pending_activity);
        server.join().unwrap();
    }

    #[test]
    fn idle_reports_mail_announced_before_continuation() {
        let (mut session, server) = session_with(vec![
            ("IDLE", "* 4 EXISTS\r\n+ idling\r\n"),
            ("~DONE", "$TAG OK IDLE terminated\r\n"),
        ]);

        let start = Instant::now();
        assert_eq!(
            IdleEvent::NewActivity,
            session
                .idle_wait(Duration::from_secs(30), &Shutdown::manual())
                .unwrap()
        );
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!session.pending_activity);
        server.join().unwrap();
    }

    #[test]
    fn idle_times_out() {
        let (mut session, server) = session_with(vec![
            ("IDLE", "+ idling\r\n* 3 RECENT\r\n"),
            ("~DONE", "$TAG OK IDLE terminated\r\n"),
        ]);

        assert_eq!(
            IdleEvent::Timeout,
            session
                .idle_wait(Duration::from_millis(50), &Shutdown::manual())
                .unwrap()
        );
        server.join().unwrap();
    }

    #[test]
    fn idle_is_interrupted_by_shutdown() {
        let (mut session, server) = session_with(vec![
            ("IDLE", "+ idling\r\n"),
            ("~DONE", "$TAG OK IDLE terminated\r\n"),
        ]);

        let shutdown = Shutdown::manual();
        let trigger = shutdown.clone();
        let requester = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.request();
        });

        assert_eq!(
            IdleEvent::Interrupted,
            session.idle_wait(Duration::from_secs(30), &shutdown).unwrap()
        );
        requester.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn activity_seen_earlier_skips_idle() {
        let (mut session, server) = session_with(vec![(
            "UID STORE 10",
            "* 4 EXISTS\r\n$TAG OK Stored\r\n",
        )]);

        session.set_done_flag(Uid::of(10).unwrap(), &flag()).unwrap();
        // No IDLE step in the script; going idle would fail.
        assert_eq!(
            IdleEvent::NewActivity,
            session
                .idle_wait(Duration::from_secs(10), &Shutdown::manual())
                .unwrap()
        );
        server.join().unwrap();
    }

    #[test]
    fn quoting() {
        assert_eq!(Some("\"INBOX\"".to_owned()), quote("INBOX"));
        assert_eq!(Some("\"a\\\"b\\\\c\"".to_owned()), quote("a\"b\\c"));
        assert_eq!(None, quote("tab\there"));
        assert_eq!(None, quote("pässwd"));
    }
}
