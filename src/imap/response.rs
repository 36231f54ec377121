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

//! Parser for the server responses the relay cares about.
//!
//! Input is one logical response line: everything up to (but excluding) the
//! final CRLF, with any literals inline exactly as they came off the wire.
//!
//! Only the subset of RFC 3501 that the relay's own commands can provoke is
//! understood in depth. Other untagged responses come back as
//! `Untagged::Other` so that servers sending unsolicited data we have no use
//! for don't break anything. The one exception is `FETCH`: once a line is
//! known to be a FETCH response it must parse completely, since silently
//! ignoring one could make a message look absent.

use std::borrow::Cow;
use std::str;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case as kw, take, take_while1},
    character::complete::digit1,
    combinator::{cut, map, map_opt, opt, rest, value},
    multi::{many0, separated_list},
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};

use crate::support::error::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response<'a> {
    /// `+ text`
    Continuation(Cow<'a, str>),
    /// `tag OK|NO|BAD ...`
    Tagged(Cow<'a, str>, Status<'a>),
    /// `* ...`
    Untagged(Untagged<'a>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Ok,
    No,
    Bad,
    Preauth,
    Bye,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status<'a> {
    pub cond: Cond,
    pub code: Option<Code<'a>>,
    pub quip: Cow<'a, str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Code<'a> {
    Capability(Vec<Cow<'a, str>>),
    PermanentFlags(Vec<Cow<'a, str>>),
    UidValidity(u32),
    UidNext(u32),
    Other(Cow<'a, str>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Untagged<'a> {
    Status(Status<'a>),
    Capability(Vec<Cow<'a, str>>),
    Flags(Vec<Cow<'a, str>>),
    Search(Vec<u32>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Fetch(u32, Vec<FetchAtt<'a>>),
    Other(Cow<'a, str>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchAtt<'a> {
    Uid(u32),
    Flags(Vec<Cow<'a, str>>),
    Rfc822Size(u32),
    /// `BODY[]`; `None` if the server sent `NIL`.
    Body(Option<Cow<'a, [u8]>>),
    /// Any attribute we did not ask for.
    Other(Cow<'a, str>),
}

impl<'a> Status<'a> {
    pub fn is_ok(&self) -> bool {
        Cond::Ok == self.cond
    }
}

/// Parse one response line.
pub fn parse(line: &[u8]) -> Result<Response<'_>, Error> {
    match response(line) {
        Ok((remaining, r)) if remaining.is_empty() => Ok(r),
        Ok((remaining, _)) => Err(Error::Protocol(format!(
            "Trailing garbage in response: {}",
            excerpt(remaining)
        ))),
        Err(_) => Err(Error::Protocol(format!(
            "Unparseable response: {}",
            excerpt(line)
        ))),
    }
}

/// A short, printable piece of `data` for error messages.
///
/// Response lines can contain whole messages, which must not end up in logs.
pub fn excerpt(data: &[u8]) -> String {
    let end = memchr::memchr2(b'\r', b'\n', data)
        .unwrap_or(data.len())
        .min(80);
    let mut s = String::from_utf8_lossy(&data[..end]).into_owned();
    if end < data.len() {
        s.push_str("...");
    }
    s
}

fn response(i: &[u8]) -> IResult<&[u8], Response<'_>> {
    alt((
        map(
            preceded(tag("+"), opt(preceded(tag(" "), rest))),
            |text| {
                Response::Continuation(String::from_utf8_lossy(
                    text.unwrap_or(&b""[..]),
                ))
            },
        ),
        map(preceded(tag("* "), untagged), Response::Untagged),
        map(
            tuple((tag_atom, tag(" "), status)),
            |(tag, _, status)| Response::Tagged(tag, status),
        ),
    ))(i)
}

fn untagged(i: &[u8]) -> IResult<&[u8], Untagged<'_>> {
    alt((
        map(status, Untagged::Status),
        map(
            preceded(kw("CAPABILITY"), capability_list),
            Untagged::Capability,
        ),
        map(preceded(kw("FLAGS "), flag_list), Untagged::Flags),
        map(preceded(kw("SEARCH"), search_results), Untagged::Search),
        numbered,
        map(rest, |r| Untagged::Other(String::from_utf8_lossy(r))),
    ))(i)
}

fn numbered(i: &[u8]) -> IResult<&[u8], Untagged<'_>> {
    let (i, n) = terminated(number, tag(" "))(i)?;
    alt((
        map(kw("EXISTS"), move |_| Untagged::Exists(n)),
        map(kw("RECENT"), move |_| Untagged::Recent(n)),
        map(kw("EXPUNGE"), move |_| Untagged::Expunge(n)),
        map(preceded(kw("FETCH "), cut(msg_atts)), move |atts| {
            Untagged::Fetch(n, atts)
        }),
    ))(i)
}

fn status(i: &[u8]) -> IResult<&[u8], Status<'_>> {
    let (i, cond) = alt((
        value(Cond::Ok, kw("OK")),
        value(Cond::No, kw("NO")),
        value(Cond::Bad, kw("BAD")),
        value(Cond::Preauth, kw("PREAUTH")),
        value(Cond::Bye, kw("BYE")),
    ))(i)?;
    // Don't take `* NOTIFY ...` or similar for a status response.
    if !i.is_empty() && !i.starts_with(b" ") {
        return Err(nom::Err::Error((i, nom::error::ErrorKind::Tag)));
    }
    // Nothing at all after the condition violates RFC 3501 but is harmless.
    let (i, code) = opt(preceded(tag(" "), resp_code))(i)?;
    let (i, quip) = opt(preceded(tag(" "), rest))(i)?;

    Ok((
        i,
        Status {
            cond,
            code,
            quip: String::from_utf8_lossy(quip.unwrap_or(&b""[..])),
        },
    ))
}

fn resp_code(i: &[u8]) -> IResult<&[u8], Code<'_>> {
    delimited(
        tag("["),
        alt((
            map(
                preceded(kw("CAPABILITY"), capability_list),
                Code::Capability,
            ),
            map(
                preceded(kw("PERMANENTFLAGS "), flag_list),
                Code::PermanentFlags,
            ),
            map(preceded(kw("UIDVALIDITY "), number), Code::UidValidity),
            map(preceded(kw("UIDNEXT "), number), Code::UidNext),
            map(is_not("]"), |c| Code::Other(String::from_utf8_lossy(c))),
        )),
        tag("]"),
    )(i)
}

fn capability_list(i: &[u8]) -> IResult<&[u8], Vec<Cow<'_, str>>> {
    many0(preceded(tag(" "), atom))(i)
}

fn search_results(i: &[u8]) -> IResult<&[u8], Vec<u32>> {
    let (i, uids) = many0(preceded(tag(" "), number))(i)?;
    // RFC 7162 servers may append `(MODSEQ n)`; we never ask for it, but
    // tolerate it.
    let (i, _) = opt(preceded(tag(" "), paren_value))(i)?;
    Ok((i, uids))
}

fn msg_atts(i: &[u8]) -> IResult<&[u8], Vec<FetchAtt<'_>>> {
    delimited(tag("("), separated_list(tag(" "), msg_att), tag(")"))(i)
}

fn msg_att(i: &[u8]) -> IResult<&[u8], FetchAtt<'_>> {
    alt((
        map(preceded(kw("UID "), number), FetchAtt::Uid),
        map(preceded(kw("FLAGS "), flag_list), FetchAtt::Flags),
        map(preceded(kw("RFC822.SIZE "), number), FetchAtt::Rfc822Size),
        map(
            preceded(
                tuple((
                    kw("BODY[]"),
                    opt(delimited(tag("<"), number, tag(">"))),
                )),
                preceded(tag(" "), nstring),
            ),
            FetchAtt::Body,
        ),
        map(
            tuple((fetch_att_name, tag(" "), skip_value)),
            |(name, _, _)| FetchAtt::Other(name),
        ),
    ))(i)
}

fn flag_list(i: &[u8]) -> IResult<&[u8], Vec<Cow<'_, str>>> {
    delimited(tag("("), separated_list(tag(" "), flag), tag(")"))(i)
}

/// Skip over one value of unknown shape.
fn skip_value(i: &[u8]) -> IResult<&[u8], ()> {
    alt((
        value((), paren_value),
        value((), nstring),
        value((), fetch_att_name),
    ))(i)
}

fn paren_value(i: &[u8]) -> IResult<&[u8], ()> {
    value(
        (),
        delimited(tag("("), separated_list(tag(" "), skip_value), tag(")")),
    )(i)
}

// ==================== PRIMITIVE PARSERS ====================

fn atom(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

// Flags keep their backslash, and `\*` is legal in PERMANENTFLAGS.
fn flag(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'%' | b'"' | b']' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

fn tag_atom(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b'+' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

// Things like `BODY[HEADER]`, `MODSEQ`, `INTERNALDATE`, or a bare atom value.
fn fetch_att_name(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'"' => false,
            _ => true,
        }),
        String::from_utf8_lossy,
    )(i)
}

fn number(i: &[u8]) -> IResult<&[u8], u32> {
    map_opt(digit1, |s| {
        str::from_utf8(s).ok().and_then(|s| s.parse::<u32>().ok())
    })(i)
}

fn literal(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, len) = delimited(
        alt((tag("~{"), tag("{"))),
        number,
        alt((tag("+}\r\n"), tag("}\r\n"))),
    )(i)?;
    take(len)(i)
}

fn quoted_char(i: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(tag("\\"), alt((tag("\\"), tag("\""))))(i)
}

fn quoted_string_content(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((quoted_char, is_not("\r\n\"\\")))(i)
}

fn quoted(i: &[u8]) -> IResult<&[u8], Cow<'_, [u8]>> {
    let (i, pieces) =
        delimited(tag("\""), many0(quoted_string_content), tag("\""))(i)?;
    let content = match pieces.len() {
        0 => Cow::Borrowed(&b""[..]),
        1 => Cow::Borrowed(pieces[0]),
        _ => Cow::Owned(pieces.concat()),
    };
    Ok((i, content))
}

fn nstring(i: &[u8]) -> IResult<&[u8], Option<Cow<'_, [u8]>>> {
    alt((
        map(kw("NIL"), |_| None),
        map(quoted, Some),
        map(literal, |l| Some(Cow::Borrowed(l))),
    ))(i)
}
