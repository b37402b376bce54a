//! Key exchange messages carried as TLS plaintext.
//!
//! Key method 1, each side sends the key it will encrypt with:
//!
//! ```text
//! cipher_len u8 | cipher key | hmac_len u8 | hmac key | options
//! ```
//!
//! Key method 2, each side sends random material for the PRF:
//!
//! ```text
//! 0u32 | 2u8 | [pre_master 48, client only] | random1 32 | random2 32 | options
//! ```
//!
//! A client's key method 2 message continues with `username | password`,
//! empty when it has no credentials.
//!
//! Strings are a u16 length (including the trailing NUL) followed by the
//! NUL terminated text. Length 0 is an empty username or password, but
//! never valid for options. TLS is a byte stream, so parsing is streaming
//! and a partial message simply waits for more plaintext.

use nom::bytes::streaming::take;
use nom::number::streaming::{be_u16, be_u32, be_u8};
use nom::IResult;

use crate::config::KeyMethod;
use crate::crypto::{CryptoPolicy, KeyMaterial, KeySource};
use crate::verify::Credentials;
use crate::Error;

/// Longest options string accepted, including the NUL.
pub const TLS_OPTIONS_LEN: usize = 512;

/// Longest username or password accepted, including the NUL.
pub const USER_PASS_LEN: usize = 128;

/// Label for [`KeyDerivation::TlsExporter`][crate::KeyDerivation::TlsExporter].
pub const EXPORTER_LABEL: &str = "EXPORTER-OpenVPN-datakeys";

pub(crate) enum KeyMessage {
    V1 {
        key: KeyMaterial,
        options: String,
    },
    V2 {
        source: KeySource,
        options: String,
        /// Only from a client, and only if it sent a username or password.
        credentials: Option<Credentials>,
    },
}

impl KeyMessage {
    pub fn options(&self) -> &str {
        match self {
            KeyMessage::V1 { options, .. } | KeyMessage::V2 { options, .. } => options,
        }
    }

    pub fn take_credentials(&mut self) -> Option<Credentials> {
        match self {
            KeyMessage::V1 { .. } => None,
            KeyMessage::V2 { credentials, .. } => credentials.take(),
        }
    }
}

pub(crate) fn write_v1(
    key: &KeyMaterial,
    policy: &CryptoPolicy,
    options: &str,
    out: &mut Vec<u8>,
) {
    let cipher_len = policy.cipher.key_len();
    let hmac_len = policy.digest.output_len();
    out.push(cipher_len as u8);
    out.extend_from_slice(&key.cipher()[..cipher_len]);
    out.push(hmac_len as u8);
    out.extend_from_slice(&key.hmac()[..hmac_len]);
    write_options(options, out);
}

/// `credentials` is only written by a client.
pub(crate) fn write_v2(
    source: &KeySource,
    client: bool,
    options: &str,
    credentials: Option<&Credentials>,
    out: &mut Vec<u8>,
) {
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(KeyMethod::V2.as_u8());
    source.write(client, out);
    write_options(options, out);
    if client {
        write_string(credentials.map_or("", |c| c.username()), out);
        write_string(credentials.map_or("", |c| c.password()), out);
    }
}

fn write_options(options: &str, out: &mut Vec<u8>) {
    let len = options.len() + 1;
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(options.as_bytes());
    out.push(0);
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    if s.is_empty() {
        out.extend_from_slice(&0u16.to_be_bytes());
    } else {
        write_options(s, out);
    }
}

/// Try to parse the peer's key message from the front of `input`.
///
/// `Ok(None)` means more plaintext is needed. On success returns the
/// message and the number of bytes it used.
pub(crate) fn parse(
    input: &[u8],
    method: KeyMethod,
    policy: &CryptoPolicy,
    from_client: bool,
) -> Result<Option<(KeyMessage, usize)>, Error> {
    let result = match method {
        KeyMethod::V1 => parse_v1(input, policy),
        KeyMethod::V2 => parse_v2(input, from_client),
    };
    match result {
        Ok((rest, msg)) => Ok(Some((msg, input.len() - rest.len()))),
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(e) => Err(Error::ParseError(format!(
            "Bad key method {} message: {:?}",
            method.as_u8(),
            e.map_input(|i| i.len())
        ))),
    }
}

fn parse_v1<'a>(input: &'a [u8], policy: &CryptoPolicy) -> IResult<&'a [u8], KeyMessage> {
    let (input, cipher_len) = be_u8(input)?;
    if cipher_len as usize != policy.cipher.key_len() {
        return Err(verify_failure(input));
    }
    let (input, cipher) = take(cipher_len)(input)?;
    let (input, hmac_len) = be_u8(input)?;
    if hmac_len as usize != policy.digest.output_len() {
        return Err(verify_failure(input));
    }
    let (input, hmac) = take(hmac_len)(input)?;
    let (input, options) = parse_options(input)?;
    let key = KeyMaterial::new(cipher, hmac);
    Ok((input, KeyMessage::V1 { key, options }))
}

fn parse_v2(input: &[u8], from_client: bool) -> IResult<&[u8], KeyMessage> {
    let (input, zero) = be_u32(input)?;
    let (input, method) = be_u8(input)?;
    if zero != 0 || method != KeyMethod::V2.as_u8() {
        return Err(verify_failure(input));
    }
    let len = if from_client {
        KeySource::CLIENT_LEN
    } else {
        KeySource::SERVER_LEN
    };
    let (input, raw) = take(len)(input)?;
    let Some(source) = KeySource::read(raw, from_client) else {
        return Err(verify_failure(input));
    };
    let (input, options) = parse_options(input)?;
    if !from_client {
        let credentials = None;
        return Ok((input, KeyMessage::V2 { source, options, credentials }));
    }

    let (input, username) = parse_string(input, USER_PASS_LEN)?;
    let (input, password) = parse_string(input, USER_PASS_LEN)?;
    let credentials = if username.is_empty() && password.is_empty() {
        None
    } else {
        Some(Credentials::new(username, password))
    };
    Ok((input, KeyMessage::V2 { source, options, credentials }))
}

fn parse_options(input: &[u8]) -> IResult<&[u8], String> {
    let (rest, len) = be_u16(input)?;
    if len == 0 {
        return Err(verify_failure(rest));
    }
    parse_string(input, TLS_OPTIONS_LEN)
}

fn parse_string(input: &[u8], max: usize) -> IResult<&[u8], String> {
    let (input, len) = be_u16(input)?;
    let len = len as usize;
    if len == 0 {
        return Ok((input, String::new()));
    }
    if len > max {
        return Err(verify_failure(input));
    }
    let (input, raw) = take(len)(input)?;
    let (text, nul) = raw.split_at(len - 1);
    if nul != [0] {
        return Err(verify_failure(input));
    }
    match std::str::from_utf8(text) {
        Ok(s) => Ok((input, s.to_string())),
        Err(_) => Err(verify_failure(input)),
    }
}

fn verify_failure(input: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Verify,
    ))
}
