//! Peer identity checks that sit on top of the TLS engine's verification.
//!
//! A server can additionally ask the client for a username and password
//! and hand them to a [`UserPassVerifier`]. The verifier may answer at
//! once or defer, in which case the application settles the key later with
//! [`TlsMultiplexer::authenticate_key`][crate::TlsMultiplexer::authenticate_key].

use std::fmt;

use zeroize::Zeroizing;

use crate::tls::PeerIdentity;

/// Characters kept in a common name. Anything else becomes `_`.
fn is_cn_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@')
}

/// Reduce a certificate common name to a safe character set.
///
/// The result is used in logs and compared across renegotiations, so it
/// must not carry control characters or shell metacharacters.
pub fn sanitize_common_name(cn: &str) -> String {
    cn.chars()
        .map(|c| if is_cn_char(c) { c } else { '_' })
        .collect()
}

/// Username and password a client sends in its key message.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What a [`UserPassVerifier`] is asked to decide.
#[derive(Debug)]
pub struct UserPassRequest<'a> {
    /// Identifies the key for a later
    /// [`authenticate_key`][crate::TlsMultiplexer::authenticate_key].
    pub auth_id: u32,
    /// Username, reduced to the common name character set.
    pub username: &'a str,
    pub password: &'a str,
    /// Sanitized common name of the client certificate, if any.
    pub common_name: Option<&'a str>,
}

/// Outcome of a username/password check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Accept,
    Reject,
    /// Decided later through
    /// [`authenticate_key`][crate::TlsMultiplexer::authenticate_key]. Until
    /// then the key carries no data.
    Defer,
}

/// Server side hook checking a client's username and password.
///
/// Called once per negotiated key, renegotiations included.
pub trait UserPassVerifier: Send + Sync + fmt::Debug {
    fn verify(&self, request: &UserPassRequest<'_>) -> AuthVerdict;
}

/// Pins the peer's common name and certificate hash from the first
/// successful handshake. A later handshake presenting something else
/// must not be trusted.
///
/// The username of a client that authenticated with a password is pinned
/// the same way, whether or not the certificate identity is locked.
#[derive(Debug, Default)]
pub struct IdentityLock {
    enabled: bool,
    common_name: Option<String>,
    cert_hash: Option<[u8; 20]>,
    username: Option<String>,
}

impl IdentityLock {
    pub fn new(enabled: bool) -> Self {
        IdentityLock {
            enabled,
            ..Default::default()
        }
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Check `identity` against the lock, locking on first use.
    ///
    /// Returns false if a previously seen value changed.
    pub fn check(&mut self, identity: &PeerIdentity) -> bool {
        let cn = identity.common_name.as_deref().map(sanitize_common_name);

        if !self.enabled {
            self.common_name = cn;
            self.cert_hash = identity.cert_hash;
            return true;
        }

        if let (Some(locked), Some(cn)) = (&self.common_name, &cn) {
            if locked != cn {
                warn!("Peer common name changed from '{}' to '{}'", locked, cn);
                return false;
            }
        }
        if let (Some(locked), Some(hash)) = (&self.cert_hash, &identity.cert_hash) {
            if locked != hash {
                warn!(
                    "Peer certificate changed from {} to {}",
                    hex::encode(locked),
                    hex::encode(hash)
                );
                return false;
            }
        }

        if self.common_name.is_none() {
            self.common_name = cn;
        }
        if self.cert_hash.is_none() {
            self.cert_hash = identity.cert_hash;
        }
        true
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Check a sanitized `username` against the lock, locking on first use.
    pub fn check_username(&mut self, username: &str) -> bool {
        match &self.username {
            Some(locked) if locked != username => {
                warn!("Username changed from '{}' to '{}'", locked, username);
                false
            }
            Some(_) => true,
            None => {
                self.username = Some(username.to_string());
                true
            }
        }
    }
}
