use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{CipherKind, CryptoPolicy, DigestKind};
use crate::key_method::{TLS_OPTIONS_LEN, USER_PASS_LEN};
use crate::packet_id::{DEFAULT_REPLAY_WINDOW, MAX_REPLAY_WINDOW};
use crate::tls_auth::TlsAuthKey;
use crate::verify::{Credentials, UserPassVerifier};
use crate::Error;

/// How data channel keys are exchanged over TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMethod {
    /// Each side generates its own send key and ships it to the peer.
    V1,
    /// Both sides contribute random material and derive the keys.
    V2,
}

impl KeyMethod {
    pub fn as_u8(&self) -> u8 {
        match self {
            KeyMethod::V1 => 1,
            KeyMethod::V2 => 2,
        }
    }
}

/// Where key method 2 takes its key block from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivation {
    /// TLS 1.0 PRF over the exchanged key sources.
    Prf,
    /// The TLS engine's keying material exporter.
    TlsExporter,
}

/// Tunnel configuration.
///
/// Shared read-only, behind an `Arc`, by the multiplexer and everything it
/// owns.
#[derive(Debug, Clone)]
pub struct Config {
    key_method: KeyMethod,
    key_derivation: KeyDerivation,
    data_policy: CryptoPolicy,
    replay_window: usize,
    packet_timeout: Duration,
    retransmit_doublings: usize,
    handshake_window: Duration,
    transition_window: Duration,
    renegotiate_seconds: Option<Duration>,
    renegotiate_bytes: Option<u64>,
    renegotiate_packets: Option<u64>,
    control_payload_max: usize,
    options_string: Option<String>,
    tls_auth: Option<TlsAuthKey>,
    single_session: bool,
    lock_peer_identity: bool,
    credentials: Option<Credentials>,
    user_pass_verifier: Option<Arc<dyn UserPassVerifier>>,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            key_method: KeyMethod::V2,
            key_derivation: KeyDerivation::Prf,
            data_policy: CryptoPolicy {
                cipher: CipherKind::Aes128Cbc,
                digest: DigestKind::Sha1,
                use_iv: true,
                replay_protect: true,
                long_form: false,
            },
            replay_window: DEFAULT_REPLAY_WINDOW,
            packet_timeout: Duration::from_secs(2),
            retransmit_doublings: 5,
            handshake_window: Duration::from_secs(60),
            transition_window: Duration::from_secs(3600),
            renegotiate_seconds: Some(Duration::from_secs(3600)),
            renegotiate_bytes: None,
            renegotiate_packets: None,
            control_payload_max: 1100,
            options_string: None,
            tls_auth: None,
            single_session: false,
            lock_peer_identity: true,
            credentials: None,
            user_pass_verifier: None,
            rng_seed: None,
        }
    }

    #[inline(always)]
    pub fn key_method(&self) -> KeyMethod {
        self.key_method
    }

    #[inline(always)]
    pub fn key_derivation(&self) -> KeyDerivation {
        self.key_derivation
    }

    /// Cipher, digest and packet id settings of the data channel.
    #[inline(always)]
    pub fn data_policy(&self) -> &CryptoPolicy {
        &self.data_policy
    }

    /// Number of packet ids below the highest seen that are still accepted.
    #[inline(always)]
    pub fn replay_window(&self) -> usize {
        self.replay_window
    }

    /// First retransmit timeout of a control packet.
    #[inline(always)]
    pub fn packet_timeout(&self) -> Duration {
        self.packet_timeout
    }

    /// How many times the retransmit timeout doubles before it stays put.
    #[inline(always)]
    pub fn retransmit_doublings(&self) -> usize {
        self.retransmit_doublings
    }

    /// Time allowed for a key negotiation to reach the active state.
    #[inline(always)]
    pub fn handshake_window(&self) -> Duration {
        self.handshake_window
    }

    /// How long a replaced key keeps decrypting after renegotiation.
    #[inline(always)]
    pub fn transition_window(&self) -> Duration {
        self.transition_window
    }

    #[inline(always)]
    pub fn renegotiate_seconds(&self) -> Option<Duration> {
        self.renegotiate_seconds
    }

    #[inline(always)]
    pub fn renegotiate_bytes(&self) -> Option<u64> {
        self.renegotiate_bytes
    }

    #[inline(always)]
    pub fn renegotiate_packets(&self) -> Option<u64> {
        self.renegotiate_packets
    }

    /// Largest TLS ciphertext chunk carried by one control packet.
    #[inline(always)]
    pub fn control_payload_max(&self) -> usize {
        self.control_payload_max
    }

    /// Options string sent in the key exchange and compared with the peer's.
    #[inline(always)]
    pub fn options_string(&self) -> Option<&str> {
        self.options_string.as_deref()
    }

    #[inline(always)]
    pub fn tls_auth(&self) -> Option<&TlsAuthKey> {
        self.tls_auth.as_ref()
    }

    /// For a server, refuse new clients once one session is established.
    #[inline(always)]
    pub fn single_session(&self) -> bool {
        self.single_session
    }

    /// Require renegotiations to present the same common name and
    /// certificate as the first handshake.
    #[inline(always)]
    pub fn lock_peer_identity(&self) -> bool {
        self.lock_peer_identity
    }

    /// Username and password a client sends to the server.
    #[inline(always)]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Server check of client usernames and passwords.
    #[inline(always)]
    pub fn user_pass_verifier(&self) -> Option<&dyn UserPassVerifier> {
        self.user_pass_verifier.as_deref()
    }

    /// Seed for deterministic randomness. Never set this in production.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

/// Builder for tunnel configuration.
pub struct ConfigBuilder {
    key_method: KeyMethod,
    key_derivation: KeyDerivation,
    data_policy: CryptoPolicy,
    replay_window: usize,
    packet_timeout: Duration,
    retransmit_doublings: usize,
    handshake_window: Duration,
    transition_window: Duration,
    renegotiate_seconds: Option<Duration>,
    renegotiate_bytes: Option<u64>,
    renegotiate_packets: Option<u64>,
    control_payload_max: usize,
    options_string: Option<String>,
    tls_auth: Option<TlsAuthKey>,
    single_session: bool,
    lock_peer_identity: bool,
    credentials: Option<Credentials>,
    user_pass_verifier: Option<Arc<dyn UserPassVerifier>>,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the key exchange method.
    ///
    /// Defaults to [`KeyMethod::V2`].
    pub fn key_method(mut self, method: KeyMethod) -> Self {
        self.key_method = method;
        self
    }

    /// Set where key method 2 gets its key block.
    ///
    /// Defaults to [`KeyDerivation::Prf`].
    pub fn key_derivation(mut self, derivation: KeyDerivation) -> Self {
        self.key_derivation = derivation;
        self
    }

    /// Set the data channel cipher.
    ///
    /// Defaults to AES-128-CBC.
    pub fn cipher(mut self, cipher: CipherKind) -> Self {
        self.data_policy.cipher = cipher;
        self
    }

    /// Set the data channel HMAC digest.
    ///
    /// Defaults to SHA1.
    pub fn digest(mut self, digest: DigestKind) -> Self {
        self.data_policy.digest = digest;
        self
    }

    /// Set whether CBC carries a random IV per packet.
    ///
    /// Defaults to true.
    pub fn use_iv(mut self, use_iv: bool) -> Self {
        self.data_policy.use_iv = use_iv;
        self
    }

    /// Set whether data packets carry packet ids for replay protection.
    ///
    /// Defaults to true.
    pub fn replay_protect(mut self, replay_protect: bool) -> Self {
        self.data_policy.replay_protect = replay_protect;
        self
    }

    /// Set whether data packet ids carry a timestamp.
    ///
    /// Defaults to false.
    pub fn long_form_packet_id(mut self, long_form: bool) -> Self {
        self.data_policy.long_form = long_form;
        self
    }

    /// Set the replay window.
    ///
    /// Defaults to 64, at most 1024.
    pub fn replay_window(mut self, window: usize) -> Self {
        self.replay_window = window;
        self
    }

    /// Set the first retransmit timeout for control packets.
    ///
    /// Defaults to 2 seconds.
    pub fn packet_timeout(mut self, timeout: Duration) -> Self {
        self.packet_timeout = timeout;
        self
    }

    /// Set how many times the retransmit timeout may double.
    ///
    /// Defaults to 5.
    pub fn retransmit_doublings(mut self, doublings: usize) -> Self {
        self.retransmit_doublings = doublings;
        self
    }

    /// Set the time allowed for a key negotiation.
    ///
    /// Defaults to 60 seconds.
    pub fn handshake_window(mut self, window: Duration) -> Self {
        self.handshake_window = window;
        self
    }

    /// Set how long an old key keeps working after renegotiation.
    ///
    /// Defaults to 3600 seconds.
    pub fn transition_window(mut self, window: Duration) -> Self {
        self.transition_window = window;
        self
    }

    /// Renegotiate after this much time. `None` disables.
    ///
    /// Defaults to 3600 seconds.
    pub fn renegotiate_seconds(mut self, secs: Option<Duration>) -> Self {
        self.renegotiate_seconds = secs;
        self
    }

    /// Renegotiate after this many data channel bytes. `None` disables.
    ///
    /// Defaults to disabled.
    pub fn renegotiate_bytes(mut self, bytes: Option<u64>) -> Self {
        self.renegotiate_bytes = bytes;
        self
    }

    /// Renegotiate after this many data channel packets. `None` disables.
    ///
    /// Defaults to disabled.
    pub fn renegotiate_packets(mut self, packets: Option<u64>) -> Self {
        self.renegotiate_packets = packets;
        self
    }

    /// Set the largest TLS chunk per control packet.
    ///
    /// Defaults to 1100.
    pub fn control_payload_max(mut self, max: usize) -> Self {
        self.control_payload_max = max;
        self
    }

    /// Set the options string exchanged with the peer.
    ///
    /// Defaults to none, which skips the comparison.
    pub fn options_string(mut self, options: impl Into<String>) -> Self {
        self.options_string = Some(options.into());
        self
    }

    /// Enable tls-auth with a pre-shared key.
    ///
    /// Defaults to disabled.
    pub fn tls_auth(mut self, key: TlsAuthKey) -> Self {
        self.tls_auth = Some(key);
        self
    }

    /// Set whether a server accepts only one client session.
    ///
    /// Defaults to false.
    pub fn single_session(mut self, single: bool) -> Self {
        self.single_session = single;
        self
    }

    /// Set whether the peer identity is locked after the first handshake.
    ///
    /// Defaults to true.
    pub fn lock_peer_identity(mut self, lock: bool) -> Self {
        self.lock_peer_identity = lock;
        self
    }

    /// Send a username and password with the client's key message.
    ///
    /// Requires key method 2. Defaults to none.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Require clients to authenticate with a username and password,
    /// checked by `verifier`.
    ///
    /// Requires key method 2. Defaults to none.
    pub fn user_pass_verifier(mut self, verifier: Arc<dyn UserPassVerifier>) -> Self {
        self.user_pass_verifier = Some(verifier);
        self
    }

    /// Seed the random generator. For tests only.
    ///
    /// Defaults to none (OS randomness).
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::ConfigError` for combinations that cannot work, such
    /// as a stream cipher without replay protection.
    pub fn build(self) -> Result<Config, Error> {
        self.data_policy.validate()?;

        if self.replay_window == 0 || self.replay_window > MAX_REPLAY_WINDOW {
            return Err(Error::ConfigError(format!(
                "Replay window must be 1..={}, got {}",
                MAX_REPLAY_WINDOW, self.replay_window
            )));
        }
        if self.control_payload_max < 64 {
            return Err(Error::ConfigError(format!(
                "Control payload max too small: {}",
                self.control_payload_max
            )));
        }
        if self.handshake_window.is_zero() {
            return Err(Error::ConfigError("Handshake window is zero".into()));
        }
        if self.packet_timeout.is_zero() {
            return Err(Error::ConfigError("Packet timeout is zero".into()));
        }
        if self.key_method == KeyMethod::V1 && self.key_derivation == KeyDerivation::TlsExporter
        {
            return Err(Error::ConfigError(
                "Key method 1 cannot use the TLS exporter".into(),
            ));
        }
        if let Some(options) = &self.options_string {
            if options.len() >= TLS_OPTIONS_LEN {
                return Err(Error::ConfigError("Options string too long".into()));
            }
        }
        let user_pass = self.credentials.is_some() || self.user_pass_verifier.is_some();
        if user_pass && self.key_method == KeyMethod::V1 {
            return Err(Error::ConfigError(
                "Username/password needs key method 2".into(),
            ));
        }
        if let Some(c) = &self.credentials {
            if c.username().len() >= USER_PASS_LEN || c.password().len() >= USER_PASS_LEN {
                return Err(Error::ConfigError(format!(
                    "Username and password must be shorter than {} bytes",
                    USER_PASS_LEN
                )));
            }
        }

        Ok(Config {
            key_method: self.key_method,
            key_derivation: self.key_derivation,
            data_policy: self.data_policy,
            replay_window: self.replay_window,
            packet_timeout: self.packet_timeout,
            retransmit_doublings: self.retransmit_doublings,
            handshake_window: self.handshake_window,
            transition_window: self.transition_window,
            renegotiate_seconds: self.renegotiate_seconds,
            renegotiate_bytes: self.renegotiate_bytes,
            renegotiate_packets: self.renegotiate_packets,
            control_payload_max: self.control_payload_max,
            options_string: self.options_string,
            tls_auth: self.tls_auth,
            single_session: self.single_session,
            lock_peer_identity: self.lock_peer_identity,
            credentials: self.credentials,
            user_pass_verifier: self.user_pass_verifier,
            rng_seed: self.rng_seed,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}
