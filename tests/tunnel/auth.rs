//! Username/password authentication on top of the TLS handshake.

use std::sync::{Arc, Mutex};

use tlsmux::{
    AuthStatus, AuthVerdict, Buf, Config, Credentials, DropReason, Error, Inbound,
    KeyStateKind, TlsMultiplexer, UserPassRequest, UserPassVerifier,
};

use crate::common::*;

/// Answers every request the same way and remembers what it was asked.
#[derive(Debug)]
struct Verifier {
    verdict: AuthVerdict,
    seen: Mutex<Vec<(u32, String)>>,
}

impl Verifier {
    fn new(verdict: AuthVerdict) -> Arc<Self> {
        Arc::new(Verifier {
            verdict,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn last_id(&self) -> u32 {
        self.seen.lock().unwrap().last().expect("no request").0
    }
}

impl UserPassVerifier for Verifier {
    fn verify(&self, request: &UserPassRequest<'_>) -> AuthVerdict {
        let ok = request.password == "letmein";
        self.seen
            .lock()
            .unwrap()
            .push((request.auth_id, request.username.to_string()));
        if ok {
            self.verdict
        } else {
            AuthVerdict::Reject
        }
    }
}

fn client_config(username: &str, password: &str) -> Arc<Config> {
    Arc::new(
        Config::builder()
            .credentials(Credentials::new(username, password))
            .build()
            .unwrap(),
    )
}

fn server_config(verifier: &Arc<Verifier>) -> Arc<Config> {
    Arc::new(
        Config::builder()
            .user_pass_verifier(verifier.clone())
            .build()
            .unwrap(),
    )
}

fn pair(verifier: &Arc<Verifier>, password: &str) -> Pair {
    let _ = env_logger::try_init();
    Pair::with_configs(client_config("alice", password), server_config(verifier))
}

/// Run until both ends have an active key, whether or not the server
/// lets it carry data.
fn negotiate(pair: &mut Pair) {
    let ok = pair.run_until(200, |p| {
        p.client.is_connected() && p.server.primary_state() >= Some(KeyStateKind::Active)
    });
    pair.round();
    assert!(
        ok,
        "no negotiation: client {:?} server {:?}",
        pair.client_seen.errors, pair.server_seen.errors
    );
}

fn server_refuses_data(pair: &mut Pair) {
    let packet = pair.client_packet(b"let me in");
    let (inbound, _) = pair.to_server(&packet);
    assert_eq!(inbound, Inbound::Dropped(DropReason::UnknownKeyId));
    let mut out = Buf::new();
    assert!(matches!(
        pair.server.encrypt(pair.now, b"no", &mut out),
        Err(Error::NotConnected)
    ));
}

#[test]
fn user_pass_accepted() {
    let verifier = Verifier::new(AuthVerdict::Accept);
    let mut pair = pair(&verifier, "letmein");
    pair.connect();

    assert_eq!(pair.server.authentication_status(), AuthStatus::Succeeded);
    assert_eq!(pair.server.username(), Some("alice"));
    assert_eq!(pair.client.username(), None);
    assert_eq!(verifier.seen.lock().unwrap().len(), 1);

    let packet = pair.client_packet(b"hi");
    let (inbound, plain) = pair.to_server(&packet);
    assert_eq!(inbound, Inbound::Data);
    assert_eq!(plain, b"hi");
}

#[test]
fn user_pass_rejected() {
    let verifier = Verifier::new(AuthVerdict::Accept);
    let mut pair = pair(&verifier, "guess");
    negotiate(&mut pair);

    assert_eq!(pair.server.authentication_status(), AuthStatus::Failed);
    assert!(!pair.server_seen.connected);
    assert_eq!(pair.server.username(), None);
    server_refuses_data(&mut pair);
}

#[test]
fn client_without_credentials_rejected() {
    let _ = env_logger::try_init();
    let verifier = Verifier::new(AuthVerdict::Accept);
    let mut pair = Pair::with_configs(Arc::new(Config::default()), server_config(&verifier));
    negotiate(&mut pair);

    assert_eq!(pair.server.authentication_status(), AuthStatus::Failed);
    assert!(verifier.seen.lock().unwrap().is_empty());
}

#[test]
fn deferred_then_accepted() {
    let verifier = Verifier::new(AuthVerdict::Defer);
    let mut pair = pair(&verifier, "letmein");
    negotiate(&mut pair);

    assert_eq!(pair.server.authentication_status(), AuthStatus::Deferred);
    assert!(!pair.server_seen.connected);
    server_refuses_data(&mut pair);

    let id = verifier.last_id();
    assert!(!pair.server.authenticate_key(id + 1, true));
    assert!(pair.server.authenticate_key(id, true));
    assert_eq!(pair.server.authentication_status(), AuthStatus::Succeeded);
    assert!(pair.server.is_connected());

    pair.round();
    assert!(pair.server_seen.connected);
    let packet = pair.client_packet(b"finally");
    let (inbound, plain) = pair.to_server(&packet);
    assert_eq!(inbound, Inbound::Data);
    assert_eq!(plain, b"finally");
}

#[test]
fn deferred_then_rejected() {
    let verifier = Verifier::new(AuthVerdict::Defer);
    let mut pair = pair(&verifier, "letmein");
    negotiate(&mut pair);
    assert_eq!(pair.server.authentication_status(), AuthStatus::Deferred);

    assert!(pair.server.authenticate_key(verifier.last_id(), false));
    assert_eq!(pair.server.authentication_status(), AuthStatus::Failed);
    // A verdict is given once.
    assert!(!pair.server.authenticate_key(verifier.last_id(), true));
    server_refuses_data(&mut pair);
}

#[test]
fn restarted_client_with_other_username_disables_tunnel() {
    let verifier = Verifier::new(AuthVerdict::Accept);
    let mut pair = pair(&verifier, "letmein");
    pair.connect();
    assert_eq!(pair.server.username(), Some("alice"));

    pair.client = TlsMultiplexer::new_client(
        client_config("bob", "letmein"),
        server_addr(),
        LoopbackFactory::new("client", 5),
    );
    pair.client_addr = "10.0.0.2:40002".parse().unwrap();
    pair.client_seen = Seen::default();

    let ok = pair.run_until(200, |p| p.server.authentication_status() == AuthStatus::Failed);
    assert!(ok, "username change went unnoticed");
    assert_eq!(pair.server.username(), Some("alice"));
    let mut out = Buf::new();
    assert!(matches!(
        pair.server.encrypt(pair.now, b"x", &mut out),
        Err(Error::NotConnected)
    ));
}
