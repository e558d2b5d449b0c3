mod support;

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use tlswrap::{Credential, Error, Interrupt, Session, SessionState, TlsConfig};

use support::{connect_when_listening, free_tcp_port, init_log, StdProvider};

#[test]
fn stream_loopback_anonymous() {
    init_log();
    let port = free_tcp_port();

    // Listener with no configured material generates a self-signed
    // credential on its own.
    let server = thread::spawn(move || {
        let config = TlsConfig::builder().listen(true).build();
        let mut session = Session::connect(
            &format!("tls://127.0.0.1:{port}?listen=1"),
            config,
            &StdProvider,
        )
        .unwrap();

        assert_eq!(session.state(), SessionState::Established);
        assert!(session.fingerprint().is_some());

        let mut buf = [0u8; 64];
        let n = session.read(&mut buf).unwrap();
        session.write(&buf[..n]).unwrap();
        n
    });

    let mut client =
        connect_when_listening(&format!("tls://127.0.0.1:{port}"), TlsConfig::default()).unwrap();
    assert_eq!(client.state(), SessionState::Established);
    assert!(client.numeric_host());
    assert!(client.descriptor().is_some());

    client.write(b"hello tls").unwrap();
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello tls");

    assert_eq!(server.join().unwrap(), 9);
}

#[test]
fn stream_verify_rejects_mismatched_hostname() {
    init_log();

    let credential = Credential::generate().unwrap();
    let cert_pem = credential.cert_pem(8192).unwrap().to_owned();
    let key_pem = credential.key_pem(8192).unwrap().to_owned();

    // The client trusts the self-signed certificate; only the hostname
    // check can fail.
    let ca_path = std::env::temp_dir().join(format!("tlswrap-test-ca-{}.pem", std::process::id()));
    fs::write(&ca_path, &cert_pem).unwrap();

    // verify=1 against a certificate that names no such host
    let port = free_tcp_port();
    let server = spawn_server(port, cert_pem.clone(), key_pem.clone());

    let config = TlsConfig::builder().verify(true).ca_file(&ca_path).build();
    let err = connect_when_listening(&format!("tls://localhost:{port}"), config).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");
    server.join().unwrap();

    // the identical setup with verify=0 succeeds
    let port = free_tcp_port();
    let server = spawn_server(port, cert_pem, key_pem);

    let mut client =
        connect_when_listening(&format!("tls://localhost:{port}"), TlsConfig::default()).unwrap();
    client.write(b"ping").unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    server.join().unwrap();

    let _ = fs::remove_file(&ca_path);
}

/// Accept one handshake and echo one record if it gets that far.
fn spawn_server(port: u16, cert_pem: String, key_pem: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let config = TlsConfig::builder()
            .listen(true)
            .cert_pem(cert_pem)
            .key_pem(key_pem)
            .build();
        // The peer may abort the handshake on purpose.
        if let Ok(mut session) = Session::connect(
            &format!("tls://127.0.0.1:{port}?listen=1"),
            config,
            &StdProvider,
        ) {
            let mut buf = [0u8; 16];
            if let Ok(n) = session.read(&mut buf) {
                let _ = session.write(&buf[..n]);
            }
        }
    })
}

#[test]
fn unreachable_host_fails_within_deadline() {
    init_log();

    let start = Instant::now();
    let deadline = start + Duration::from_secs(2);
    let config = TlsConfig::builder()
        .interrupt(Interrupt::new(move || Instant::now() >= deadline))
        .build();

    let err = Session::connect("tls://example.invalid:443", config, &StdProvider).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(4));
}

#[test]
fn close_is_idempotent_and_terminal() {
    init_log();
    let port = free_tcp_port();

    let server = thread::spawn(move || {
        let config = TlsConfig::builder().listen(true).build();
        let mut session = Session::connect(
            &format!("tls://127.0.0.1:{port}?listen=1"),
            config,
            &StdProvider,
        )
        .unwrap();
        // Peer closing is an orderly shutdown on our side.
        let mut buf = [0u8; 16];
        let _ = session.read(&mut buf);
    });

    let mut client =
        connect_when_listening(&format!("tls://127.0.0.1:{port}"), TlsConfig::default()).unwrap();

    client.close();
    assert_eq!(client.state(), SessionState::Closed);
    client.close();
    assert_eq!(client.state(), SessionState::Closed);

    let err = client.read(&mut [0u8; 16]).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    server.join().unwrap();
}
