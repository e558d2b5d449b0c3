//! Crypto-engine context construction for stream and datagram handshakes.
//!
//! Builds the engine context from the session configuration (CA material,
//! credential, verification policy, SRTP profile, MTU discipline) and the
//! per-session handle (SNI, hostname checks). The actual drive loop lives
//! with the session state machine.

use log::{debug, warn};
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslVerifyMode, SslVersion};
use openssl::x509::verify::X509CheckFlags;

use crate::config::TlsConfig;
use crate::credentials::Credential;
use crate::error::{crypto_error, describe_engine_errors};
use crate::Error;

/// The single SRTP protection profile advertised when SRTP is enabled.
///
/// No negotiation happens beyond this fixed choice; both sides must offer
/// it for keying-material export to work.
pub(crate) const SRTP_PROFILE: &str = "SRTP_AES128_CM_SHA1_80";

/// Extractor label for SRTP keying material (rfc5764).
pub const SRTP_EXPORT_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Produce the credential a session will present, if any.
///
/// Caller-supplied material wins: in-memory PEM over file paths. A
/// listening session with neither gets a generated ephemeral credential,
/// exactly once. A connecting session without material presents nothing.
pub(crate) fn select_credential(config: &TlsConfig) -> Result<Option<Credential>, Error> {
    let has_cert = config.cert_pem().is_some() || config.cert_file().is_some();
    let has_key = config.key_pem().is_some() || config.key_file().is_some();

    if has_cert != has_key {
        return Err(Error::Config(
            "certificate and key must be configured together".into(),
        ));
    }

    if !has_cert {
        if config.listen() {
            debug!("No server certificate provided, using self-signed");
            return Credential::generate().map(Some);
        }
        return Ok(None);
    }

    if let (None, None, Some(key_path), Some(cert_path)) = (
        config.key_pem(),
        config.cert_pem(),
        config.key_file(),
        config.cert_file(),
    ) {
        return Credential::from_files(key_path, cert_path).map(Some);
    }

    // Pem and file sources resolve per item, pem winning.
    let key = match (config.key_pem(), config.key_file()) {
        (Some(pem), _) => pem.as_bytes().to_vec(),
        (None, Some(path)) => std::fs::read(path).map_err(Error::Io)?,
        (None, None) => return Err(Error::Config("missing private key source".into())),
    };
    let cert = match (config.cert_pem(), config.cert_file()) {
        (Some(pem), _) => pem.as_bytes().to_vec(),
        (None, Some(path)) => std::fs::read(path).map_err(Error::Io)?,
        (None, None) => return Err(Error::Config("missing certificate source".into())),
    };

    Credential::from_pem(&key, &cert).map(Some)
}

/// Build the engine context shared by every handshake of this session.
pub(crate) fn build_context(
    config: &TlsConfig,
    credential: Option<&Credential>,
    datagram: bool,
) -> Result<SslContext, Error> {
    // Role comes from driving connect or accept on the handle; the method
    // only selects stream vs datagram records.
    let method = if datagram {
        SslMethod::dtls()
    } else {
        SslMethod::tls()
    };

    let mut builder =
        SslContextBuilder::new(method).map_err(|e| crypto_error("engine context", e))?;

    if !datagram {
        // Everything from TLS 1.0 up; the deprecated SSL protocols stay
        // disabled.
        builder
            .set_min_proto_version(Some(SslVersion::TLS1))
            .map_err(|e| crypto_error("set minimum protocol version", e))?;
    }

    match config.ca_file() {
        Some(path) => {
            if let Err(e) = builder.set_ca_file(path) {
                warn!(
                    "{}",
                    describe_engine_errors("Failed to load CA file", &e)
                );
            }
        }
        None => {
            // Not fatal; verification may still succeed via fingerprints
            // or be disabled entirely.
            if let Err(e) = builder.set_default_verify_paths() {
                warn!(
                    "{}",
                    describe_engine_errors("Failure setting default verify locations", &e)
                );
            }
        }
    }

    if let Some(credential) = credential {
        builder
            .set_certificate(credential.cert())
            .map_err(|e| crypto_error("use certificate", e))?;
        builder
            .set_private_key(credential.pkey())
            .map_err(|e| crypto_error("use private key", e))?;
    }

    if config.verify() {
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }

    if datagram {
        if config.use_srtp() {
            builder
                .set_tlsext_use_srtp(SRTP_PROFILE)
                .map_err(|e| crypto_error("enable srtp profile", e))?;
        }
        // Path-MTU discovery stays off; handshake fragments are pinned to
        // the configured MTU so retransmissions never exceed it.
        builder.set_options(SslOptions::NO_QUERY_MTU);
    }

    Ok(builder.build())
}

/// Build the per-session handle: SNI, hostname verification, MTU.
pub(crate) fn build_ssl(
    context: &SslContext,
    config: &TlsConfig,
    datagram: bool,
    host: &str,
    numeric_host: bool,
) -> Result<Ssl, Error> {
    let mut ssl = Ssl::new(context).map_err(|e| crypto_error("engine handle", e))?;

    if !config.listen() && !numeric_host {
        if !datagram {
            // Engine default wildcard matching is too lax.
            let param = ssl.param_mut();
            param.set_hostflags(X509CheckFlags::NO_PARTIAL_WILDCARDS);
            param
                .set_host(host)
                .map_err(|e| crypto_error("set verification hostname", e))?;
        }
        ssl.set_hostname(host)
            .map_err(|e| crypto_error("set sni hostname", e))?;
    }

    if datagram {
        ssl.set_mtu(config.mtu() as u32)
            .map_err(|e| crypto_error("set mtu", e))?;
        debug!("Datagram handshake MTU pinned to {}", config.mtu());
    }

    Ok(ssl)
}
