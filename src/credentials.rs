//! Key and certificate material for secure sessions.
//!
//! A [`Credential`] pairs a private key with an X.509 certificate, caches
//! both as PEM text and carries the certificate's SHA-256 fingerprint. It is
//! either loaded from caller-supplied material or generated once for a
//! listening session that has none (anonymous/opportunistic encryption).

use std::fs;
use std::path::Path;

use log::debug;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::crypto_error;
use crate::Error;

/// Common name placed in self-signed ephemeral certificates.
const EPHEMERAL_CN: &str = "tlswrap";

/// Validity window for self-signed ephemeral certificates, in days.
const EPHEMERAL_VALIDITY_DAYS: u32 = 365;

/// Private key and certificate owned by one session.
pub struct Credential {
    pkey: PKey<Private>,
    cert: X509,
    key_pem: Zeroizing<String>,
    cert_pem: String,
    fingerprint: String,
}

impl Credential {
    /// Load key and certificate from PEM files.
    ///
    /// Fails with [`Error::Io`] when a file is unreadable and
    /// [`Error::Format`] when the contents do not parse.
    pub fn from_files(key_path: &Path, cert_path: &Path) -> Result<Credential, Error> {
        let key_text = fs::read(key_path).map_err(Error::Io)?;
        let cert_text = fs::read(cert_path).map_err(Error::Io)?;
        Self::from_pem(&key_text, &cert_text)
    }

    /// Parse key and certificate from in-memory PEM text.
    pub fn from_pem(key_pem: &[u8], cert_pem: &[u8]) -> Result<Credential, Error> {
        let pkey = PKey::private_key_from_pem(key_pem)
            .map_err(|e| format_error("parse private key", e))?;
        let cert = X509::from_pem(cert_pem).map_err(|e| format_error("parse certificate", e))?;
        Self::assemble(pkey, cert)
    }

    /// Generate an ephemeral P-256 key and a minimal self-signed certificate.
    ///
    /// The certificate carries a fixed common name, a random 64-bit serial
    /// and a validity window of one year, and is signed with the generated
    /// key itself. No CA chain is involved; peers verify it out-of-band by
    /// fingerprint.
    pub fn generate() -> Result<Credential, Error> {
        let context = "generate credential";
        let build = || -> Result<(PKey<Private>, X509), openssl::error::ErrorStack> {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
            let ec_key = EcKey::generate(&group)?;
            let pkey = PKey::from_ec_key(ec_key)?;

            let mut name = X509NameBuilder::new()?;
            name.append_entry_by_text("CN", EPHEMERAL_CN)?;
            let name = name.build();

            let serial: u64 = rand::random();
            let serial = BigNum::from_slice(&serial.to_be_bytes())?.to_asn1_integer()?;

            let mut builder = X509Builder::new()?;
            builder.set_version(2)?;
            builder.set_serial_number(&serial)?;
            builder.set_subject_name(&name)?;
            builder.set_issuer_name(&name)?;
            let not_before = Asn1Time::days_from_now(0)?;
            let not_after = Asn1Time::days_from_now(EPHEMERAL_VALIDITY_DAYS)?;
            builder.set_not_before(&not_before)?;
            builder.set_not_after(&not_after)?;
            builder.set_pubkey(&pkey)?;
            builder.sign(&pkey, MessageDigest::sha256())?;

            Ok((pkey, builder.build()))
        };

        // Partially-built engine objects are owned values and unwind on
        // their own; only the error queue needs explicit collapsing.
        let (pkey, cert) = build().map_err(|e| crypto_error(context, e))?;
        let credential = Self::assemble(pkey, cert)?;
        debug!(
            "Generated ephemeral credential, fingerprint {}",
            credential.fingerprint
        );
        Ok(credential)
    }

    fn assemble(pkey: PKey<Private>, cert: X509) -> Result<Credential, Error> {
        let key_pem = pkey
            .private_key_to_pem_pkcs8()
            .map_err(|e| crypto_error("serialize private key", e))?;
        let key_pem = String::from_utf8(key_pem)
            .map_err(|_| Error::Format("private key PEM is not UTF-8".into()))?;

        let cert_pem = cert
            .to_pem()
            .map_err(|e| crypto_error("serialize certificate", e))?;
        let cert_pem = String::from_utf8(cert_pem)
            .map_err(|_| Error::Format("certificate PEM is not UTF-8".into()))?;

        let der = cert
            .to_der()
            .map_err(|e| crypto_error("encode certificate", e))?;
        let fingerprint = format_fingerprint(&Sha256::digest(&der));

        Ok(Credential {
            pkey,
            cert,
            key_pem: Zeroizing::new(key_pem),
            cert_pem,
            fingerprint,
        })
    }

    /// The private key handle.
    pub(crate) fn pkey(&self) -> &PKey<Private> {
        &self.pkey
    }

    /// The certificate handle.
    pub(crate) fn cert(&self) -> &X509 {
        &self.cert
    }

    /// SHA-256 fingerprint of the DER certificate as uppercase colon-hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Private key as PEM, bounded by `capacity` bytes.
    ///
    /// Fails with [`Error::Resource`] when the text would not fit in
    /// `capacity - 1` bytes. Truncated key material is never returned.
    pub fn key_pem(&self, capacity: usize) -> Result<&str, Error> {
        bounded_pem(&self.key_pem, capacity, "private key")
    }

    /// Certificate as PEM, bounded by `capacity` bytes.
    pub fn cert_pem(&self, capacity: usize) -> Result<&str, Error> {
        bounded_pem(&self.cert_pem, capacity, "certificate")
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

fn bounded_pem<'a>(pem: &'a str, capacity: usize, what: &str) -> Result<&'a str, Error> {
    if capacity == 0 || pem.len() > capacity - 1 {
        return Err(Error::Resource(format!(
            "{what} PEM needs {} bytes, capacity is {capacity}",
            pem.len() + 1
        )));
    }
    Ok(pem)
}

fn format_error(context: &str, stack: openssl::error::ErrorStack) -> Error {
    Error::Format(crate::error::describe_engine_errors(context, &stack))
}

/// Format a raw digest as uppercase hex octets with a single colon between
/// every pair and none trailing, e.g. `AF:12:F6:...`.
fn format_fingerprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<String>>()
        .join(":")
}
