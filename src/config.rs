use std::path::PathBuf;

use crate::transport::Interrupt;
use crate::Error;

/// MTU applied to datagram sessions when the caller did not set one.
pub(crate) const DEFAULT_DATAGRAM_MTU: usize = 1096;

/// Session configuration.
///
/// Options mirror the query-string vocabulary of session URIs
/// (`tls://host:port?verify=1&cafile=...`); a query string found in the URI
/// is merged on top of the configured values at open time.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    listen: bool,
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    cert_pem: Option<String>,
    key_pem: Option<String>,
    verify: bool,
    mtu: usize,
    use_srtp: bool,
    http_proxy: Option<String>,
    interrupt: Interrupt,
}

impl TlsConfig {
    /// Create a new configuration builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder {
            config: TlsConfig::default(),
        }
    }

    /// Server role: accept a handshake instead of initiating one.
    #[inline(always)]
    pub fn listen(&self) -> bool {
        self.listen
    }

    /// CA bundle used for peer verification. When unset, the engine's
    /// default verify paths are used.
    #[inline(always)]
    pub fn ca_file(&self) -> Option<&PathBuf> {
        self.ca_file.as_ref()
    }

    /// Certificate file path.
    #[inline(always)]
    pub fn cert_file(&self) -> Option<&PathBuf> {
        self.cert_file.as_ref()
    }

    /// Private key file path.
    #[inline(always)]
    pub fn key_file(&self) -> Option<&PathBuf> {
        self.key_file.as_ref()
    }

    /// In-memory PEM certificate, used instead of `cert_file` when set.
    #[inline(always)]
    pub fn cert_pem(&self) -> Option<&str> {
        self.cert_pem.as_deref()
    }

    /// In-memory PEM private key, used instead of `key_file` when set.
    #[inline(always)]
    pub fn key_pem(&self) -> Option<&str> {
        self.key_pem.as_deref()
    }

    /// Whether peer certificates must be presented and verify.
    #[inline(always)]
    pub fn verify(&self) -> bool {
        self.verify
    }

    /// Maximum transmission unit for datagram sessions. Zero means unset.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Whether to negotiate the DTLS-SRTP extension (rfc5764).
    #[inline(always)]
    pub fn use_srtp(&self) -> bool {
        self.use_srtp
    }

    /// Explicit HTTP proxy URL, overriding process environment.
    #[inline(always)]
    pub fn http_proxy(&self) -> Option<&str> {
        self.http_proxy.as_deref()
    }

    /// Cancellation callback polled during blocking open and handshake.
    #[inline(always)]
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub(crate) fn set_listen(&mut self, listen: bool) {
        self.listen = listen;
    }

    /// Apply the default MTU for datagram sessions that did not set one.
    pub(crate) fn default_mtu_if_unset(&mut self) {
        if self.mtu == 0 {
            self.mtu = DEFAULT_DATAGRAM_MTU;
        }
    }

    /// Merge a `key=value&key=value` query string into this configuration.
    ///
    /// Unrecognized keys are ignored so that underlying-transport options
    /// can travel in the same query string.
    pub(crate) fn apply_query(&mut self, query: &str) -> Result<(), Error> {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            match key {
                "listen" => self.listen = parse_flag(key, value)?,
                "cafile" => self.ca_file = Some(PathBuf::from(value)),
                "cert" => self.cert_file = Some(PathBuf::from(value)),
                "key" => self.key_file = Some(PathBuf::from(value)),
                "verify" => self.verify = parse_flag(key, value)?,
                "mtu" => {
                    self.mtu = value
                        .parse()
                        .map_err(|_| Error::Config(format!("bad mtu value: {value}")))?
                }
                "use_srtp" => self.use_srtp = parse_flag(key, value)?,
                "http_proxy" => self.http_proxy = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(Error::Config(format!("bad {key} value: {value}"))),
    }
}

/// Builder for [`TlsConfig`].
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    /// Set the server role. Defaults to false (connect).
    pub fn listen(mut self, listen: bool) -> Self {
        self.config.listen = listen;
        self
    }

    /// Set the CA bundle path used for peer verification.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_file = Some(path.into());
        self
    }

    /// Set the certificate file path.
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cert_file = Some(path.into());
        self
    }

    /// Set the private key file path.
    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.key_file = Some(path.into());
        self
    }

    /// Supply the certificate as in-memory PEM text.
    pub fn cert_pem(mut self, pem: impl Into<String>) -> Self {
        self.config.cert_pem = Some(pem.into());
        self
    }

    /// Supply the private key as in-memory PEM text.
    pub fn key_pem(mut self, pem: impl Into<String>) -> Self {
        self.config.key_pem = Some(pem.into());
        self
    }

    /// Require peer certificate verification. Defaults to false
    /// (anonymous/self-signed mode).
    pub fn verify(mut self, verify: bool) -> Self {
        self.config.verify = verify;
        self
    }

    /// Set the datagram MTU. Defaults to 1096 when left unset.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Negotiate the DTLS-SRTP extension with the fixed profile.
    pub fn use_srtp(mut self, use_srtp: bool) -> Self {
        self.config.use_srtp = use_srtp;
        self
    }

    /// Set an explicit HTTP proxy URL, overriding process environment.
    pub fn http_proxy(mut self, url: impl Into<String>) -> Self {
        self.config.http_proxy = Some(url.into());
        self
    }

    /// Set the cancellation callback polled during blocking waits.
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.config.interrupt = interrupt;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TlsConfig {
        self.config
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_merges_over_builder() {
        let mut config = TlsConfig::builder().verify(true).build();
        config
            .apply_query("listen=1&mtu=1400&use_srtp=1&verify=0")
            .unwrap();

        assert!(config.listen());
        assert_eq!(config.mtu(), 1400);
        assert!(config.use_srtp());
        assert!(!config.verify());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = TlsConfig::default();
        config.apply_query("fifo_size=0&cafile=/tmp/ca.pem").unwrap();

        assert_eq!(config.ca_file(), Some(&PathBuf::from("/tmp/ca.pem")));
    }

    #[test]
    fn bad_values_are_config_errors() {
        let mut config = TlsConfig::default();
        assert!(matches!(
            config.apply_query("mtu=banana"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config.apply_query("listen=yes"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn default_mtu_only_when_unset() {
        let mut config = TlsConfig::default();
        config.default_mtu_if_unset();
        assert_eq!(config.mtu(), DEFAULT_DATAGRAM_MTU);

        let mut config = TlsConfig::builder().mtu(900).build();
        config.default_mtu_if_unset();
        assert_eq!(config.mtu(), 900);
    }
}
