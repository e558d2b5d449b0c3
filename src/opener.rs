//! Resolution of session URIs into open underlying transports.
//!
//! `tls://host:port?query` becomes a `tcp` URL, `dtls://host:port?query` a
//! `udp` URL. Stream sessions behind an HTTP proxy are rewritten to tunnel
//! through the `httpproxy` scheme with the real destination as tunnel
//! target.

use std::env;
use std::net::IpAddr;

use log::{debug, trace};

use crate::config::TlsConfig;
use crate::transport::{OpenOptions, Transport, TransportProvider};
use crate::Error;

/// An opened underlying transport plus what later verification needs to
/// know about the endpoint it reaches.
pub(crate) struct Endpoint {
    pub transport: Box<dyn Transport>,
    /// Hostname requested by the caller, used for SNI and name checks.
    pub host: String,
    pub port: u16,
    /// Literal IP addresses skip hostname verification.
    pub numeric_host: bool,
}

/// Pieces of a `scheme://host:port?query` session URI.
pub(crate) struct ParsedUri<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub query: Option<&'a str>,
}

/// Split a session URI. IPv6 literals use the usual bracket form.
pub(crate) fn parse_uri(uri: &str) -> Result<ParsedUri<'_>, Error> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("missing scheme in uri: {uri}")))?;

    let (authority, query) = match rest.split_once('?') {
        Some((a, q)) => (a, Some(q)),
        None => (rest, None),
    };

    let (host, port_str) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| Error::Config(format!("unterminated ipv6 literal in uri: {uri}")))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| Error::Config(format!("missing port in uri: {uri}")))?;
        (host, port)
    } else {
        authority
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("missing port in uri: {uri}")))?
    };

    if host.is_empty() {
        return Err(Error::Config(format!("missing host in uri: {uri}")));
    }

    let port = port_str
        .parse()
        .map_err(|_| Error::Config(format!("bad port in uri: {uri}")))?;

    Ok(ParsedUri {
        scheme,
        host,
        port,
        query,
    })
}

/// Open the underlying transport for a session URI.
///
/// Merges the URI query string into `config`, applies datagram socket
/// options, detects literal-IP hosts and performs HTTP-proxy target
/// rewriting for stream sessions.
pub(crate) fn open_underlying(
    uri: &str,
    datagram: bool,
    config: &mut TlsConfig,
    provider: &dyn TransportProvider,
) -> Result<Endpoint, Error> {
    let parsed = parse_uri(uri)?;
    if let Some(query) = parsed.query {
        config.apply_query(query)?;
    }

    let host = parsed.host.to_string();
    let port = parsed.port;
    let numeric_host = host.parse::<IpAddr>().is_ok();

    let mut options = OpenOptions {
        interrupt: config.interrupt().clone(),
        ..Default::default()
    };

    if datagram {
        config.default_mtu_if_unset();
        if config.listen() {
            options.local_addr = Some(host.clone());
            options.local_port = Some(port);
        } else {
            options.local_port = Some(0);
            options.connect = true;
        }
        // No inbound buffering; the engine reads every datagram itself.
        options.recv_queue = Some(0);
        options.max_packet = Some(config.mtu());
    }

    let url = underlying_url(&parsed, datagram, config)?;
    trace!("Opening underlying transport {url}");

    let transport = provider.open(&url, &options)?;

    Ok(Endpoint {
        transport,
        host,
        port,
        numeric_host,
    })
}

fn underlying_url(parsed: &ParsedUri<'_>, datagram: bool, config: &TlsConfig) -> Result<String, Error> {
    if !datagram {
        if let Some(proxy) = proxy_for(config, parsed.host) {
            return proxy_tunnel_url(&proxy, parsed.host, parsed.port);
        }
    }

    let scheme = if datagram { "udp" } else { "tcp" };
    // Datagram listeners bind locally; the bind address travels in the
    // open options instead of the URL authority.
    let host = if datagram && config.listen() {
        ""
    } else {
        parsed.host
    };

    let mut url = format!("{scheme}://{host}:{}", parsed.port);
    match parsed.query {
        Some(query) => {
            url.push('?');
            url.push_str(query);
            if config.listen() && !datagram && !query_has_listen(query) {
                url.push_str("&listen=1");
            }
        }
        None => {
            if config.listen() && !datagram {
                url.push_str("?listen=1");
            }
        }
    }
    Ok(url)
}

fn query_has_listen(query: &str) -> bool {
    query
        .split('&')
        .any(|pair| pair == "listen=1" || pair == "listen")
}

/// The proxy URL to tunnel through, if any applies to this host.
///
/// An explicit option wins; otherwise the process `http_proxy` environment
/// is consulted, filtered through `no_proxy`. Only plain-HTTP proxy URLs
/// are usable for CONNECT tunneling.
fn proxy_for(config: &TlsConfig, host: &str) -> Option<String> {
    let proxy = match config.http_proxy() {
        Some(p) => p.to_string(),
        None => env::var("http_proxy").ok()?,
    };

    let no_proxy = env::var("no_proxy").unwrap_or_default();
    if match_no_proxy(&no_proxy, host) {
        return None;
    }

    proxy.starts_with("http://").then_some(proxy)
}

fn proxy_tunnel_url(proxy: &str, host: &str, port: u16) -> Result<String, Error> {
    let rest = proxy
        .strip_prefix("http://")
        .ok_or_else(|| Error::Config(format!("unsupported proxy url: {proxy}")))?;
    // Keep authority only; a path on the proxy URL has no meaning here.
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);

    let (auth, hostport) = match authority.rsplit_once('@') {
        Some((auth, hp)) => (Some(auth), hp),
        None => (None, authority),
    };

    let (proxy_host, proxy_port) = match hostport.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::Config(format!("bad proxy port in: {proxy}")))?;
            (h, port)
        }
        None => (hostport, 80),
    };

    if proxy_host.is_empty() {
        return Err(Error::Config(format!("bad proxy url: {proxy}")));
    }

    debug!("Tunneling through http proxy {proxy_host}:{proxy_port}");

    let auth = auth.map(|a| format!("{a}@")).unwrap_or_default();
    Ok(format!(
        "httpproxy://{auth}{proxy_host}:{proxy_port}/{host}:{port}"
    ))
}

/// Match a host against a `no_proxy` pattern list.
///
/// Entries are separated by commas and/or whitespace. `*` matches every
/// host. An entry matches when it equals the host or names a domain suffix
/// of it; a leading dot is accepted in suffix entries.
pub(crate) fn match_no_proxy(no_proxy: &str, host: &str) -> bool {
    no_proxy
        .split([',', ' ', '\t'])
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }
            let suffix = entry.strip_prefix('.').unwrap_or(entry);
            host == suffix
                || (host.ends_with(suffix)
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
        })
}
