//! External IP lookup via the trace service (spec §6).
//!
//! Grounded on `HttpManager.go`'s `createHTTPClient`/`GetRequest` and
//! `Server.go`'s `getClientIPFromTrace`: the pinned extra root CA is added
//! alongside the platform trust store, the request carries a browser
//! `User-Agent`, and the response body is scanned line by line for an
//! `ip=` prefix. Any failure is logged and treated as "no IP available"
//! rather than surfaced to the caller.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::warn;

use crate::error::{ProxyError, Result};

const TRACE_URL: &str = "https://image.nebulapause.com/cdn-cgi/trace";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36 Edg/142.0.0.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// DPTS Root CA, added to the trust store alongside the platform roots.
const EXTRA_ROOT_CA_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIDpzCCAo+gAwIBAgIUIiqEObiDkkfKoRM4yGkMBXh3sV8wDQYJKoZIhvcNAQEL
BQAwYzELMAkGA1UEBhMCQ04xIjAgBgNVBAoMGURyIFByaXZhdGUgVHJ1c3QgU2Vy
dmljZXMxFTATBgNVBAMMDERQVFMgUm9vdCBDQTEZMBcGCSqGSIb3DQEJARYKZHJA
ZGVyLmtpbTAeFw0yNDExMzAxNDMwMzBaFw0zNDExMjgxNDMwMzBaMGMxCzAJBgNV
BAYTAkNOMSIwIAYDVQQKDBlEciBQcml2YXRlIFRydXN0IFNlcnZpY2VzMRUwEwYD
VQQDDAxEUFRTIFJvb3QgQ0ExGTAXBgkqhkiG9w0BCQEWCmRyQGRlci5raW0wggEi
MA0GCSqGSIb3DQEBAQUAA4IBDwAwggEKAoIBAQCsJ5arrZvLuO+9vNQnlKOT1KrN
0wh10ntiD7+L1sbRwX8VtbVrhzFMf6IcKVwhfYSeB2UU3xRzy/nORU8TKqbD7QzR
Bgk0rEn/fdfTlcNahjBudpy1mJpCrWjP5Gx6O6Mt64oaoF4kfAzUaizVAJG7zH6E
dnxgbvEcpkm905GUBGrPJ7PWpfRrfQsNHd8ya8FoKM6ceaD3e+NHFgvmFwY2rM09
TV8BZVSrV1rPGJlGMg1bjDHKIBk554kUL2GSukXTChbMfjP7geHcNccsCSplK2ck
pk5B2FS3nMNzdg0CngsqeHKOeI6o3xKzhJmF6+4QDMNhR3hp78DVhciifbRhAgMB
AAGjUzBRMB0GA1UdDgQWBBQRfAsu/OvdvT5wtJqTCElYEYwBtDAfBgNVHSMEGDAW
gBQRfAsu/OvdvT5wtJqTCElYEYwBtDAPBgNVHRMBAf8EBTADAQH/MA0GCSqGSIb3
DQEBCwUAA4IBAQAOgJk/KW8W5Zx96KxcYXdWsyuFwuHv3j2H/+D24NupQLDY5RGh
mBmspG0fkFB+ZsGY1tV/Nl0iWwIIJcM27fc0rahnMvVQ+3mGH2oNxfQlThFSkty3
2Pd16W8aZFAL/Ha4kyzgfdKmzT4vfquLSjZKuzNBTwkQDcFz7xGZir5lRbzCA1YO
mphj7R4G6FwtzNBs9R21tFRzezh6vJr9byZk5oSrqZvckDCHFTa7dC0eWjGVM5la
9fZE6o1HrF89i78lz9O3PZ5vqbza/Ik9TP2XtDJrHcLD5BCjUj7RDnLqBNQB+yR9
DwBWL/y0fMNNNcg8UwtnjmGzip6REXycyFO1
-----END CERTIFICATE-----";

static CLIENT: OnceLock<Option<reqwest::Client>> = OnceLock::new();

fn client() -> Option<&'static reqwest::Client> {
    CLIENT
        .get_or_init(|| match build_client() {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "failed to build trace service HTTP client");
                None
            }
        })
        .as_ref()
}

fn build_client() -> reqwest::Result<reqwest::Client> {
    let extra_root = reqwest::Certificate::from_pem(EXTRA_ROOT_CA_PEM.as_bytes())?;
    reqwest::Client::builder()
        .add_root_certificate(extra_root)
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
}

/// Looks up the caller's external IP as seen by the trace service. Returns
/// `None` on any failure (network error, non-2xx status, missing `ip=`
/// line); callers treat this identically to an empty lookup, matching
/// `getClientIPFromTrace`'s behavior of swallowing the error and returning
/// an empty string.
pub async fn fetch_external_ip() -> Option<String> {
    let client = client()?;
    match fetch_body(client).await {
        Ok(body) => parse_ip_line(&body),
        Err(e) => {
            warn!(error = %e, "trace service lookup failed");
            None
        }
    }
}

async fn fetch_body(client: &reqwest::Client) -> Result<String> {
    let resp = client.get(TRACE_URL).send().await.map_err(ProxyError::Http)?;
    let resp = resp.error_for_status().map_err(ProxyError::Http)?;
    resp.text().await.map_err(ProxyError::Http)
}

fn parse_ip_line(body: &str) -> Option<String> {
    body.lines()
        .find_map(|line| line.strip_prefix("ip=").map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_line_among_other_fields() {
        let body = "fl=1\nh=image.nebulapause.com\nip=203.0.113.7\nts=1234.5\n";
        assert_eq!(parse_ip_line(body), Some("203.0.113.7".to_string()));
    }

    #[test]
    fn returns_none_without_ip_line() {
        let body = "fl=1\nh=image.nebulapause.com\n";
        assert_eq!(parse_ip_line(body), None);
    }

    #[test]
    fn trims_whitespace_around_ip() {
        let body = "ip=  203.0.113.7  \n";
        assert_eq!(parse_ip_line(body), Some("203.0.113.7".to_string()));
    }
}
