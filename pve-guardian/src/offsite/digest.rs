//! HTTP Digest authentication (RFC 7616, MD5 and MD5-sess).

use md5::{Digest, Md5};
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    /// Server rejected an expired nonce, not the credentials
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate: Digest ...` header value.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let rest = match header.get(..7) {
            Some(scheme) if scheme.eq_ignore_ascii_case("digest ") => &header[7..],
            _ => return None,
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = None;
        let mut stale = false;
        for (key, value) in split_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop = Some(value),
                "algorithm" => algorithm = Some(value),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Some(Self {
            realm: realm.unwrap_or_default(),
            nonce: nonce?,
            opaque,
            qop,
            algorithm,
            stale,
        })
    }

    /// First Digest challenge among the `WWW-Authenticate` values.
    pub fn from_headers<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        values.into_iter().find_map(Self::parse)
    }

    fn supports_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .is_some_and(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
    }

    fn is_session_variant(&self) -> bool {
        self.algorithm
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case("MD5-sess"))
    }
}

/// `key=value` pairs separated by commas; quoted values may contain commas.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.trim().is_empty() {
            break;
        }
        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    c => value.push(c),
                }
            }
            value
        } else {
            chars.by_ref().take_while(|c| *c != ',').collect::<String>().trim().to_string()
        };
        params.push((key.trim().to_string(), value));
    }

    params
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Digest credentials bound to one server challenge.
#[derive(Debug)]
pub struct DigestAuth {
    username: String,
    password: String,
    challenge: DigestChallenge,
    nonce_count: AtomicU32,
}

impl DigestAuth {
    pub fn new(username: &str, password: &str, challenge: DigestChallenge) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            challenge,
            nonce_count: AtomicU32::new(0),
        }
    }

    /// `Authorization` header value for the next request.
    pub fn authorization(&self, method: &str, uri: &str) -> String {
        let nc = self.nonce_count.fetch_add(1, Ordering::SeqCst) + 1;
        let cnonce = Uuid::new_v4().simple().to_string()[..16].to_string();
        self.header_for(method, uri, nc, &cnonce)
    }

    fn response_for(&self, method: &str, uri: &str, nc: u32, cnonce: &str) -> String {
        let c = &self.challenge;
        let mut ha1 = md5_hex(&format!("{}:{}:{}", self.username, c.realm, self.password));
        if c.is_session_variant() {
            ha1 = md5_hex(&format!("{ha1}:{}:{cnonce}", c.nonce));
        }
        let ha2 = md5_hex(&format!("{method}:{uri}"));

        if c.supports_auth_qop() {
            md5_hex(&format!("{ha1}:{}:{nc:08x}:{cnonce}:auth:{ha2}", c.nonce))
        } else {
            md5_hex(&format!("{ha1}:{}:{ha2}", c.nonce))
        }
    }

    fn header_for(&self, method: &str, uri: &str, nc: u32, cnonce: &str) -> String {
        let c = &self.challenge;
        let response = self.response_for(method, uri, nc, cnonce);
        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
            self.username, c.realm, c.nonce, uri, response
        );
        if let Some(algorithm) = &c.algorithm {
            header.push_str(&format!(", algorithm={algorithm}"));
        }
        if c.supports_auth_qop() {
            header.push_str(&format!(r#", qop=auth, nc={nc:08x}, cnonce="{cnonce}""#));
        }
        if let Some(opaque) = &c.opaque {
            header.push_str(&format!(r#", opaque="{opaque}""#));
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfc_challenge() -> DigestChallenge {
        DigestChallenge::parse(
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_challenge() {
        let c = rfc_challenge();
        assert_eq!(c.realm, "testrealm@host.com");
        assert_eq!(c.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(c.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(c.opaque.as_deref(), Some("5ccc069c403ebaf9f0171e9517f40e41"));
        assert!(c.supports_auth_qop());
        assert!(!c.stale);
    }

    #[test]
    fn test_parse_stale_challenge() {
        let c = DigestChallenge::from_headers([
            r#"Basic realm="dav""#,
            r#"Digest realm="dav", nonce="fresh", qop="auth", stale=TRUE"#,
        ])
        .unwrap();
        assert_eq!(c.nonce, "fresh");
        assert!(c.stale);
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_none());
    }

    #[test]
    fn test_rfc2617_response() {
        let auth = DigestAuth::new("Mufasa", "Circle Of Life", rfc_challenge());
        assert_eq!(
            auth.response_for("GET", "/dir/index.html", 1, "0a4f113b"),
            "6629fae49393a05397450978507c4ef1"
        );
    }

    #[test]
    fn test_nonce_count_increments() {
        let auth = DigestAuth::new("u", "p", rfc_challenge());
        let first = auth.authorization("PROPFIND", "/dav");
        let second = auth.authorization("PROPFIND", "/dav");
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        assert!(first.starts_with("Digest username=\"u\""));
    }
}
