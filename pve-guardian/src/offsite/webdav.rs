//! WebDAV client with endpoint discovery.
//!
//! Servers disagree on where the DAV tree is mounted (`/`, `/dav`,
//! `/remote.php/webdav`, ...) and on which auth scheme they accept, so a
//! client first probes candidate mount points and schemes and then sticks
//! to the first combination that answers a PROPFIND.

use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, Url};
use serde::Serialize;

use super::digest::{DigestAuth, DigestChallenge};
use super::propfind::{parse_multistatus, PROPFIND_BODY};
use super::{OffsiteError, OffsiteProvider, OffsiteStore, RemoteEntry};
use crate::config::OffsiteConfig;
use crate::models::artifact::is_backup_archive;
use crate::transfer::progress::{copy_with_progress, part_path, ProgressReader};
use crate::transfer::{format_bytes, ProgressCallback};

const USER_AGENT: &str = concat!("pve-guardian/", env!("CARGO_PKG_VERSION"));
const ALIST_PORT: u16 = 5244;
const MIN_UPLOAD_TIMEOUT_SECS: u64 = 300;
const UPLOAD_SECS_PER_MIB: u64 = 2;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    Basic,
    Digest,
    /// Credentials embedded in the URL
    UrlCredentials,
}

impl AuthScheme {
    pub const ORDER: [AuthScheme; 3] = [AuthScheme::Basic, AuthScheme::Digest, AuthScheme::UrlCredentials];
}

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthScheme::Basic => "basic",
            AuthScheme::Digest => "digest",
            AuthScheme::UrlCredentials => "url-credentials",
        };
        f.write_str(name)
    }
}

/// Mount point, collection URL and auth scheme found by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEndpoint {
    pub root: String,
    pub collection: String,
    pub scheme: AuthScheme,
}

fn dav_method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("valid HTTP method token")
}

fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Mount points to probe, most likely first.
pub fn candidate_roots(base: &str, username: &str) -> Result<Vec<String>, OffsiteError> {
    let base = base.trim();
    let url = Url::parse(base).map_err(|_| OffsiteError::InvalidUrl(base.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(OffsiteError::InvalidUrl(base.to_string()));
    }

    let base = base.trim_end_matches('/');
    let path = url.path().trim_end_matches('/');

    let mut suffixes = vec![String::new()];
    if !path.ends_with("/dav") {
        suffixes.push("/dav".to_string());
    }
    if !path.contains("/remote.php") && !path.contains("/dav/files") {
        suffixes.push("/remote.php/webdav".to_string());
        if !username.is_empty() {
            suffixes.push(format!("/dav/files/{}", encode_segment(username)));
        }
    }
    if url.port() == Some(ALIST_PORT) {
        if let Some(pos) = suffixes.iter().position(|s| s == "/dav") {
            let dav = suffixes.remove(pos);
            suffixes.insert(0, dav);
        }
    }

    Ok(suffixes.into_iter().map(|s| format!("{base}{s}")).collect())
}

/// `root` joined with every non-empty segment of `sub_path`.
pub fn collection_url(root: &str, sub_path: &str) -> String {
    let mut url = root.trim_end_matches('/').to_string();
    for segment in sub_path.split('/').filter(|s| !s.is_empty()) {
        url.push('/');
        url.push_str(&encode_segment(segment));
    }
    url
}

fn request_uri(url: &str) -> Result<String, OffsiteError> {
    let parsed = Url::parse(url).map_err(|_| OffsiteError::InvalidUrl(url.to_string()))?;
    Ok(match parsed.query() {
        Some(q) => format!("{}?{}", parsed.path(), q),
        None => parsed.path().to_string(),
    })
}

fn authorize(
    http: &Client,
    config: &OffsiteConfig,
    scheme: AuthScheme,
    digest: Option<&DigestAuth>,
    method: Method,
    url: &str,
) -> Result<RequestBuilder, OffsiteError> {
    let builder = match scheme {
        AuthScheme::Basic => http
            .request(method, url)
            .basic_auth(&config.username, Some(&config.password)),
        AuthScheme::Digest => {
            let header = digest.map(|d| request_uri(url).map(|uri| d.authorization(method.as_str(), &uri)));
            let builder = http.request(method, url);
            match header {
                Some(value) => builder.header(AUTHORIZATION, value?),
                None => builder,
            }
        }
        AuthScheme::UrlCredentials => {
            let mut with_creds = Url::parse(url).map_err(|_| OffsiteError::InvalidUrl(url.to_string()))?;
            with_creds
                .set_username(&config.username)
                .and_then(|_| with_creds.set_password(Some(&config.password)))
                .map_err(|_| OffsiteError::InvalidUrl(url.to_string()))?;
            http.request(method, with_creds)
        }
    };
    Ok(builder)
}

fn propfind(builder: RequestBuilder, depth: &'static str) -> RequestBuilder {
    builder
        .header("Depth", depth)
        .header(CONTENT_TYPE, "application/xml; charset=utf-8")
        .body(PROPFIND_BODY)
}

fn is_listing_ok(status: u16) -> bool {
    matches!(status, 200 | 207)
}

struct Probe {
    status: u16,
    digest: Option<DigestAuth>,
}

fn probe(http: &Client, config: &OffsiteConfig, scheme: AuthScheme, url: &str) -> Result<Probe, OffsiteError> {
    if scheme != AuthScheme::Digest {
        let resp = propfind(authorize(http, config, scheme, None, dav_method("PROPFIND"), url)?, "0").send()?;
        return Ok(Probe {
            status: resp.status().as_u16(),
            digest: None,
        });
    }

    let resp = propfind(http.request(dav_method("PROPFIND"), url), "0").send()?;
    if resp.status().as_u16() != 401 {
        return Ok(Probe {
            status: resp.status().as_u16(),
            digest: None,
        });
    }
    let Some(challenge) = digest_challenge(&resp) else {
        return Ok(Probe { status: 401, digest: None });
    };

    let digest = DigestAuth::new(&config.username, &config.password, challenge);
    let resp = propfind(
        authorize(http, config, scheme, Some(&digest), dav_method("PROPFIND"), url)?,
        "0",
    )
    .send()?;
    Ok(Probe {
        status: resp.status().as_u16(),
        digest: Some(digest),
    })
}

fn digest_challenge(resp: &Response) -> Option<DigestChallenge> {
    DigestChallenge::from_headers(resp.headers().get_all(WWW_AUTHENTICATE).iter().filter_map(|v| v.to_str().ok()))
}

/// Upload request variants, tried in order until one is accepted.
fn upload_variants() -> [(Method, &'static str, bool); 6] {
    [
        (Method::PUT, "application/octet-stream", false),
        (Method::PUT, "application/x-tar", false),
        (Method::PUT, "application/octet-stream", true),
        (Method::POST, "application/octet-stream", false),
        (Method::POST, "application/x-tar", false),
        (Method::POST, "application/octet-stream", true),
    ]
}

fn upload_timeout(size: u64) -> Duration {
    let mib = size / (1024 * 1024);
    Duration::from_secs(MIN_UPLOAD_TIMEOUT_SECS.max(mib * UPLOAD_SECS_PER_MIB))
}

pub struct WebDavClient {
    http: Client,
    config: OffsiteConfig,
    endpoint: ResolvedEndpoint,
    digest: Mutex<Option<DigestAuth>>,
    collection_exists: AtomicBool,
}

impl WebDavClient {
    /// Probe candidate mount points and auth schemes until a PROPFIND on
    /// the configured collection succeeds.
    pub fn discover(config: &OffsiteConfig) -> Result<Self, OffsiteError> {
        let roots = candidate_roots(&config.url, &config.username)?;
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        let mut failures = Vec::new();
        for root in &roots {
            let collection = collection_url(root, &config.path);

            for scheme in AuthScheme::ORDER {
                let found = match probe(&http, config, scheme, &collection) {
                    Ok(found) => found,
                    Err(OffsiteError::Http(e)) if e.is_connect() || e.is_timeout() => {
                        return Err(OffsiteError::Discovery(format!("{root}: {e}")));
                    }
                    Err(e) => {
                        failures.push(format!("{collection} [{scheme}]: {e}"));
                        continue;
                    }
                };

                if is_listing_ok(found.status) {
                    return Ok(Self::resolved(http, config, root, collection, scheme, found.digest, true));
                }

                if found.status == 404 {
                    // Mount point answers but the collection is missing.
                    if collection != *root {
                        if let Ok(mount) = probe(&http, config, scheme, root) {
                            if is_listing_ok(mount.status) {
                                let digest = mount.digest.or(found.digest);
                                return Ok(Self::resolved(http, config, root, collection, scheme, digest, false));
                            }
                        }
                    }
                    failures.push(format!("{collection} [{scheme}]: HTTP 404"));
                    break;
                }

                failures.push(format!("{collection} [{scheme}]: HTTP {}", found.status));
            }
        }

        Err(OffsiteError::Discovery(failures.join("; ")))
    }

    fn resolved(
        http: Client,
        config: &OffsiteConfig,
        root: &str,
        collection: String,
        scheme: AuthScheme,
        digest: Option<DigestAuth>,
        exists: bool,
    ) -> Self {
        tracing::info!(
            root = %root,
            collection = %collection,
            scheme = %scheme,
            exists,
            "Resolved WebDAV endpoint"
        );
        Self {
            http,
            config: config.clone(),
            endpoint: ResolvedEndpoint {
                root: root.to_string(),
                collection,
                scheme,
            },
            digest: Mutex::new(digest),
            collection_exists: AtomicBool::new(exists),
        }
    }

    pub fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, OffsiteError> {
        let digest = self.digest.lock().unwrap_or_else(PoisonError::into_inner);
        authorize(&self.http, &self.config, self.endpoint.scheme, digest.as_ref(), method, url)
    }

    /// Swap in the server's new Digest challenge after a 401. Returns
    /// whether the request is worth repeating.
    fn renew_digest(&self, resp: &Response) -> bool {
        if self.endpoint.scheme != AuthScheme::Digest || resp.status().as_u16() != 401 {
            return false;
        }
        let Some(challenge) = digest_challenge(resp) else {
            return false;
        };
        tracing::info!(stale = challenge.stale, "WebDAV server issued a new Digest nonce");
        let renewed = DigestAuth::new(&self.config.username, &self.config.password, challenge);
        *self.digest.lock().unwrap_or_else(PoisonError::into_inner) = Some(renewed);
        true
    }

    /// Send a request built by `build`, once more with a fresh nonce if the
    /// server's Digest nonce expired.
    fn send(
        &self,
        method: &Method,
        url: &str,
        build: impl Fn(RequestBuilder) -> Result<RequestBuilder, OffsiteError>,
    ) -> Result<Response, OffsiteError> {
        let resp = build(self.request(method.clone(), url)?)?.send()?;
        if !self.renew_digest(&resp) {
            return Ok(resp);
        }
        drop(resp);
        Ok(build(self.request(method.clone(), url)?)?.send()?)
    }

    fn file_url(&self, name: &str) -> String {
        format!("{}/{}", self.endpoint.collection, encode_segment(name))
    }

    fn status_error(method: &Method, url: &str, status: u16) -> OffsiteError {
        OffsiteError::Status {
            method: method.to_string(),
            url: url.to_string(),
            status,
        }
    }
}

impl OffsiteStore for WebDavClient {
    fn ensure_directory(&self) -> Result<(), OffsiteError> {
        if self.collection_exists.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut url = self.endpoint.root.trim_end_matches('/').to_string();
        for segment in self.config.path.split('/').filter(|s| !s.is_empty()) {
            url.push('/');
            url.push_str(&encode_segment(segment));

            let status = self
                .send(&dav_method("PROPFIND"), &url, |b| Ok(propfind(b, "0")))?
                .status()
                .as_u16();
            if is_listing_ok(status) {
                continue;
            }
            if status != 404 {
                return Err(Self::status_error(&dav_method("PROPFIND"), &url, status));
            }

            let mkcol = dav_method("MKCOL");
            let status = self.send(&mkcol, &url, Ok)?.status().as_u16();
            match status {
                200 | 201 | 204 => tracing::info!(url = %url, "Created offsite directory"),
                // Raced with another client or the server refuses MKCOL on existing paths.
                405 => {}
                s => return Err(Self::status_error(&mkcol, &url, s)),
            }
        }

        self.collection_exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upload(&self, local: &Path, name: &str, on_progress: ProgressCallback) -> Result<(), OffsiteError> {
        let url = self.file_url(name);
        let size = fs::metadata(local)?.len();
        let timeout = upload_timeout(size);
        let retry_delay = Duration::from_secs(self.config.upload_retry_delay_secs);
        tracing::info!(file = %name, size = %format_bytes(size), "Uploading to offsite storage");

        let mut rejected = Vec::new();
        for (method, content_type, overwrite) in upload_variants() {
            let mut overwrite = overwrite;
            let mut conflict_retried = false;
            let mut retries = 0;

            loop {
                let sent = self.send(&method, &url, |request| {
                    let body = Body::sized(ProgressReader::new(File::open(local)?, size, on_progress.clone()), size);
                    let request = request.header(CONTENT_TYPE, content_type).timeout(timeout).body(body);
                    Ok(if overwrite { request.header("Overwrite", "T") } else { request })
                });

                let failure = match sent {
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        match status {
                            200..=299 => {
                                tracing::info!(file = %name, method = %method, status, "Offsite upload complete");
                                return Ok(());
                            }
                            404 | 405 => {
                                rejected.push(format!("{method} {content_type}: HTTP {status}"));
                                break;
                            }
                            409 if !conflict_retried => {
                                conflict_retried = true;
                                overwrite = true;
                                continue;
                            }
                            507 => return Err(OffsiteError::InsufficientStorage),
                            _ => format!("HTTP {status}"),
                        }
                    }
                    Err(OffsiteError::Io(e)) => return Err(OffsiteError::Io(e)),
                    Err(e) => e.to_string(),
                };

                if retries >= self.config.upload_retries {
                    rejected.push(format!("{method} {content_type}: {failure}"));
                    break;
                }
                retries += 1;
                tracing::warn!(
                    file = %name,
                    method = %method,
                    error = %failure,
                    retry = retries,
                    max = self.config.upload_retries,
                    "Offsite upload attempt failed, retrying"
                );
                thread::sleep(retry_delay);
            }
        }

        Err(OffsiteError::UploadRejected {
            name: name.to_string(),
            attempts: rejected.join("; "),
        })
    }

    fn download(&self, name: &str, local: &Path, on_progress: ProgressCallback) -> Result<u64, OffsiteError> {
        let url = self.file_url(name);
        let mut resp = self.send(&Method::GET, &url, |b| Ok(b.timeout(DOWNLOAD_TIMEOUT)))?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(Self::status_error(&Method::GET, &url, status));
        }

        let total = resp.content_length().unwrap_or(0);
        let part = part_path(local);
        let result = File::create(&part).and_then(|mut out| {
            let copied = copy_with_progress(&mut resp, &mut out, total, &mut |done, total| on_progress(done, total))?;
            out.sync_all()?;
            Ok(copied)
        });

        match result {
            Ok(copied) => {
                fs::rename(&part, local)?;
                tracing::info!(file = %name, size = %format_bytes(copied), "Offsite download complete");
                Ok(copied)
            }
            Err(e) => {
                let _ = fs::remove_file(&part);
                Err(e.into())
            }
        }
    }

    fn list(&self) -> Result<Vec<RemoteEntry>, OffsiteError> {
        let url = format!("{}/", self.endpoint.collection);
        let resp = self.send(&dav_method("PROPFIND"), &url, |b| Ok(propfind(b, "1")))?;
        let status = resp.status().as_u16();
        if status == 404 && !self.collection_exists.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        if !is_listing_ok(status) {
            return Err(Self::status_error(&dav_method("PROPFIND"), &url, status));
        }

        let body = resp.text()?;
        let entries = parse_multistatus(&body)?
            .into_iter()
            .filter(|e| !e.is_collection)
            .filter_map(|e| {
                let name = e.name();
                is_backup_archive(&name).then_some(RemoteEntry {
                    name,
                    size: e.size,
                    modified: e.modified,
                })
            })
            .collect();
        Ok(entries)
    }

    fn delete(&self, name: &str) -> Result<(), OffsiteError> {
        let url = self.file_url(name);
        let status = self.send(&Method::DELETE, &url, Ok)?.status().as_u16();
        match status {
            200..=299 | 404 => Ok(()),
            s => Err(Self::status_error(&Method::DELETE, &url, s)),
        }
    }
}

/// Opens a freshly discovered [`WebDavClient`] per task.
#[derive(Debug, Clone)]
pub struct WebDavProvider {
    config: OffsiteConfig,
}

impl WebDavProvider {
    pub fn new(config: OffsiteConfig) -> Self {
        Self { config }
    }
}

impl OffsiteProvider for WebDavProvider {
    fn open(&self) -> Result<Box<dyn OffsiteStore>, OffsiteError> {
        if !self.config.enabled || self.config.url.trim().is_empty() {
            return Err(OffsiteError::NotConfigured);
        }
        Ok(Box::new(WebDavClient::discover(&self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::sync::Arc;
    use tempfile::TempDir;

    const ARCHIVE: &str = "vzdump-qemu-100-2024_01_15-02_00_03.vma.zst";

    fn config_for(server: &Server) -> OffsiteConfig {
        OffsiteConfig {
            enabled: true,
            url: server.url(),
            username: "backup".into(),
            password: "secret".into(),
            path: "backups".into(),
            upload_retries: 1,
            upload_retry_delay_secs: 0,
            timeout_secs: 5,
            ..OffsiteConfig::default()
        }
    }

    fn listing(names: &[&str]) -> String {
        let mut body = String::from(
            r#"<?xml version="1.0"?><d:multistatus xmlns:d="DAV:"><d:response><d:href>/backups/</d:href><d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat></d:response>"#,
        );
        for name in names {
            body.push_str(&format!(
                "<d:response><d:href>/backups/{name}</d:href><d:propstat><d:prop><d:resourcetype/><d:getcontentlength>4</d:getcontentlength><d:getlastmodified>Mon, 15 Jan 2024 02:10:00 GMT</d:getlastmodified></d:prop></d:propstat></d:response>"
            ));
        }
        body.push_str("</d:multistatus>");
        body
    }

    fn discovered(server: &mut Server) -> WebDavClient {
        server
            .mock("PROPFIND", "/backups")
            .match_header("depth", "0")
            .with_status(207)
            .with_body(listing(&[]))
            .create();
        WebDavClient::discover(&config_for(server)).unwrap()
    }

    fn archive(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join(ARCHIVE);
        std::fs::write(&path, b"data").unwrap();
        path
    }

    fn no_progress() -> ProgressCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_candidate_roots_order() {
        let roots = candidate_roots("https://cloud.example.com/", "alice").unwrap();
        assert_eq!(
            roots,
            vec![
                "https://cloud.example.com",
                "https://cloud.example.com/dav",
                "https://cloud.example.com/remote.php/webdav",
                "https://cloud.example.com/dav/files/alice",
            ]
        );
    }

    #[test]
    fn test_candidate_roots_alist_prefers_dav() {
        let roots = candidate_roots("http://nas:5244", "").unwrap();
        assert_eq!(roots[0], "http://nas:5244/dav");
        assert_eq!(roots[1], "http://nas:5244");
    }

    #[test]
    fn test_candidate_roots_rejects_garbage() {
        assert!(matches!(candidate_roots("nas:5005", ""), Err(OffsiteError::InvalidUrl(_))));
        assert!(matches!(candidate_roots("ftp://nas/", ""), Err(OffsiteError::InvalidUrl(_))));
    }

    #[test]
    fn test_collection_url_encodes_segments() {
        assert_eq!(
            collection_url("http://nas/dav/", "/pve backups//node 1/"),
            "http://nas/dav/pve%20backups/node%201"
        );
        assert_eq!(collection_url("http://nas", ""), "http://nas");
    }

    #[test]
    fn test_upload_timeout_scales_with_size() {
        assert_eq!(upload_timeout(10 * 1024 * 1024), Duration::from_secs(300));
        assert_eq!(upload_timeout(1024 * 1024 * 1024), Duration::from_secs(2048));
    }

    #[test]
    fn test_discovery_falls_back_to_dav_prefix() {
        let mut server = Server::new();
        server
            .mock("PROPFIND", "/dav/backups")
            .with_status(207)
            .with_body(listing(&[]))
            .create();

        let client = WebDavClient::discover(&config_for(&server)).unwrap();
        assert_eq!(client.endpoint().root, format!("{}/dav", server.url()));
        assert_eq!(client.endpoint().collection, format!("{}/dav/backups", server.url()));
        assert_eq!(client.endpoint().scheme, AuthScheme::Basic);
    }

    #[test]
    fn test_discovery_uses_digest_after_basic_is_refused() {
        let mut server = Server::new();
        server
            .mock("PROPFIND", "/backups")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .with_status(401)
            .create();
        server
            .mock("PROPFIND", "/backups")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", r#"Digest realm="dav", nonce="abc123", qop="auth""#)
            .create();
        let digest = server
            .mock("PROPFIND", "/backups")
            .match_header("authorization", Matcher::Regex(r#"^Digest username="backup""#.into()))
            .with_status(207)
            .with_body(listing(&[]))
            .expect(1)
            .create();

        let client = WebDavClient::discover(&config_for(&server)).unwrap();
        assert_eq!(client.endpoint().scheme, AuthScheme::Digest);
        digest.assert();
    }

    #[test]
    fn test_upload_renews_stale_digest_nonce() {
        let mut server = Server::new();
        server
            .mock("PROPFIND", "/backups")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .with_status(401)
            .create();
        server
            .mock("PROPFIND", "/backups")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", r#"Digest realm="dav", nonce="first", qop="auth""#)
            .create();
        server
            .mock("PROPFIND", "/backups")
            .match_header("authorization", Matcher::Regex(r#"nonce="first""#.into()))
            .with_status(207)
            .with_body(listing(&[]))
            .create();
        let client = WebDavClient::discover(&config_for(&server)).unwrap();
        assert_eq!(client.endpoint().scheme, AuthScheme::Digest);

        let dir = TempDir::new().unwrap();
        let path = format!("/backups/{ARCHIVE}");
        let expired = server
            .mock("PUT", path.as_str())
            .match_header("authorization", Matcher::Regex(r#"nonce="first""#.into()))
            .with_status(401)
            .with_header("www-authenticate", r#"Digest realm="dav", nonce="second", qop="auth", stale=true"#)
            .expect(1)
            .create();
        let renewed = server
            .mock("PUT", path.as_str())
            .match_header(
                "authorization",
                Matcher::AllOf(vec![
                    Matcher::Regex(r#"nonce="second""#.into()),
                    Matcher::Regex("nc=00000001".into()),
                ]),
            )
            .match_body("data")
            .with_status(201)
            .expect(1)
            .create();

        client.upload(&archive(&dir), ARCHIVE, no_progress()).unwrap();
        expired.assert();
        renewed.assert();
    }

    #[test]
    fn test_missing_collection_is_created() {
        let mut server = Server::new();
        server.mock("PROPFIND", "/backups").with_status(404).create();
        server.mock("PROPFIND", "/").with_status(207).with_body(listing(&[])).create();
        server.mock("PROPFIND", "/backups/").with_status(404).create();
        let mkcol = server.mock("MKCOL", "/backups").with_status(201).expect(1).create();

        let client = WebDavClient::discover(&config_for(&server)).unwrap();
        assert_eq!(client.endpoint().root, server.url());
        assert!(client.list().unwrap().is_empty());

        client.ensure_directory().unwrap();
        client.ensure_directory().unwrap();
        mkcol.assert();
    }

    #[test]
    fn test_discovery_reports_every_failure() {
        let server = Server::new();
        let err = WebDavClient::discover(&config_for(&server)).err().unwrap();
        match err {
            OffsiteError::Discovery(detail) => {
                assert!(detail.contains("/remote.php/webdav/backups"));
                assert!(detail.contains("HTTP 501"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_upload_falls_through_rejected_methods() {
        let mut server = Server::new();
        let client = discovered(&mut server);
        let dir = TempDir::new().unwrap();
        let path = format!("/backups/{ARCHIVE}");

        let put = server.mock("PUT", path.as_str()).with_status(405).expect(3).create();
        let post = server
            .mock("POST", path.as_str())
            .match_header("content-type", "application/octet-stream")
            .match_body("data")
            .with_status(201)
            .expect(1)
            .create();

        client.upload(&archive(&dir), ARCHIVE, no_progress()).unwrap();
        put.assert();
        post.assert();
    }

    #[test]
    fn test_upload_conflict_retries_with_overwrite() {
        let mut server = Server::new();
        let client = discovered(&mut server);
        let dir = TempDir::new().unwrap();
        let path = format!("/backups/{ARCHIVE}");

        let conflict = server
            .mock("PUT", path.as_str())
            .match_header("overwrite", Matcher::Missing)
            .with_status(409)
            .expect(1)
            .create();
        let overwrite = server
            .mock("PUT", path.as_str())
            .match_header("overwrite", "T")
            .with_status(204)
            .expect(1)
            .create();

        client.upload(&archive(&dir), ARCHIVE, no_progress()).unwrap();
        conflict.assert();
        overwrite.assert();
    }

    #[test]
    fn test_upload_insufficient_storage_aborts() {
        let mut server = Server::new();
        let client = discovered(&mut server);
        let dir = TempDir::new().unwrap();
        let path = format!("/backups/{ARCHIVE}");

        let put = server.mock("PUT", path.as_str()).with_status(507).expect(1).create();
        let post = server.mock("POST", path.as_str()).with_status(201).expect(0).create();

        let err = client.upload(&archive(&dir), ARCHIVE, no_progress()).unwrap_err();
        assert!(matches!(err, OffsiteError::InsufficientStorage));
        put.assert();
        post.assert();
    }

    #[test]
    fn test_upload_retries_transient_errors() {
        let mut server = Server::new();
        let client = discovered(&mut server);
        let dir = TempDir::new().unwrap();
        let path = format!("/backups/{ARCHIVE}");

        // upload_retries = 1: two tries per variant
        let put = server.mock("PUT", path.as_str()).with_status(502).expect(6).create();
        let post = server.mock("POST", path.as_str()).with_status(502).expect(6).create();

        let err = client.upload(&archive(&dir), ARCHIVE, no_progress()).unwrap_err();
        assert!(matches!(err, OffsiteError::UploadRejected { .. }));
        put.assert();
        post.assert();
    }

    #[test]
    fn test_upload_list_delete_round_trip() {
        let mut server = Server::new();
        let client = discovered(&mut server);
        let dir = TempDir::new().unwrap();
        let path = format!("/backups/{ARCHIVE}");

        server.mock("PUT", path.as_str()).with_status(201).create();
        client.upload(&archive(&dir), ARCHIVE, no_progress()).unwrap();

        let listed = server
            .mock("PROPFIND", "/backups/")
            .match_header("depth", "1")
            .with_status(207)
            .with_body(listing(&[ARCHIVE, "notes.txt"]))
            .create();
        let entries = client.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, ARCHIVE);
        assert_eq!(entries[0].size, Some(4));
        assert!(entries[0].modified.is_some());

        server.mock("DELETE", path.as_str()).with_status(204).create();
        client.delete(ARCHIVE).unwrap();

        listed.remove();
        server
            .mock("PROPFIND", "/backups/")
            .with_status(207)
            .with_body(listing(&[]))
            .create();
        assert!(client.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_file_succeeds() {
        let mut server = Server::new();
        let client = discovered(&mut server);
        server.mock("DELETE", "/backups/gone.vma").with_status(404).create();
        server.mock("DELETE", "/backups/locked.vma").with_status(423).create();

        client.delete("gone.vma").unwrap();
        assert!(matches!(
            client.delete("locked.vma"),
            Err(OffsiteError::Status { status: 423, .. })
        ));
    }

    #[test]
    fn test_download_writes_file() {
        let mut server = Server::new();
        let client = discovered(&mut server);
        let dir = TempDir::new().unwrap();
        server
            .mock("GET", format!("/backups/{ARCHIVE}").as_str())
            .with_status(200)
            .with_body("archive-bytes")
            .create();

        let target = dir.path().join(ARCHIVE);
        let copied = client.download(ARCHIVE, &target, no_progress()).unwrap();
        assert_eq!(copied, 13);
        assert_eq!(std::fs::read(&target).unwrap(), b"archive-bytes");
        assert!(!part_path(&target).exists());
    }
}
