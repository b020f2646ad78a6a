//! Session transport boundary
//!
//! The virtual filesystem never talks to the network directly; it goes
//! through the [`DataSource`] trait. The production implementation is
//! [`HttpDataSource`], a blocking `reqwest` client that carries the
//! platform session cookies and keeps redirects disabled so that
//! redirect probing stays observable.
//!
//! All calls share one underlying session and must be issued
//! sequentially; every method takes `&mut self` and the tree holds the
//! source behind a single-threaded `Rc<RefCell<..>>`.

use crate::config::Endpoints;
use crate::error::{Error, Result};
use scraper::Html;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::rc::Rc;
use url::Url;

/// Shared handle to the one session-owning data source
pub type SourceRef = Rc<RefCell<dyn DataSource>>;

/// Whether a call may be silently skipped when it repeats the previous one
///
/// This is the narrow anti-redundancy cache the platform forces on
/// callers: some endpoints must be "primed" by a semester call before
/// they answer, and the priming call is a no-op when it was already the
/// last call issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reuse {
    /// Always issue the request
    Fresh,
    /// Skip the request (returning `None`) when it is identical to the
    /// previous one in the same memo slot
    SkipIfRepeated,
}

/// Transfer progress events forwarded from a streaming read
///
/// `Begin` and `End` fire even for zero-length content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The transfer is about to start
    Begin,
    /// Bytes arrived; `total` is absent when the server did not say
    Transfer {
        /// Total size in bytes, when known
        total: Option<u64>,
        /// Bytes transferred so far
        done: u64,
    },
    /// The transfer finished
    End,
}

/// The contract the tree requires from the network/session layer
pub trait DataSource {
    /// Invoke the structured JSON API with the given query fields.
    ///
    /// Fails with [`Error::ServerError`] on a non-200 status and
    /// [`Error::MalformedResponse`] when the body does not parse as JSON.
    /// Returns `None` only when `reuse` allows skipping a repeated call.
    fn api(&mut self, fields: &[(String, String)], reuse: Reuse) -> Result<Option<Value>>;

    /// Fetch and parse an HTML page.
    ///
    /// Returns `None` only when `reuse` allows skipping a repeated call
    /// with the same path and arguments.
    fn web_page(
        &mut self,
        path: &str,
        args: &[(String, String)],
        reuse: Reuse,
    ) -> Result<Option<Html>>;

    /// Stream a file's bytes into `sink`, forwarding progress events
    fn fetch_file(
        &mut self,
        path: &str,
        args: &[(String, String)],
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<()>;

    /// Probe a file's size without downloading its body
    fn file_size(&mut self, path: &str, args: &[(String, String)]) -> Result<u64>;

    /// Probe where a path redirects to, if anywhere.
    ///
    /// Fails with [`Error::ServerError`] when the server answers anything
    /// other than a redirect.
    fn redirect_target(&mut self, path: &str, args: &[(String, String)])
    -> Result<Option<String>>;
}

/// Single-slot memoization state shared by [`DataSource`] implementations
///
/// One slot remembers the semester of the last `mode=semester` API call,
/// the other the `(path, args)` of the last page-level request. The
/// slots are owned per instance and scoped to one run; they are not a
/// general cache.
#[derive(Debug, Default)]
pub(crate) struct MemoSlots {
    api_semester: Option<String>,
    web_request: Option<(String, Vec<(String, String)>)>,
}

impl MemoSlots {
    /// Returns true when a `mode=semester` call may be skipped; records
    /// the call in the slot either way.
    pub(crate) fn check_api(&mut self, fields: &[(String, String)], reuse: Reuse) -> bool {
        let Some(semester) = semester_memo_key(fields) else {
            return false;
        };
        if reuse == Reuse::SkipIfRepeated && self.api_semester.as_deref() == Some(semester.as_str())
        {
            return true;
        }
        self.api_semester = Some(semester);
        false
    }

    /// Returns true when a page-level call may be skipped; records the
    /// call in the slot either way.
    pub(crate) fn check_web(
        &mut self,
        path: &str,
        args: &[(String, String)],
        reuse: Reuse,
    ) -> bool {
        if reuse == Reuse::SkipIfRepeated
            && let Some((memo_path, memo_args)) = &self.web_request
            && memo_path == path
            && memo_args == args
        {
            return true;
        }
        self.web_request = Some((path.to_string(), args.to_vec()));
        false
    }

    /// Record a file-level request in the page slot without skip logic
    pub(crate) fn note_web(&mut self, path: &str, args: &[(String, String)]) {
        self.web_request = Some((path.to_string(), args.to_vec()));
    }
}

/// The memo key of an API call: the semester field of `mode=semester`
/// calls, absent for every other mode.
fn semester_memo_key(fields: &[(String, String)]) -> Option<String> {
    let mode = fields.iter().find(|(k, _)| k == "mode")?;
    if mode.1 != "semester" {
        return None;
    }
    let semester = fields
        .iter()
        .find(|(k, _)| k == "semester")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    Some(semester)
}

/// Blocking HTTP implementation of [`DataSource`]
///
/// Cookies are sent as prebuilt `Cookie` header values, one set for the
/// API realm and one for the web realm, exactly as the platform issues
/// them. Redirects are never followed so that [`DataSource::redirect_target`]
/// can observe them.
pub struct HttpDataSource {
    client: reqwest::blocking::Client,
    api_url: Url,
    web_url: Url,
    file_url: Url,
    api_args: Vec<(String, String)>,
    api_cookie: String,
    web_cookie: String,
    memo: MemoSlots,
}

impl HttpDataSource {
    /// Build a data source from configured endpoints and cookie sets
    pub fn new(
        endpoints: &Endpoints,
        api_cookies: &BTreeMap<String, String>,
        web_cookies: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            api_url: parse_endpoint(&endpoints.api_url, "endpoints.api_url")?,
            web_url: parse_endpoint(&endpoints.web_url, "endpoints.web_url")?,
            file_url: parse_endpoint(&endpoints.file_url, "endpoints.file_url")?,
            api_args: endpoints
                .api_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            api_cookie: join_cookies(api_cookies),
            web_cookie: join_cookies(web_cookies),
            memo: MemoSlots::default(),
        })
    }

    fn web_request_url(&self, base: &Url, path: &str, args: &[(String, String)]) -> Result<Url> {
        // Percent-encode each segment; Url::join would pass '#' through
        // to the fragment otherwise.
        let encoded: String = path
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let mut url = base.join(&encoded)?;
        if !args.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(args.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(url)
    }

    fn get(&self, url: Url, cookie: &str) -> Result<reqwest::blocking::Response> {
        tracing::debug!(%url, "HTTP request");
        let response = self
            .client
            .get(url)
            .header(reqwest::header::COOKIE, cookie)
            .send()?;
        Ok(response)
    }
}

impl DataSource for HttpDataSource {
    fn api(&mut self, fields: &[(String, String)], reuse: Reuse) -> Result<Option<Value>> {
        tracing::debug!("preparing API request");
        if self.memo.check_api(fields, reuse) {
            tracing::debug!("ignoring repeated semester API request");
            return Ok(None);
        }
        let mut url = self.api_url.clone();
        url.query_pairs_mut().extend_pairs(
            self.api_args
                .iter()
                .chain(fields.iter())
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        let response = self.get(url, &self.api_cookie)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::ServerError { status });
        }
        let body = response.text()?;
        match serde_json::from_str(&body) {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(Error::malformed(body)),
        }
    }

    fn web_page(
        &mut self,
        path: &str,
        args: &[(String, String)],
        reuse: Reuse,
    ) -> Result<Option<Html>> {
        tracing::debug!(path, "preparing page request");
        if self.memo.check_web(path, args, reuse) {
            tracing::debug!(path, "ignoring repeated page request");
            return Ok(None);
        }
        let url = self.web_request_url(&self.web_url, path, args)?;
        let response = self.get(url, &self.web_cookie)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::ServerError { status });
        }
        let body = response.text()?;
        Ok(Some(Html::parse_document(&body)))
    }

    fn fetch_file(
        &mut self,
        path: &str,
        args: &[(String, String)],
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<()> {
        tracing::debug!(path, "preparing file download request");
        self.memo.note_web(path, args);
        let url = self.web_request_url(&self.file_url, path, args)?;
        let mut response = self.get(url, &self.web_cookie)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::ServerError { status });
        }
        let total = response.content_length();
        progress(ProgressEvent::Begin);
        let mut done: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = response.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            done += n as u64;
            progress(ProgressEvent::Transfer { total, done });
        }
        progress(ProgressEvent::End);
        Ok(())
    }

    fn file_size(&mut self, path: &str, args: &[(String, String)]) -> Result<u64> {
        tracing::debug!(path, "preparing file size probe");
        self.memo.note_web(path, args);
        let url = self.web_request_url(&self.file_url, path, args)?;
        let response = self
            .client
            .head(url)
            .header(reqwest::header::COOKIE, &self.web_cookie)
            .send()?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::ServerError { status });
        }
        response
            .content_length()
            .ok_or_else(|| Error::invalid_op("size probe response carried no Content-Length"))
    }

    fn redirect_target(
        &mut self,
        path: &str,
        args: &[(String, String)],
    ) -> Result<Option<String>> {
        tracing::debug!(path, "probing redirect target");
        self.memo.note_web(path, args);
        let url = self.web_request_url(&self.web_url, path, args)?;
        let response = self.get(url, &self.web_cookie)?;
        let status = response.status().as_u16();
        if status != 302 {
            return Err(Error::ServerError { status });
        }
        Ok(response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string()))
    }
}

fn parse_endpoint(value: &str, key: &str) -> Result<Url> {
    if value.is_empty() {
        return Err(Error::Config {
            message: format!("{key} is not set; configure your platform endpoints"),
            key: Some(key.to_string()),
        });
    }
    Ok(Url::parse(value)?)
}

fn join_cookies(cookies: &BTreeMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn semester_memo_key_only_matches_semester_mode() {
        assert_eq!(
            semester_memo_key(&fields(&[("mode", "semester"), ("semester", "112-1")])),
            Some("112-1".to_string())
        );
        assert_eq!(
            semester_memo_key(&fields(&[("mode", "semester")])),
            Some(String::new()),
            "semester listing call memoizes on the empty key"
        );
        assert_eq!(
            semester_memo_key(&fields(&[("mode", "course"), ("semester", "112-1")])),
            None
        );
        assert_eq!(semester_memo_key(&fields(&[])), None);
    }

    #[test]
    fn api_memo_skips_only_repeated_semester_with_opt_in() {
        let mut memo = MemoSlots::default();
        let call = fields(&[("mode", "semester"), ("semester", "112-1")]);

        assert!(!memo.check_api(&call, Reuse::SkipIfRepeated), "first call runs");
        assert!(memo.check_api(&call, Reuse::SkipIfRepeated), "repeat skipped");
        assert!(
            !memo.check_api(&call, Reuse::Fresh),
            "opting out always issues the request"
        );

        let other = fields(&[("mode", "semester"), ("semester", "112-2")]);
        assert!(
            !memo.check_api(&other, Reuse::SkipIfRepeated),
            "different semester misses the single slot"
        );
        assert!(
            !memo.check_api(&call, Reuse::SkipIfRepeated),
            "the slot only remembers the previous call"
        );
    }

    #[test]
    fn web_memo_keys_on_path_and_args() {
        let mut memo = MemoSlots::default();
        let args = fields(&[("csn", "1234")]);

        assert!(!memo.check_web("/modules/index.php", &args, Reuse::SkipIfRepeated));
        assert!(memo.check_web("/modules/index.php", &args, Reuse::SkipIfRepeated));
        assert!(!memo.check_web("/modules/index.php", &[], Reuse::SkipIfRepeated));
        assert!(!memo.check_web("/other.php", &[], Reuse::SkipIfRepeated));
    }

    #[test]
    fn file_requests_refresh_the_web_slot() {
        let mut memo = MemoSlots::default();
        assert!(!memo.check_web("/a", &[], Reuse::SkipIfRepeated));
        memo.note_web("/b", &[]);
        assert!(
            !memo.check_web("/a", &[], Reuse::SkipIfRepeated),
            "a file request in between invalidates the slot"
        );
    }

    #[test]
    fn join_cookies_renders_key_value_pairs() {
        let mut cookies = BTreeMap::new();
        cookies.insert("PHPSESSID".to_string(), "abc123".to_string());
        cookies.insert("user".to_string(), "b01234567".to_string());
        assert_eq!(join_cookies(&cookies), "PHPSESSID=abc123;user=b01234567");
    }

    #[test]
    fn empty_endpoint_is_a_config_error() {
        let err = parse_endpoint("", "endpoints.api_url").unwrap_err();
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("endpoints.api_url")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn web_request_url_percent_encodes_segments() {
        let endpoints = Endpoints {
            api_url: "https://lms.example.edu/app/login.php".into(),
            web_url: "https://lms.example.edu".into(),
            file_url: "https://lms.example.edu".into(),
            session_check_url: "https://lms.example.edu/check.php".into(),
            api_args: BTreeMap::new(),
        };
        let source = HttpDataSource::new(&endpoints, &BTreeMap::new(), &BTreeMap::new()).unwrap();
        let url = source
            .web_request_url(
                &source.file_url,
                "/course/1234/hw/report #2.pdf",
                &fields(&[("hw_sn", "77")]),
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://lms.example.edu/course/1234/hw/report%20%232.pdf?hw_sn=77"
        );
    }
}
