//! Shared test helpers: an in-memory DataSource and tree utilities.

use crate::datasource::{DataSource, MemoSlots, ProgressEvent, Reuse, SourceRef};
use crate::error::{Error, Result};
use crate::vfs::node::{Node, NodeRef};
use scraper::Html;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

/// In-memory [`DataSource`] with canned responses, call logging, and
/// per-path transient failure injection.
#[derive(Default)]
pub(crate) struct FakeDataSource {
    api_responses: HashMap<String, Value>,
    pages: HashMap<String, String>,
    files: HashMap<String, Vec<u8>>,
    redirects: HashMap<String, Option<String>>,
    file_failures: HashMap<String, u32>,
    size_failures: HashMap<String, u32>,
    memo: MemoSlots,
    /// Every API call issued, in order
    pub api_log: Vec<Vec<(String, String)>>,
    /// Every file fetched, in order
    pub file_log: Vec<String>,
    /// Every page fetched, in order
    pub page_log: Vec<String>,
}

impl FakeDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api(mut self, fields: &[(&str, &str)], value: Value) -> Self {
        self.api_responses.insert(api_key_of(fields), value);
        self
    }

    pub fn with_page(mut self, path: &str, html: &str) -> Self {
        self.pages.insert(path.to_string(), html.to_string());
        self
    }

    pub fn with_file(mut self, path: &str, bytes: &[u8]) -> Self {
        self.files.insert(path.to_string(), bytes.to_vec());
        self
    }

    pub fn with_redirect(mut self, path: &str, target: Option<&str>) -> Self {
        self.redirects
            .insert(path.to_string(), target.map(str::to_string));
        self
    }

    /// Make the next `times` fetches of `path` fail with a retryable
    /// server error before succeeding.
    pub fn fail_file_times(mut self, path: &str, times: u32) -> Self {
        self.file_failures.insert(path.to_string(), times);
        self
    }

    /// Make the next `times` size probes of `path` fail likewise.
    pub fn fail_size_times(mut self, path: &str, times: u32) -> Self {
        self.size_failures.insert(path.to_string(), times);
        self
    }

    pub fn into_source(self) -> Rc<RefCell<FakeDataSource>> {
        Rc::new(RefCell::new(self))
    }
}

/// Coerce the concrete fake handle into the trait-object handle the
/// tree wants.
pub(crate) fn as_source(fake: &Rc<RefCell<FakeDataSource>>) -> SourceRef {
    fake.clone()
}

fn api_key_of(fields: &[(&str, &str)]) -> String {
    let mut pairs: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join("&")
}

fn owned_key_of(fields: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join("&")
}

impl DataSource for FakeDataSource {
    fn api(&mut self, fields: &[(String, String)], reuse: Reuse) -> Result<Option<Value>> {
        self.api_log.push(fields.to_vec());
        if self.memo.check_api(fields, reuse) {
            return Ok(None);
        }
        let key = owned_key_of(fields);
        match self.api_responses.get(&key) {
            Some(value) => Ok(Some(value.clone())),
            None => Err(Error::malformed(format!("no fake API response for {key}"))),
        }
    }

    fn web_page(
        &mut self,
        path: &str,
        args: &[(String, String)],
        reuse: Reuse,
    ) -> Result<Option<Html>> {
        self.page_log.push(path.to_string());
        if self.memo.check_web(path, args, reuse) {
            return Ok(None);
        }
        match self.pages.get(path) {
            Some(html) => Ok(Some(Html::parse_document(html))),
            None => Err(Error::ServerError { status: 404 }),
        }
    }

    fn fetch_file(
        &mut self,
        path: &str,
        args: &[(String, String)],
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<()> {
        self.file_log.push(path.to_string());
        self.memo.note_web(path, args);
        if let Some(remaining) = self.file_failures.get_mut(path)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::ServerError { status: 503 });
        }
        let Some(bytes) = self.files.get(path) else {
            return Err(Error::ServerError { status: 404 });
        };
        progress(ProgressEvent::Begin);
        sink.write_all(bytes)?;
        if !bytes.is_empty() {
            progress(ProgressEvent::Transfer {
                total: Some(bytes.len() as u64),
                done: bytes.len() as u64,
            });
        }
        progress(ProgressEvent::End);
        Ok(())
    }

    fn file_size(&mut self, path: &str, args: &[(String, String)]) -> Result<u64> {
        self.memo.note_web(path, args);
        if let Some(remaining) = self.size_failures.get_mut(path)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::ServerError { status: 503 });
        }
        match self.files.get(path) {
            Some(bytes) => Ok(bytes.len() as u64),
            None => Err(Error::ServerError { status: 404 }),
        }
    }

    fn redirect_target(
        &mut self,
        path: &str,
        args: &[(String, String)],
    ) -> Result<Option<String>> {
        self.memo.note_web(path, args);
        match self.redirects.get(path) {
            Some(target) => Ok(target.clone()),
            None => Err(Error::ServerError { status: 404 }),
        }
    }
}

/// Read a node's full content into a byte vector.
pub(crate) fn read_node(node: &NodeRef) -> Vec<u8> {
    let mut out = Vec::new();
    #[allow(clippy::unwrap_used)]
    Node::read(node, &mut out, &mut |_| {}).unwrap();
    out
}
