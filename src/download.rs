//! Download orchestrator: materialize a resolved subtree onto disk
//!
//! Walks a virtual-filesystem path depth-first and reproduces it under
//! the destination root: directories 1:1, regular files streamed with
//! exclusive-create semantics, internal links as symlinks, external
//! links skipped (they are listing-level objects). Every branch retries
//! with the configured policy, and a run is idempotent: repeating it
//! against an unchanged remote skips everything it already wrote.
//!
//! Idempotence policy for regular files: a pre-existing file of matching
//! size is deep-compared byte-for-byte when the node's content is
//! locally re-derivable, and skipped on size alone when it would have to
//! be re-streamed from the remote source. Two remote files of identical
//! size are therefore indistinguishable; that approximation is the
//! price of skip-if-unchanged for expensive reads.

use crate::datasource::ProgressEvent;
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::vfs::node::{Node, NodeKind, NodeRef};
use crate::vfs::{join_vfs_path, Vfs};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(windows)]
use std::os::windows::fs::symlink_file as symlink;

/// Receiver for per-path download progress
///
/// Skipped paths report nothing; `finished` fires once per path that
/// was actually written.
pub trait Report {
    /// A transfer event for `path`
    fn progress(&mut self, path: &str, event: ProgressEvent) {
        let _ = (path, event);
    }

    /// `path` was written successfully
    fn finished(&mut self, path: &str) {
        let _ = path;
    }
}

/// A [`Report`] that discards everything
pub struct SilentReport;

impl Report for SilentReport {}

enum Outcome {
    Done,
    Skipped,
}

/// Reproduces virtual-filesystem subtrees on local disk
pub struct Downloader<'a> {
    vfs: &'a Vfs,
    policy: RetryPolicy,
    dest_root: PathBuf,
}

impl<'a> Downloader<'a> {
    /// A downloader writing into the current working directory
    pub fn new(vfs: &'a Vfs, policy: RetryPolicy) -> Self {
        Downloader {
            vfs,
            policy,
            dest_root: PathBuf::from("."),
        }
    }

    /// Write into `root` instead of the current working directory
    pub fn with_destination(mut self, root: impl Into<PathBuf>) -> Self {
        self.dest_root = root.into();
        self
    }

    /// Materialize every path, attempting all of them even after a
    /// failure; the overall result is the logical AND.
    pub fn run_all(&self, paths: &[String], report: &mut dyn Report) -> bool {
        let mut succeeded = true;
        for path in paths {
            succeeded = self.run(path, report) && succeeded;
        }
        succeeded
    }

    /// Materialize one path and everything below it. A failed child
    /// fails its enclosing directory, but never aborts the process.
    pub fn run(&self, path: &str, report: &mut dyn Report) -> bool {
        tracing::info!(path, "preparing download");
        let node = match with_retry(&self.policy, path, || self.vfs.open(path)) {
            Ok(node) => node,
            Err(e) => {
                tracing::error!(path, error = %e, "could not resolve path");
                return false;
            }
        };
        match node.kind() {
            NodeKind::InternalLink(_) => self.download_link(path, &node, report),
            NodeKind::Regular(_) => self.download_regular(path, &node, report),
            NodeKind::Directory(_) => {
                if !self.download_directory(path, report) {
                    return false;
                }
                let children = match Node::list(&node) {
                    Ok(children) => children,
                    Err(e) => {
                        tracing::error!(path, error = %e, "could not list directory");
                        return false;
                    }
                };
                for (name, _) in children {
                    let child_path = join_vfs_path(path, &name);
                    if !self.run(&child_path, report) {
                        return false;
                    }
                }
                true
            }
            // External links carry a URL, not content; the listing
            // consumer dereferences them as text instead.
            NodeKind::ExternalLink(_) => {
                tracing::debug!(path, "skipping external link");
                true
            }
        }
    }

    fn disk_path(&self, vfs_path: &str) -> PathBuf {
        self.dest_root.join(sanitized_relative_path(vfs_path))
    }

    fn download_link(&self, path: &str, node: &NodeRef, report: &mut dyn Report) -> bool {
        let disk_path = self.disk_path(path);
        let Some(target) = node.link_target().map(str::to_string) else {
            return false;
        };

        if let Ok(existing) = fs::read_link(&disk_path)
            && existing == Path::new(&target)
        {
            tracing::info!(path = %disk_path.display(), "skipping existing symlink with identical target");
            return true;
        }

        let result = with_retry(&self.policy, path, || {
            report.progress(path, ProgressEvent::Begin);
            match symlink(&target, &disk_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if disk_path.is_symlink() {
                        // Same name, different target: replace it.
                        fs::remove_file(&disk_path)?;
                        symlink(&target, &disk_path)?;
                    } else {
                        return Err(Error::AlreadyExists(disk_path.display().to_string()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
            report.progress(path, ProgressEvent::End);
            report.finished(path);
            Ok(())
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(path, error = %e, "could not create symlink");
                false
            }
        }
    }

    fn download_regular(&self, path: &str, node: &NodeRef, report: &mut dyn Report) -> bool {
        // The shortened name survives across attempts.
        let mut disk_path = self.disk_path(path);
        let result = with_retry(&self.policy, path, || {
            self.regular_attempt(path, node, &mut disk_path, report)
        });
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(path, error = %e, "download failed");
                false
            }
        }
    }

    fn regular_attempt(
        &self,
        path: &str,
        node: &NodeRef,
        disk_path: &mut PathBuf,
        report: &mut dyn Report,
    ) -> Result<Outcome> {
        let mut exclusive = OpenOptions::new();
        exclusive.write(true).create_new(true);
        let mut file = match open_shortening(disk_path, &exclusive) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let existing_len = fs::metadata(&*disk_path)
                    .ok()
                    .filter(|metadata| metadata.is_file())
                    .map(|metadata| metadata.len());
                if let Some(len) = existing_len
                    && len == Node::size(node)?
                {
                    if node.is_local() {
                        // Cheap to re-derive: compare the actual bytes.
                        let disk_bytes = fs::read(&*disk_path)?;
                        let mut remote_bytes = Vec::new();
                        Node::read(node, &mut remote_bytes, &mut |_| {})?;
                        if disk_bytes == remote_bytes {
                            tracing::info!(
                                path = %disk_path.display(),
                                "skipping existing file with identical content"
                            );
                            return Ok(Outcome::Skipped);
                        }
                    } else {
                        // Size equality is the only affordable signal
                        // for streamed content.
                        tracing::info!(
                            path = %disk_path.display(),
                            "skipping existing file with matching size"
                        );
                        return Ok(Outcome::Skipped);
                    }
                }
                let mut truncate = OpenOptions::new();
                truncate.write(true).create(true).truncate(true);
                open_shortening(disk_path, &truncate)?
            }
            Err(e) => return Err(e.into()),
        };

        let mut forward = |event: ProgressEvent| report.progress(path, event);
        Node::read(node, &mut file, &mut forward)?;
        drop(file);
        report.finished(path);
        Ok(Outcome::Done)
    }

    fn download_directory(&self, path: &str, report: &mut dyn Report) -> bool {
        let disk_path = self.disk_path(path);
        if disk_path.as_os_str().is_empty() || disk_path.is_dir() {
            tracing::info!(path = %disk_path.display(), "skipping existing directory");
            return true;
        }
        let result = with_retry(&self.policy, path, || {
            report.progress(path, ProgressEvent::Begin);
            fs::create_dir_all(&disk_path)?;
            report.progress(path, ProgressEvent::End);
            report.finished(path);
            Ok(())
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(path, error = %e, "could not create directory");
                false
            }
        }
    }
}

/// Open a file, progressively shortening the name stem (preserving the
/// extension) while the host reports the name as too long. This loop is
/// bounded by the name length, not by the retry budget.
fn open_shortening(path: &mut PathBuf, options: &OpenOptions) -> io::Result<File> {
    loop {
        match options.open(&*path) {
            Ok(file) => return Ok(file),
            Err(e) if is_name_too_long(&e) => {
                let Some(shorter) = shorten_stem(path) else {
                    return Err(e);
                };
                tracing::info!(
                    path = %shorter.display(),
                    "file name too long, retrying with a shorter one"
                );
                *path = shorter;
            }
            Err(e) => return Err(e),
        }
    }
}

fn shorten_stem(path: &Path) -> Option<PathBuf> {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    if stem.is_empty() {
        return None;
    }
    let mut chars = stem.chars();
    chars.next_back();
    let shorter = chars.as_str();
    let file_name = match path.extension().and_then(|e| e.to_str()) {
        Some(extension) => format!("{shorter}.{extension}"),
        None => shorter.to_string(),
    };
    if file_name == "." || file_name.is_empty() {
        return None;
    }
    Some(path.with_file_name(file_name))
}

#[cfg(unix)]
fn is_name_too_long(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::ENAMETOOLONG)
}

#[cfg(windows)]
fn is_name_too_long(error: &io::Error) -> bool {
    // ERROR_FILENAME_EXCED_RANGE
    error.raw_os_error() == Some(206)
}

#[cfg(not(any(unix, windows)))]
fn is_name_too_long(_error: &io::Error) -> bool {
    false
}

/// Map a virtual path onto a relative filesystem path: empty, `.` and
/// `..` components are dropped, characters illegal on common
/// filesystems are stripped, and surrounding whitespace and trailing
/// dots are trimmed. A component that vanishes entirely becomes `_` so
/// the nesting depth is preserved.
pub(crate) fn sanitized_relative_path(vfs_path: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for component in vfs_path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            continue;
        }
        let cleaned: String = component
            .chars()
            .filter(|c| {
                !matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\') && !c.is_control()
            })
            .collect();
        let cleaned = cleaned.trim().trim_end_matches(|c| c == '.' || c == ' ');
        if cleaned.is_empty() {
            out.push("_");
        } else {
            out.push(cleaned);
        }
    }
    out
}
