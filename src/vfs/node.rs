//! Node model for the virtual filesystem
//!
//! Every addressable element of the namespace is a [`Node`]: a regular
//! file, a directory, an internal link, or an external link. Nodes form
//! a tree through strong child references and weak parent references;
//! the root is its own parent. Population is lazy: a node starts
//! `Pending` and becomes `Ready` through exactly one `fetch`, triggered
//! by the first operation that needs unready data.
//!
//! The readiness flag is a one-way latch. Re-fetching a ready node, or
//! latching twice, is a programming error and fails loudly with
//! [`Error::InvalidOperation`] to catch accidental double-population.

use crate::datasource::{ProgressEvent, SourceRef};
use crate::error::{Error, Result};
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::{Rc, Weak};

/// Shared handle to a node in the tree
pub type NodeRef = Rc<Node>;

/// Hard bound on link-chase depth during resolution.
///
/// Internal links are re-resolved on every access rather than cached, so
/// a link chain that re-enters itself would otherwise recurse without
/// bound; exceeding this depth fails with [`Error::CycleDetected`].
pub(crate) const MAX_LINK_DEPTH: usize = 40;

/// Population state of a node: a one-way latch from `Pending` to `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The node's content or children have not been produced yet
    Pending,
    /// The node is fully populated; it can never go back
    Ready,
}

/// What `Directory::add` does when the sanitized name already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Raise [`Error::AlreadyExists`]
    Reject,
    /// Silently keep the original child
    Ignore,
}

/// One element of the virtual namespace
pub struct Node {
    parent: Weak<Node>,
    ready: Cell<Readiness>,
    kind: NodeKind,
}

/// The closed set of node kinds; the resolver and the downloader match
/// on this exhaustively, so adding a kind is a compile-checked decision.
pub enum NodeKind {
    /// A file with an opaque byte content
    Regular(Regular),
    /// An ordered collection of named children
    Directory(Directory),
    /// An alias resolved by re-running path resolution from its parent
    InternalLink(InternalLink),
    /// A literal URL; reading yields the URL text, not fetched content
    ExternalLink(ExternalLink),
}

/// Regular-file payload
pub struct Regular {
    content: Content,
}

/// Where a regular file's bytes come from
pub(crate) enum Content {
    /// Bytes synthesized locally, set exactly once by a builder
    Inline(RefCell<Option<Vec<u8>>>),
    /// Bytes streamed from the remote source on every read
    Remote {
        /// The session the bytes stream through
        source: SourceRef,
        /// Remote path of the file
        path: String,
        /// Query arguments of the file request
        args: Vec<(String, String)>,
        /// Session-priming requests issued (and discarded) before the
        /// real one; some platform downloads only work after their
        /// surrounding pages were visited
        prime: Vec<(String, Vec<(String, String)>)>,
    },
}

/// Directory payload: ordered children plus an optional lazy populator
pub struct Directory {
    children: RefCell<Vec<(String, NodeRef)>>,
    populate: RefCell<Option<Box<dyn Populate>>>,
}

/// Internal-link payload
pub struct InternalLink {
    target: String,
}

/// External-link payload
pub struct ExternalLink {
    url: String,
}

/// A lazy child-producer for a directory, consumed by the first `fetch`
pub(crate) trait Populate {
    /// Produce the directory's children, adding them to `dir`
    fn populate(&self, dir: &NodeRef) -> Result<()>;
}

impl Node {
    fn build(parent: Option<&NodeRef>, kind: NodeKind, ready: Readiness) -> NodeRef {
        match parent {
            Some(parent) => Rc::new(Node {
                parent: Rc::downgrade(parent),
                ready: Cell::new(ready),
                kind,
            }),
            // The root is its own parent.
            None => Rc::new_cyclic(|me| Node {
                parent: me.clone(),
                ready: Cell::new(ready),
                kind,
            }),
        }
    }

    /// Create the tree root: a pending directory that is its own parent
    pub(crate) fn new_root() -> NodeRef {
        Self::build(None, NodeKind::Directory(Directory::empty()), Readiness::Pending)
    }

    /// Create a pending directory without a remote data source; the
    /// caller fills it and latches it ready.
    pub fn new_plain_dir(parent: &NodeRef) -> NodeRef {
        Self::build(
            Some(parent),
            NodeKind::Directory(Directory::empty()),
            Readiness::Pending,
        )
    }

    /// Create a pending directory whose children are produced by
    /// `populate` on first access.
    pub(crate) fn new_lazy_dir(parent: &NodeRef, populate: Box<dyn Populate>) -> NodeRef {
        Self::build(
            Some(parent),
            NodeKind::Directory(Directory {
                children: RefCell::new(Vec::new()),
                populate: RefCell::new(Some(populate)),
            }),
            Readiness::Pending,
        )
    }

    /// Create a regular file node
    pub(crate) fn new_regular(parent: &NodeRef, content: Content, ready: Readiness) -> NodeRef {
        Self::build(
            Some(parent),
            NodeKind::Regular(Regular { content }),
            ready,
        )
    }

    /// Create an internal link to `target`, resolved relative to the
    /// link's parent directory on every access. Always ready.
    pub fn new_internal_link(parent: &NodeRef, target: impl Into<String>) -> NodeRef {
        Self::build(
            Some(parent),
            NodeKind::InternalLink(InternalLink {
                target: target.into(),
            }),
            Readiness::Ready,
        )
    }

    /// Create an external link holding a literal URL. Always ready.
    pub fn new_external_link(parent: &NodeRef, url: impl Into<String>) -> NodeRef {
        Self::build(
            Some(parent),
            NodeKind::ExternalLink(ExternalLink { url: url.into() }),
            Readiness::Ready,
        )
    }

    /// The node's kind, for exhaustive dispatch
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Whether this node is a directory
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    /// Whether this node is a regular file
    pub fn is_regular(&self) -> bool {
        matches!(self.kind, NodeKind::Regular(_))
    }

    /// Whether this node is an internal link
    pub fn is_internal_link(&self) -> bool {
        matches!(self.kind, NodeKind::InternalLink(_))
    }

    /// Whether this node is an external link
    pub fn is_external_link(&self) -> bool {
        matches!(self.kind, NodeKind::ExternalLink(_))
    }

    /// Whether the node's content is resident (cheaply re-derivable)
    /// rather than streamed from the remote source on every read
    pub fn is_local(&self) -> bool {
        match &self.kind {
            NodeKind::Regular(regular) => matches!(regular.content, Content::Inline(_)),
            _ => true,
        }
    }

    /// The stored link target: an internal path or an external URL
    pub fn link_target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::InternalLink(link) => Some(&link.target),
            NodeKind::ExternalLink(link) => Some(&link.url),
            _ => None,
        }
    }

    /// Whether the node has been populated
    pub fn ready(&self) -> bool {
        self.ready.get() == Readiness::Ready
    }

    /// Latch the node ready. The latch only moves once; latching a ready
    /// node is an invariant violation.
    pub fn mark_ready(&self) -> Result<()> {
        match self.ready.get() {
            Readiness::Pending => {
                self.ready.set(Readiness::Ready);
                Ok(())
            }
            Readiness::Ready => Err(Error::invalid_op(
                "node is already ready; the readiness latch only moves once",
            )),
        }
    }

    /// The owning parent; the root returns itself
    pub fn parent(&self) -> Result<NodeRef> {
        self.parent
            .upgrade()
            .ok_or_else(|| Error::invalid_op("node is detached from its tree"))
    }

    /// Whether this node is the tree root
    pub fn is_root(&self) -> bool {
        match self.parent.upgrade() {
            Some(parent) => std::ptr::eq(parent.as_ref(), self),
            None => false,
        }
    }

    /// Populate a pending node through its data source.
    ///
    /// Calling this on a ready node fails loudly: a node transitions to
    /// ready through exactly one fetch.
    pub fn fetch(node: &NodeRef) -> Result<()> {
        if node.ready() {
            return Err(Error::invalid_op(
                "node is already fetched; re-fetching a ready node is forbidden",
            ));
        }
        match &node.kind {
            NodeKind::Directory(dir) => {
                let Some(populate) = dir.populate.borrow_mut().take() else {
                    return Err(Error::invalid_op(
                        "directory has no data source to fetch from",
                    ));
                };
                match populate.populate(node) {
                    Ok(()) => node.mark_ready(),
                    Err(e) => {
                        // Leave the populator in place so a retried open
                        // can attempt the fetch again.
                        *dir.populate.borrow_mut() = Some(populate);
                        Err(e)
                    }
                }
            }
            _ => Err(Error::invalid_op("node kind cannot be fetched")),
        }
    }

    /// Fetch the node if it is still pending
    pub(crate) fn ensure_ready(node: &NodeRef) -> Result<()> {
        if node.ready() { Ok(()) } else { Self::fetch(node) }
    }

    /// Resolve one path component against this node.
    ///
    /// `.` is the node itself and `..` its parent, neither requiring a
    /// fetch; any other name forces the directory ready and scans its
    /// children in insertion order. Internal links re-resolve their
    /// target first.
    pub fn access(node: &NodeRef, name: &str) -> Result<NodeRef> {
        Self::access_at(node, name, 0)
    }

    pub(crate) fn access_at(node: &NodeRef, name: &str, depth: usize) -> Result<NodeRef> {
        match &node.kind {
            NodeKind::Directory(dir) => {
                if name == "." {
                    return Ok(node.clone());
                }
                if name == ".." {
                    return node.parent();
                }
                Self::ensure_ready(node)?;
                let children = dir.children.borrow();
                for (child_name, child) in children.iter() {
                    if child_name == name {
                        return Ok(child.clone());
                    }
                }
                Err(Error::not_found(name))
            }
            NodeKind::InternalLink(link) => {
                let target = Self::resolve_link(node, link, depth)?;
                Self::access_at(&target, name, depth + 1)
            }
            _ => Err(Error::invalid_op(format!("{name}: not a directory"))),
        }
    }

    /// The directory's ordered children, forcing it ready first
    pub fn list(node: &NodeRef) -> Result<Vec<(String, NodeRef)>> {
        let NodeKind::Directory(dir) = &node.kind else {
            return Err(Error::invalid_op("not a directory"));
        };
        Self::ensure_ready(node)?;
        Ok(dir.children.borrow().clone())
    }

    /// Register `child` under `name`.
    ///
    /// The child must have been created with this directory as its
    /// parent. The name is sanitized (path separators replaced,
    /// surrounding whitespace stripped) and must not be empty.
    pub fn add(&self, name: &str, child: NodeRef, policy: DuplicatePolicy) -> Result<()> {
        let NodeKind::Directory(dir) = &self.kind else {
            return Err(Error::invalid_op("not a directory"));
        };
        let parent = child.parent()?;
        if !std::ptr::eq(parent.as_ref(), self) {
            return Err(Error::invalid_op(
                "child was created under a different directory",
            ));
        }
        let name = sanitize_child_name(name);
        if name.is_empty() {
            return Err(Error::invalid_op("empty child name"));
        }
        let mut children = dir.children.borrow_mut();
        if children.iter().any(|(existing, _)| *existing == name) {
            return match policy {
                DuplicatePolicy::Ignore => Ok(()),
                DuplicatePolicy::Reject => Err(Error::AlreadyExists(name)),
            };
        }
        children.push((name, child));
        Ok(())
    }

    /// Remove the first child registered under `name`
    pub fn unlink(&self, name: &str) -> Result<()> {
        let NodeKind::Directory(dir) = &self.kind else {
            return Err(Error::invalid_op("not a directory"));
        };
        let mut children = dir.children.borrow_mut();
        match children.iter().position(|(existing, _)| existing == name) {
            Some(index) => {
                children.remove(index);
                Ok(())
            }
            None => Err(Error::not_found(name)),
        }
    }

    /// Stream the node's content into `sink`, forwarding progress.
    ///
    /// Internal links delegate to their re-resolved target; external
    /// links yield their URL text. Reading a directory is an error.
    pub fn read(
        node: &NodeRef,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<()> {
        Self::read_at(node, sink, progress, 0)
    }

    pub(crate) fn read_at(
        node: &NodeRef,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(ProgressEvent),
        depth: usize,
    ) -> Result<()> {
        match &node.kind {
            NodeKind::Regular(regular) => match &regular.content {
                Content::Inline(cell) => {
                    let bytes = cell.borrow();
                    let Some(bytes) = bytes.as_ref() else {
                        return Err(Error::invalid_op(
                            "file content has not been produced yet",
                        ));
                    };
                    progress(ProgressEvent::Begin);
                    sink.write_all(bytes)?;
                    progress(ProgressEvent::End);
                    Ok(())
                }
                Content::Remote {
                    source,
                    path,
                    args,
                    prime,
                } => {
                    for (prime_path, prime_args) in prime {
                        source.borrow_mut().fetch_file(
                            prime_path,
                            prime_args,
                            &mut std::io::sink(),
                            &mut |_| {},
                        )?;
                    }
                    source.borrow_mut().fetch_file(path, args, sink, progress)
                }
            },
            NodeKind::InternalLink(link) => {
                let target = Self::resolve_link(node, link, depth)?;
                Self::read_at(&target, sink, progress, depth + 1)
            }
            NodeKind::ExternalLink(link) => {
                progress(ProgressEvent::Begin);
                sink.write_all(link.url.as_bytes())?;
                sink.write_all(b"\n")?;
                progress(ProgressEvent::End);
                Ok(())
            }
            NodeKind::Directory(_) => Err(Error::invalid_op("is a directory")),
        }
    }

    /// The content size in bytes of a regular file.
    ///
    /// Remote files answer through a metadata-only probe after replaying
    /// their priming requests.
    pub fn size(node: &NodeRef) -> Result<u64> {
        match &node.kind {
            NodeKind::Regular(regular) => match &regular.content {
                Content::Inline(cell) => cell
                    .borrow()
                    .as_ref()
                    .map(|bytes| bytes.len() as u64)
                    .ok_or_else(|| {
                        Error::invalid_op("file content has not been produced yet")
                    }),
                Content::Remote {
                    source,
                    path,
                    args,
                    prime,
                } => {
                    for (prime_path, prime_args) in prime {
                        source.borrow_mut().fetch_file(
                            prime_path,
                            prime_args,
                            &mut std::io::sink(),
                            &mut |_| {},
                        )?;
                    }
                    source.borrow_mut().file_size(path, args)
                }
            },
            _ => Err(Error::invalid_op("size is only defined for regular files")),
        }
    }

    fn resolve_link(node: &NodeRef, link: &InternalLink, depth: usize) -> Result<NodeRef> {
        if depth >= MAX_LINK_DEPTH {
            return Err(Error::CycleDetected {
                path: link.target.clone(),
            });
        }
        let anchor = node.parent()?;
        resolve_at(&anchor, &link.target, depth + 1)
    }
}

impl Directory {
    fn empty() -> Self {
        Directory {
            children: RefCell::new(Vec::new()),
            populate: RefCell::new(None),
        }
    }
}

impl InternalLink {
    /// The stored target path
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl ExternalLink {
    /// The stored URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Resolve `path` starting from `cwd`; an absolute path restarts from
/// the tree root. Empty components are ignored. The final node is
/// forced ready before it is returned.
pub(crate) fn resolve_at(cwd: &NodeRef, path: &str, depth: usize) -> Result<NodeRef> {
    if depth >= MAX_LINK_DEPTH {
        return Err(Error::CycleDetected {
            path: path.to_string(),
        });
    }
    let mut work = if path.starts_with('/') {
        root_of(cwd)?
    } else {
        cwd.clone()
    };
    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }
        work = Node::access_at(&work, component, depth)?;
    }
    Node::ensure_ready(&work)?;
    Ok(work)
}

/// Climb parent references to the tree root (the node that is its own
/// parent).
pub(crate) fn root_of(node: &NodeRef) -> Result<NodeRef> {
    let mut current = node.clone();
    loop {
        let parent = current.parent()?;
        if Rc::ptr_eq(&parent, &current) {
            return Ok(current);
        }
        current = parent;
    }
}

/// Install builder-produced bytes into an inline regular file and latch
/// it ready. Setting content twice, or on a non-inline node, violates
/// the append-only builder contract.
pub(crate) fn set_inline_content(node: &NodeRef, bytes: Vec<u8>) -> Result<()> {
    let NodeKind::Regular(regular) = &node.kind else {
        return Err(Error::invalid_op("not a regular file"));
    };
    let Content::Inline(cell) = &regular.content else {
        return Err(Error::invalid_op("remote file content cannot be assigned"));
    };
    {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            return Err(Error::invalid_op("file content was already produced"));
        }
        *slot = Some(bytes);
    }
    node.mark_ready()
}

fn sanitize_child_name(name: &str) -> String {
    name.replace('/', "_").trim().to_string()
}
