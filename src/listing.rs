//! Human-facing `ls`-style listing of the virtual filesystem

use crate::error::Result;
use crate::vfs::node::{Node, NodeKind, NodeRef};
use crate::vfs::{join_vfs_path, Vfs};
use std::io::Write;

/// Prints virtual paths, optionally with kind details and recursion
pub struct Lister<'a> {
    vfs: &'a Vfs,
    long: bool,
    recursive: bool,
}

impl<'a> Lister<'a> {
    /// A lister over `vfs`; `long` adds kind and link targets,
    /// `recursive` descends into subdirectories.
    pub fn new(vfs: &'a Vfs, long: bool, recursive: bool) -> Self {
        Lister {
            vfs,
            long,
            recursive,
        }
    }

    /// List one path into `out`
    pub fn run(&self, out: &mut dyn Write, path: &str) -> Result<()> {
        let node = self.vfs.open(path)?;
        self.print_node(out, path, &node, self.recursive)
    }

    fn print_node(
        &self,
        out: &mut dyn Write,
        path: &str,
        node: &NodeRef,
        recurse: bool,
    ) -> Result<()> {
        match node.kind() {
            NodeKind::InternalLink(link) => self.print_entry(out, "link", path, Some(link.target())),
            NodeKind::ExternalLink(link) => self.print_entry(out, "url", path, Some(link.url())),
            NodeKind::Regular(_) => self.print_entry(out, "file", path, None),
            NodeKind::Directory(_) => {
                self.print_entry(out, "dir", path, None)?;
                for (name, child) in Node::list(node)? {
                    let child_path = join_vfs_path(path, &name);
                    // Without recursion, subdirectories are named but
                    // not entered (and never fetched).
                    if !recurse && child.is_directory() {
                        self.print_entry(out, "dir", &child_path, None)?;
                    } else {
                        self.print_node(out, &child_path, &child, recurse)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn print_entry(
        &self,
        out: &mut dyn Write,
        kind: &str,
        path: &str,
        target: Option<&str>,
    ) -> Result<()> {
        if self.long {
            match target {
                Some(target) => writeln!(out, "{kind:<4} {path} -> {target}")?,
                None => writeln!(out, "{kind:<4} {path}")?,
            }
        } else {
            writeln!(out, "{path}")?;
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EditPlan, Labels};
    use crate::test_support::{as_source, FakeDataSource};
    use crate::vfs::files;
    use crate::vfs::node::DuplicatePolicy;

    fn sample_vfs() -> Vfs {
        let source = FakeDataSource::new().into_source();
        let vfs = Vfs::new(as_source(&source), Labels::default(), EditPlan::default()).unwrap();
        let root = vfs.root();
        let dir = Node::new_plain_dir(&root);
        root.add("notes", dir.clone(), DuplicatePolicy::Reject)
            .unwrap();
        dir.add(
            "week1.txt",
            files::string_file(&dir, "hello"),
            DuplicatePolicy::Reject,
        )
        .unwrap();
        let sub = Node::new_plain_dir(&dir);
        sub.mark_ready().unwrap();
        dir.add("deep", sub, DuplicatePolicy::Reject).unwrap();
        dir.add(
            "latest",
            Node::new_internal_link(&dir, "week1.txt"),
            DuplicatePolicy::Reject,
        )
        .unwrap();
        dir.add(
            "site",
            Node::new_external_link(&dir, "https://example.edu"),
            DuplicatePolicy::Reject,
        )
        .unwrap();
        dir.mark_ready().unwrap();
        vfs
    }

    #[test]
    fn plain_listing_prints_paths_only() {
        let vfs = sample_vfs();
        let mut out = Vec::new();
        Lister::new(&vfs, false, false)
            .run(&mut out, "/notes")
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "/notes\n/notes/week1.txt\n/notes/deep\n/notes/latest\n/notes/site\n"
        );
    }

    #[test]
    fn long_listing_shows_kinds_and_targets() {
        let vfs = sample_vfs();
        let mut out = Vec::new();
        Lister::new(&vfs, true, true)
            .run(&mut out, "/notes")
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("dir  /notes\n"));
        assert!(text.contains("file /notes/week1.txt\n"));
        assert!(text.contains("link /notes/latest -> week1.txt\n"));
        assert!(text.contains("url  /notes/site -> https://example.edu\n"));
    }
}
