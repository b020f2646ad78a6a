//! Leaf content builders and regular-file constructors
//!
//! Higher layers publish computed data as regular files through two
//! generic builders: [`RecordFile`] (an ordered key→value document with
//! per-key provenance) and [`TableFile`] (a delimited table). Both are
//! append-only until `finish()`, which serializes the accumulated data,
//! freezes the node, and latches it ready; consuming the builder makes
//! the file read-only by construction.
//!
//! Literal and remote files ([`string_file`], [`bytes_file`],
//! [`remote_file`], [`primed_remote_file`]) are ready at creation.

use crate::datasource::SourceRef;
use crate::error::{Error, Result};
use crate::vfs::node::{set_inline_content, Content, Node, NodeRef, Readiness};
use serde_json::{Map, Value};
use std::cell::RefCell;

/// Marker element prepended when a multi-line string is flattened to a
/// list, so consumers can tell structured multi-line text from a plain
/// string without re-parsing.
pub const MULTI_LINE_MARKER: &str = "(multi-line string)";

/// Flatten a string value containing line breaks into
/// `[marker, line, line, ...]`; every other value passes through.
pub fn fold_multiline(value: Value) -> Value {
    match value {
        Value::String(text) if text.contains('\n') => {
            let mut items = vec![Value::String(MULTI_LINE_MARKER.to_string())];
            items.extend(
                text.replace('\r', "")
                    .split('\n')
                    .map(|line| Value::String(line.to_string())),
            );
            Value::Array(items)
        }
        other => other,
    }
}

/// Builder for a structured-record file
///
/// Accumulates an ordered mapping of human-readable key → value plus a
/// parallel mapping of key → provenance (where the value came from).
/// `finish()` serializes both as a two-element JSON document
/// `[values, provenance]`.
pub struct RecordFile {
    node: NodeRef,
    values: Map<String, Value>,
    provenance: Map<String, Value>,
}

impl RecordFile {
    /// Start an empty record file under `parent`; the node can be added
    /// to the tree right away and stays pending until `finish()`.
    pub fn new(parent: &NodeRef) -> Self {
        let node = Node::new_regular(
            parent,
            Content::Inline(RefCell::new(None)),
            Readiness::Pending,
        );
        RecordFile {
            node,
            values: Map::new(),
            provenance: Map::new(),
        }
    }

    /// The underlying node, for registering in a directory
    pub fn node(&self) -> NodeRef {
        self.node.clone()
    }

    /// Record `key` with its value and provenance tag. Keys are
    /// append-only; recording one twice is an invariant violation.
    pub fn add(
        &mut self,
        key: &str,
        value: impl Into<Value>,
        origin: impl Into<Value>,
    ) -> Result<()> {
        if self.values.contains_key(key) {
            return Err(Error::invalid_op(format!(
                "record key {key} is already present"
            )));
        }
        self.values
            .insert(key.to_string(), fold_multiline(value.into()));
        self.provenance.insert(key.to_string(), origin.into());
        Ok(())
    }

    /// Extend the list value previously recorded under `key`
    pub fn append(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        match self.values.get_mut(key) {
            Some(Value::Array(items)) => {
                items.push(fold_multiline(value.into()));
                Ok(())
            }
            Some(_) => Err(Error::invalid_op(format!(
                "record key {key} does not hold a list"
            ))),
            None => Err(Error::invalid_op(format!("record key {key} is not present"))),
        }
    }

    /// Look up a previously recorded value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Serialize the record and freeze the node to ready
    pub fn finish(self) -> Result<NodeRef> {
        let document = Value::Array(vec![
            Value::Object(self.values),
            Value::Object(self.provenance),
        ]);
        let mut text = serde_json::to_string_pretty(&document)?;
        text.push('\n');
        set_inline_content(&self.node, text.into_bytes())?;
        Ok(self.node)
    }
}

/// Builder for a delimited-table file
///
/// Rows of flat string values, serialized on `finish()` as CSV with
/// every field quoted and `\n` record terminators.
pub struct TableFile {
    node: NodeRef,
    rows: Vec<Vec<String>>,
}

impl TableFile {
    /// Start an empty table file under `parent`
    pub fn new(parent: &NodeRef) -> Self {
        let node = Node::new_regular(
            parent,
            Content::Inline(RefCell::new(None)),
            Readiness::Pending,
        );
        TableFile {
            node,
            rows: Vec::new(),
        }
    }

    /// The underlying node, for registering in a directory
    pub fn node(&self) -> NodeRef {
        self.node.clone()
    }

    /// Append one row
    pub fn add<I, S>(&mut self, row: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(row.into_iter().map(Into::into).collect());
    }

    /// Serialize the table and freeze the node to ready
    pub fn finish(self) -> Result<NodeRef> {
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        for row in &self.rows {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| Error::invalid_op(format!("table buffer flush failed: {e}")))?;
        set_inline_content(&self.node, bytes)?;
        Ok(self.node)
    }
}

/// A regular file holding a literal string, ready at creation
pub fn string_file(parent: &NodeRef, text: impl Into<String>) -> NodeRef {
    bytes_file(parent, text.into().into_bytes())
}

/// A regular file holding literal bytes, ready at creation
pub fn bytes_file(parent: &NodeRef, bytes: Vec<u8>) -> NodeRef {
    Node::new_regular(
        parent,
        Content::Inline(RefCell::new(Some(bytes))),
        Readiness::Ready,
    )
}

/// A regular file streamed from the remote source on every read
pub fn remote_file(
    parent: &NodeRef,
    source: &SourceRef,
    path: impl Into<String>,
    args: Vec<(String, String)>,
) -> NodeRef {
    primed_remote_file(parent, source, path, args, Vec::new())
}

/// A remote file that must replay `prime` requests before each read,
/// because the platform only serves it after its surrounding pages were
/// visited in the same session.
pub fn primed_remote_file(
    parent: &NodeRef,
    source: &SourceRef,
    path: impl Into<String>,
    args: Vec<(String, String)>,
    prime: Vec<(String, Vec<(String, String)>)>,
) -> NodeRef {
    Node::new_regular(
        parent,
        Content::Remote {
            source: source.clone(),
            path: path.into(),
            args,
            prime,
        },
        Readiness::Ready,
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::node::DuplicatePolicy;
    use serde_json::json;

    fn ready_root() -> NodeRef {
        let root = Node::new_root();
        root.mark_ready().unwrap();
        root
    }

    fn read_to_string(node: &NodeRef) -> String {
        let mut out = Vec::new();
        Node::read(node, &mut out, &mut |_| {}).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn record_file_serializes_values_and_provenance() {
        let root = ready_root();
        let mut record = RecordFile::new(&root);
        record.add("name", "Algorithms", "crs_cname").unwrap();
        record.add("weight", 30, "percent").unwrap();
        record
            .add("sources", json!(["pub_date", "pub_hour"]), json!(["a", "b"]))
            .unwrap();
        let node = record.finish().unwrap();

        let text = read_to_string(&node);
        assert!(text.ends_with('\n'));
        let parsed: Value = serde_json::from_str(&text).unwrap();
        let doc = parsed.as_array().unwrap();
        assert_eq!(doc.len(), 2, "two-element document: values, provenance");
        assert_eq!(doc[0]["name"], "Algorithms");
        assert_eq!(doc[0]["weight"], 30);
        assert_eq!(doc[1]["name"], "crs_cname");
        assert_eq!(doc[1]["sources"], json!(["a", "b"]));

        // Key order survives serialization.
        let keys: Vec<&String> = doc[0].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["name", "weight", "sources"]);
    }

    #[test]
    fn multi_line_strings_become_marked_lists() {
        let root = ready_root();
        let mut record = RecordFile::new(&root);
        record
            .add("notes", "first line\r\nsecond line", "notes")
            .unwrap();
        let node = record.finish().unwrap();

        let parsed: Value = serde_json::from_str(&read_to_string(&node)).unwrap();
        assert_eq!(
            parsed[0]["notes"],
            json!([MULTI_LINE_MARKER, "first line", "second line"])
        );
    }

    #[test]
    fn single_line_strings_stay_plain() {
        assert_eq!(fold_multiline(json!("no breaks")), json!("no breaks"));
        assert_eq!(fold_multiline(json!(42)), json!(42));
    }

    #[test]
    fn record_keys_are_append_only() {
        let root = ready_root();
        let mut record = RecordFile::new(&root);
        record.add("name", "a", "x").unwrap();
        assert!(matches!(
            record.add("name", "b", "y"),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn append_extends_list_values_only() {
        let root = ready_root();
        let mut record = RecordFile::new(&root);
        record.add("files", json!([]), "file_name").unwrap();
        record.append("files", "slides.pdf").unwrap();
        record.append("files", "notes.pdf").unwrap();
        assert!(matches!(
            record.append("missing", "x"),
            Err(Error::InvalidOperation(_))
        ));

        let node = record.finish().unwrap();
        let parsed: Value = serde_json::from_str(&read_to_string(&node)).unwrap();
        assert_eq!(parsed[0]["files"], json!(["slides.pdf", "notes.pdf"]));
    }

    #[test]
    fn reading_before_finish_is_an_error() {
        let root = ready_root();
        let record = RecordFile::new(&root);
        let node = record.node();
        root.add("meta.json", node.clone(), DuplicatePolicy::Reject)
            .unwrap();

        let mut out = Vec::new();
        assert!(matches!(
            Node::read(&node, &mut out, &mut |_| {}),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn table_file_quotes_every_field_and_uses_lf() {
        let root = ready_root();
        let mut table = TableFile::new(&root);
        table.add(["id", "grade", "comment"]);
        table.add(["b01234567", "85", "solid \"work\", overall"]);
        let node = table.finish().unwrap();

        let text = read_to_string(&node);
        assert_eq!(
            text,
            "\"id\",\"grade\",\"comment\"\n\"b01234567\",\"85\",\"solid \"\"work\"\", overall\"\n"
        );
    }

    #[test]
    fn string_file_is_ready_and_local() {
        let root = ready_root();
        let node = string_file(&root, "hello");
        assert!(node.ready());
        assert!(node.is_local());
        assert_eq!(Node::size(&node).unwrap(), 5);
    }
}
