//! Metadata descriptors: the serializable tree telling a reader how to find
//! and interpret each named item of a site.
//!
//! Nodes live in a [`MetadataArena`] and refer to each other by [`NodeId`], so
//! the resolver can rewrite a sub-tree into a redirect with a plain indexed
//! update. [`Document`] is the owned form of the same tree, used for
//! pre-built fragments and for decoding.
//!
//! Wire format (big-endian):
//!
//! ```text
//! document := "SPMD" | version u16 | node
//! node     := tag u8 | flags u8 | [content_type str16 if flags & 1] | body
//! tag 0  simple redirect           body := address str16
//! tag 1  archive-internal redirect body := path str16
//! tag 2  composite                 body := count u32 | count x (name str16 | len u16 | node)
//! str16    := len u16 | utf-8 bytes
//! ```

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAGIC: &[u8; 4] = b"SPMD";
const VERSION: u16 = 1;

const TAG_SIMPLE_REDIRECT: u8 = 0;
const TAG_ARCHIVE_INTERNAL_REDIRECT: u8 = 1;
const TAG_COMPOSITE: u8 = 2;

const FLAG_CONTENT_TYPE: u8 = 1;

/// Largest child descriptor a composite can embed inline.
pub const MAX_INLINE_LIMIT: usize = u16::MAX as usize;

/// Index of a node inside a [`MetadataArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataNode {
    /// Content reachable outside the container.
    SimpleRedirect { address: String, content_type: Option<String> },
    /// A named entry of the same container.
    ArchiveInternalRedirect { path: String, content_type: Option<String> },
    /// Directory-equivalent; children sorted by name.
    Composite { children: Vec<(String, NodeId)> },
}

/// Owned descriptor tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    SimpleRedirect {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    ArchiveInternalRedirect {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    Composite {
        children: BTreeMap<String, Document>,
    },
}

impl Document {
    /// Walk `/`-separated `path` through nested composites.
    pub fn lookup(&self, path: &str) -> Option<&Document> {
        let mut cur = self;
        for part in path.split('/') {
            match cur {
                Document::Composite { children } => cur = children.get(part)?,
                _ => return None,
            }
        }
        Some(cur)
    }
}

/// Encoding limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeLimits {
    max_inline_bytes: usize,
}

impl EncodeLimits {
    /// `max_inline_bytes` is clamped to [`MAX_INLINE_LIMIT`].
    pub fn new(max_inline_bytes: usize) -> Self {
        Self { max_inline_bytes: max_inline_bytes.min(MAX_INLINE_LIMIT) }
    }

    pub fn max_inline_bytes(&self) -> usize {
        self.max_inline_bytes
    }
}

impl Default for EncodeLimits {
    fn default() -> Self {
        Self::new(i16::MAX as usize)
    }
}

/// Outcome of an encode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Encoded {
    Bytes(Vec<u8>),
    /// Sub-nodes too large to inline; they must be split out and replaced by
    /// redirects before the document can be written. Deepest nodes first.
    Unresolved(Vec<NodeId>),
}

#[derive(Clone, Debug, Default)]
pub struct MetadataArena {
    nodes: Vec<MetadataNode>,
}

impl MetadataArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push(&mut self, node: MetadataNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Add a composite, ordering its children by name.
    pub fn push_composite(&mut self, mut children: Vec<(String, NodeId)>) -> NodeId {
        children.sort_by(|a, b| a.0.cmp(&b.0));
        self.push(MetadataNode::Composite { children })
    }

    pub fn get(&self, id: NodeId) -> &MetadataNode {
        &self.nodes[id.0]
    }

    /// Replace the node at `id`, returning the previous one. Sub-nodes the old
    /// node referred to stay in the arena but become unreachable from `id`.
    pub fn patch(&mut self, id: NodeId, node: MetadataNode) -> MetadataNode {
        std::mem::replace(&mut self.nodes[id.0], node)
    }

    /// Copy an owned tree into the arena.
    pub fn import(&mut self, doc: &Document) -> NodeId {
        match doc {
            Document::SimpleRedirect { address, content_type } => {
                self.push(MetadataNode::SimpleRedirect {
                    address: address.clone(),
                    content_type: content_type.clone(),
                })
            }
            Document::ArchiveInternalRedirect { path, content_type } => {
                self.push(MetadataNode::ArchiveInternalRedirect {
                    path: path.clone(),
                    content_type: content_type.clone(),
                })
            }
            Document::Composite { children } => {
                let ids = children.iter().map(|(name, d)| (name.clone(), self.import(d))).collect();
                self.push_composite(ids)
            }
        }
    }

    /// Owned copy of the tree rooted at `id`.
    pub fn export(&self, id: NodeId) -> Document {
        match self.get(id) {
            MetadataNode::SimpleRedirect { address, content_type } => Document::SimpleRedirect {
                address: address.clone(),
                content_type: content_type.clone(),
            },
            MetadataNode::ArchiveInternalRedirect { path, content_type } => {
                Document::ArchiveInternalRedirect {
                    path: path.clone(),
                    content_type: content_type.clone(),
                }
            }
            MetadataNode::Composite { children } => Document::Composite {
                children: children.iter().map(|(n, c)| (n.clone(), self.export(*c))).collect(),
            },
        }
    }

    /// Encode the tree rooted at `id` as a standalone document.
    ///
    /// `Err` is reserved for failures no amount of splitting can fix, such as
    /// a string longer than a length prefix can express.
    pub fn encode(&self, id: NodeId, limits: &EncodeLimits) -> Result<Encoded> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_be_bytes());
        let mut unresolved = Vec::new();
        self.encode_node(id, limits, &mut out, &mut unresolved)?;
        if unresolved.is_empty() {
            Ok(Encoded::Bytes(out))
        } else {
            Ok(Encoded::Unresolved(unresolved))
        }
    }

    fn encode_node(
        &self,
        id: NodeId,
        limits: &EncodeLimits,
        out: &mut Vec<u8>,
        unresolved: &mut Vec<NodeId>,
    ) -> Result<()> {
        match self.get(id) {
            MetadataNode::SimpleRedirect { address, content_type } => {
                write_head(out, TAG_SIMPLE_REDIRECT, content_type.as_deref())?;
                write_str(out, address, "redirect address")?;
            }
            MetadataNode::ArchiveInternalRedirect { path, content_type } => {
                write_head(out, TAG_ARCHIVE_INTERNAL_REDIRECT, content_type.as_deref())?;
                write_str(out, path, "archive path")?;
            }
            MetadataNode::Composite { children } => {
                write_head(out, TAG_COMPOSITE, None)?;
                let count = u32::try_from(children.len()).context("too many children")?;
                out.extend_from_slice(&count.to_be_bytes());
                for (name, child) in children {
                    let mut buf = Vec::new();
                    let mut nested = Vec::new();
                    self.encode_node(*child, limits, &mut buf, &mut nested)?;
                    if !nested.is_empty() {
                        unresolved.extend(nested);
                        continue;
                    }
                    if buf.len() > limits.max_inline_bytes {
                        unresolved.push(*child);
                        continue;
                    }
                    write_str(out, name, "entry name")?;
                    out.extend_from_slice(&(buf.len() as u16).to_be_bytes());
                    out.extend_from_slice(&buf);
                }
            }
        }
        Ok(())
    }
}

fn write_head(out: &mut Vec<u8>, tag: u8, content_type: Option<&str>) -> Result<()> {
    out.push(tag);
    match content_type {
        Some(ct) => {
            out.push(FLAG_CONTENT_TYPE);
            write_str(out, ct, "content type")
        }
        None => {
            out.push(0);
            Ok(())
        }
    }
}

fn write_str(out: &mut Vec<u8>, s: &str, what: &str) -> Result<()> {
    let Ok(len) = u16::try_from(s.len()) else {
        bail!("{} is {} bytes, longer than a descriptor field allows", what, s.len());
    };
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Parse a serialized document.
pub fn decode(bytes: &[u8]) -> Result<Document> {
    let mut r = Reader { buf: bytes, pos: 0 };
    ensure!(r.take(4)? == MAGIC, "bad metadata magic");
    let version = r.u16()?;
    if version != VERSION {
        bail!("unsupported metadata version {}", version);
    }
    let doc = r.node()?;
    ensure!(r.pos == bytes.len(), "{} trailing bytes after metadata", bytes.len() - r.pos);
    Ok(doc)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let Some(end) = end else {
            bail!("truncated metadata at offset {}", self.pos);
        };
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        Ok(std::str::from_utf8(raw).context("metadata string is not UTF-8")?.to_string())
    }

    fn node(&mut self) -> Result<Document> {
        let tag = self.u8()?;
        let flags = self.u8()?;
        if flags & !FLAG_CONTENT_TYPE != 0 {
            bail!("unknown metadata flags {:#04x}", flags);
        }
        let content_type = if flags & FLAG_CONTENT_TYPE != 0 { Some(self.string()?) } else { None };
        match tag {
            TAG_SIMPLE_REDIRECT => Ok(Document::SimpleRedirect { address: self.string()?, content_type }),
            TAG_ARCHIVE_INTERNAL_REDIRECT => {
                Ok(Document::ArchiveInternalRedirect { path: self.string()?, content_type })
            }
            TAG_COMPOSITE => {
                ensure!(content_type.is_none(), "composite nodes carry no content type");
                let count = self.u32()?;
                let mut children = BTreeMap::new();
                for _ in 0..count {
                    let name = self.string()?;
                    let len = self.u16()? as usize;
                    let mut sub = Reader { buf: self.take(len)?, pos: 0 };
                    let child = sub.node()?;
                    ensure!(sub.pos == len, "child {:?} has trailing bytes", name);
                    if children.insert(name.clone(), child).is_some() {
                        bail!("duplicate child {:?}", name);
                    }
                }
                Ok(Document::Composite { children })
            }
            other => bail!("unknown metadata tag {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(arena: &mut MetadataArena, path: &str) -> NodeId {
        arena.push(MetadataNode::ArchiveInternalRedirect { path: path.into(), content_type: None })
    }

    #[test]
    fn encode_then_decode_preserves_tree() {
        let mut a = MetadataArena::new();
        let x = leaf(&mut a, "sub/x.txt");
        let r = a.push(MetadataNode::SimpleRedirect {
            address: "addr://X".into(),
            content_type: Some("text/html".into()),
        });
        let sub = a.push_composite(vec![("x.txt".into(), x)]);
        let root = a.push_composite(vec![("z".into(), r), ("sub".into(), sub)]);

        let Encoded::Bytes(bytes) = a.encode(root, &EncodeLimits::default()).unwrap() else {
            panic!("expected bytes");
        };
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(decode(&bytes).unwrap(), a.export(root));
    }

    #[test]
    fn composite_children_are_sorted() {
        let mut a = MetadataArena::new();
        let b = leaf(&mut a, "b");
        let c = leaf(&mut a, "a");
        let root = a.push_composite(vec![("b".into(), b), ("a".into(), c)]);
        let MetadataNode::Composite { children } = a.get(root) else { panic!() };
        let names: Vec<_> = children.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn oversized_children_are_reported_deepest_first() {
        let mut a = MetadataArena::new();
        let big = a.push(MetadataNode::SimpleRedirect { address: "x".repeat(100), content_type: None });
        let inner = a.push_composite(vec![("big".into(), big)]);
        let big2 = a.push(MetadataNode::SimpleRedirect { address: "y".repeat(100), content_type: None });
        let root = a.push_composite(vec![("a".into(), inner), ("b".into(), big2)]);
        let got = a.encode(root, &EncodeLimits::new(64)).unwrap();
        assert_eq!(got, Encoded::Unresolved(vec![big, big2]));
    }

    #[test]
    fn patched_node_makes_document_encodable() {
        let mut a = MetadataArena::new();
        let big = a.push(MetadataNode::SimpleRedirect { address: "x".repeat(100), content_type: None });
        let root = a.push_composite(vec![("big".into(), big)]);
        let limits = EncodeLimits::new(64);
        assert!(matches!(a.encode(root, &limits).unwrap(), Encoded::Unresolved(_)));
        a.patch(big, MetadataNode::ArchiveInternalRedirect { path: ".metadata-0".into(), content_type: None });
        assert!(matches!(a.encode(root, &limits).unwrap(), Encoded::Bytes(_)));
    }

    #[test]
    fn overlong_string_is_a_hard_error() {
        let mut a = MetadataArena::new();
        let root = a.push(MetadataNode::SimpleRedirect {
            address: "x".repeat(u16::MAX as usize + 1),
            content_type: None,
        });
        let err = a.encode(root, &EncodeLimits::default()).unwrap_err();
        assert!(err.to_string().contains("longer than a descriptor field allows"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"").is_err());
        assert!(decode(b"NOPE\0\x01").is_err());
        assert!(decode(b"SPMD\0\x02\x00\x00\x00\x00").is_err());
        assert!(decode(b"SPMD\0\x01\x09\x00").is_err());
        // Truncated composite.
        assert!(decode(b"SPMD\0\x01\x02\x00\x00\x00\x00\x01").is_err());
    }

    #[test]
    fn lookup_walks_composites() {
        let mut a = MetadataArena::new();
        let x = leaf(&mut a, "sub/x.txt");
        let sub = a.push_composite(vec![("x.txt".into(), x)]);
        let root = a.push_composite(vec![("sub".into(), sub)]);
        let doc = a.export(root);
        assert_eq!(
            doc.lookup("sub/x.txt"),
            Some(&Document::ArchiveInternalRedirect { path: "sub/x.txt".into(), content_type: None })
        );
        assert!(doc.lookup("sub/missing").is_none());
        assert!(doc.lookup("sub/x.txt/deeper").is_none());
    }
}
