//! Manifest trees: the caller's description of what goes into one container.

use anyhow::{bail, Context, Result};
use globset::GlobSet;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bucket::{Bucket, BucketRef, FileBucket};
use crate::metadata::Document;
use crate::path_safety::validate_component;

/// Content type assumed when a descriptor carries none.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Clone, Debug)]
pub enum ManifestNode {
    Directory(Directory),
    Data(DataItem),
    /// Descriptor produced out-of-band, taken as is.
    Prebuilt(Document),
}

impl ManifestNode {
    pub fn dir() -> Self {
        ManifestNode::Directory(Directory::new())
    }

    pub fn data(payload: BucketRef) -> Self {
        ManifestNode::Data(DataItem::embedded(payload))
    }

    pub fn redirect(target_uri: impl Into<String>) -> Self {
        ManifestNode::Data(DataItem::redirect(target_uri))
    }

    pub fn prebuilt(doc: Document) -> Self {
        ManifestNode::Prebuilt(doc)
    }
}

impl From<Directory> for ManifestNode {
    fn from(d: Directory) -> Self {
        ManifestNode::Directory(d)
    }
}

impl From<DataItem> for ManifestNode {
    fn from(d: DataItem) -> Self {
        ManifestNode::Data(d)
    }
}

/// Named children of one directory level.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    children: BTreeMap<String, ManifestNode>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child. Names must be valid single components and unique.
    pub fn insert(&mut self, name: impl Into<String>, node: impl Into<ManifestNode>) -> Result<()> {
        let name = name.into();
        validate_component(&name)?;
        if self.children.contains_key(&name) {
            bail!("duplicate manifest name {:?}", name);
        }
        self.children.insert(name, node.into());
        Ok(())
    }

    /// Builder form of [`Directory::insert`].
    pub fn with(mut self, name: impl Into<String>, node: impl Into<ManifestNode>) -> Result<Self> {
        self.insert(name, node)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ManifestNode> {
        self.children.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ManifestNode)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of embedded data items in the whole tree.
    pub fn embedded_count(&self) -> usize {
        self.children
            .values()
            .map(|n| match n {
                ManifestNode::Directory(d) => d.embedded_count(),
                ManifestNode::Data(d) if d.payload().is_some() => 1,
                _ => 0,
            })
            .sum()
    }

    fn subdir_mut(&mut self, name: &str) -> Result<&mut Directory> {
        validate_component(name)?;
        let node = self.children.entry(name.to_string()).or_insert_with(ManifestNode::dir);
        match node {
            ManifestNode::Directory(d) => Ok(d),
            _ => bail!("{:?} is both a file and a directory", name),
        }
    }
}

#[derive(Clone, Debug)]
enum DataSource {
    Payload(BucketRef),
    Redirect(String),
}

/// One file of a manifest: bytes to embed, or a redirect to content stored
/// elsewhere.
#[derive(Clone, Debug)]
pub struct DataItem {
    source: DataSource,
    mime_override: Option<String>,
}

impl DataItem {
    pub fn embedded(payload: BucketRef) -> Self {
        Self { source: DataSource::Payload(payload), mime_override: None }
    }

    pub fn redirect(target_uri: impl Into<String>) -> Self {
        Self { source: DataSource::Redirect(target_uri.into()), mime_override: None }
    }

    /// Build from optional parts. A target URI makes the item a redirect;
    /// having neither a payload nor a target is an error.
    pub fn from_parts(
        payload: Option<BucketRef>,
        target_uri: Option<String>,
        mime_override: Option<String>,
    ) -> Result<Self> {
        let source = match (target_uri, payload) {
            (Some(uri), _) => DataSource::Redirect(uri),
            (None, Some(p)) => DataSource::Payload(p),
            (None, None) => bail!("data item has neither a payload nor a target URI"),
        };
        Ok(Self { source, mime_override })
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime_override = Some(mime.into());
        self
    }

    pub fn payload(&self) -> Option<&BucketRef> {
        match &self.source {
            DataSource::Payload(p) => Some(p),
            DataSource::Redirect(_) => None,
        }
    }

    pub fn target_uri(&self) -> Option<&str> {
        match &self.source {
            DataSource::Redirect(u) => Some(u),
            DataSource::Payload(_) => None,
        }
    }

    pub fn mime_override(&self) -> Option<&str> {
        self.mime_override.as_deref()
    }
}

/// Best-effort content type from a file extension; `None` when unknown.
pub fn guess_mime(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "txt" => "text/plain",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "tar" => "application/x-tar",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(mime)
}

/// Include/exclude filter applied to `/`-separated relative paths.
pub struct DirFilter {
    pub include: GlobSet,
    pub exclude: GlobSet,
}

impl DirFilter {
    fn accepts(&self, rel: &str) -> bool {
        self.include.is_match(rel) && !self.exclude.is_match(rel)
    }
}

/// Build a manifest from the regular files under `root`.
pub fn from_dir(root: &Path, filter: Option<&DirFilter>) -> Result<Directory> {
    let mut top = Directory::new();
    for ent in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let ent = ent.with_context(|| format!("walk {:?}", root))?;
        if !ent.file_type().is_file() {
            continue;
        }
        let rel = pathdiff::diff_paths(ent.path(), root)
            .with_context(|| format!("relative path of {:?}", ent.path()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        if let Some(f) = filter {
            if !f.accepts(&rel) {
                continue;
            }
        }
        let (dirs, name) = match rel.rsplit_once('/') {
            Some((d, n)) => (Some(d), n),
            None => (None, rel.as_str()),
        };
        let mut cur = &mut top;
        if let Some(dirs) = dirs {
            for d in dirs.split('/') {
                cur = cur.subdir_mut(d)?;
            }
        }
        let bucket: BucketRef = Arc::new(FileBucket::open(ent.path())?);
        let mut item = DataItem::embedded(bucket);
        if let Some(mime) = guess_mime(name) {
            item = item.with_mime(mime);
        }
        cur.insert(name, item)?;
    }
    Ok(top)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonNode {
    File {
        file: PathBuf,
        #[serde(default)]
        mime: Option<String>,
    },
    Redirect {
        redirect: String,
        #[serde(default)]
        mime: Option<String>,
    },
    Dir(BTreeMap<String, JsonNode>),
}

/// Read a JSON manifest description. Objects are directories, `{"file": ..}`
/// embeds a file (relative to `base`), `{"redirect": ..}` points elsewhere;
/// both take an optional `"mime"`.
pub fn from_json(path: &Path, base: &Path) -> Result<Directory> {
    let f = File::open(path).with_context(|| format!("open {:?}", path))?;
    let top: BTreeMap<String, JsonNode> =
        serde_json::from_reader(f).with_context(|| format!("parse manifest {:?}", path))?;
    json_dir(top, base)
}

fn json_dir(entries: BTreeMap<String, JsonNode>, base: &Path) -> Result<Directory> {
    let mut dir = Directory::new();
    for (name, node) in entries {
        let node: ManifestNode = match node {
            JsonNode::Dir(children) => json_dir(children, base)?.into(),
            JsonNode::File { file, mime } => {
                let bucket: BucketRef = Arc::new(FileBucket::open(&base.join(&file))?);
                DataItem::from_parts(Some(bucket), None, mime)?.into()
            }
            JsonNode::Redirect { redirect, mime } => {
                DataItem::from_parts(None, Some(redirect), mime)?.into()
            }
        };
        dir.insert(name, node).with_context(|| format!("manifest entry in {:?}", base))?;
    }
    Ok(dir)
}

/// Total embedded payload size of a manifest.
pub fn payload_bytes(dir: &Directory) -> u64 {
    dir.iter()
        .map(|(_, n)| match n {
            ManifestNode::Directory(d) => payload_bytes(d),
            ManifestNode::Data(d) => d.payload().map(|p| p.size()).unwrap_or(0),
            ManifestNode::Prebuilt(_) => 0,
        })
        .sum()
}
