use crate::archive::ContainerEntry;
use crate::manifest::{DataItem, Directory, ManifestNode, DEFAULT_MIME_TYPE};
use crate::metadata::{MetadataArena, MetadataNode, NodeId};

/// Turns a manifest into a descriptor tree, collecting embedded payloads as
/// container entries along the way.
pub struct Composer<'a> {
    arena: &'a mut MetadataArena,
    entries: &'a mut Vec<ContainerEntry>,
}

impl<'a> Composer<'a> {
    pub fn new(arena: &'a mut MetadataArena, entries: &'a mut Vec<ContainerEntry>) -> Self {
        Self { arena, entries }
    }

    /// Compose `dir`, whose entries live under `prefix` inside the container
    /// (`""` for the top level, otherwise ending in `/`).
    pub fn compose_dir(&mut self, dir: &Directory, prefix: &str) -> NodeId {
        let children = dir
            .iter()
            .map(|(name, node)| (name.to_string(), self.compose_node(name, node, prefix)))
            .collect();
        self.arena.push_composite(children)
    }

    fn compose_node(&mut self, name: &str, node: &ManifestNode, prefix: &str) -> NodeId {
        match node {
            ManifestNode::Directory(d) => self.compose_dir(d, &format!("{prefix}{name}/")),
            ManifestNode::Prebuilt(doc) => self.arena.import(doc),
            ManifestNode::Data(item) => self.compose_item(name, item, prefix),
        }
    }

    fn compose_item(&mut self, name: &str, item: &DataItem, prefix: &str) -> NodeId {
        let content_type = explicit_content_type(item.mime_override());
        if let Some(uri) = item.target_uri() {
            return self
                .arena
                .push(MetadataNode::SimpleRedirect { address: uri.to_string(), content_type });
        }
        let path = format!("{prefix}{name}");
        if let Some(payload) = item.payload() {
            self.entries.push(ContainerEntry { payload: payload.clone(), name: path.clone() });
        }
        self.arena.push(MetadataNode::ArchiveInternalRedirect { path, content_type })
    }
}

/// Content type to record in a descriptor: nothing when the default applies.
pub fn explicit_content_type(mime: Option<&str>) -> Option<String> {
    match mime {
        None => None,
        Some(m) if m == DEFAULT_MIME_TYPE => None,
        Some(m) => Some(m.to_string()),
    }
}

/// Compose a whole manifest into `arena`, returning the root node.
pub fn compose(
    manifest: &Directory,
    arena: &mut MetadataArena,
    entries: &mut Vec<ContainerEntry>,
) -> NodeId {
    Composer::new(arena, entries).compose_dir(manifest, "")
}
