//! Splits descriptor sub-trees that are too large to inline into auxiliary
//! `.metadata-N` container entries until the root document encodes.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use tracing::{debug, trace};

use crate::archive::ContainerEntry;
use crate::bucket::{make_immutable_bucket, BucketFactory};
use crate::metadata::{EncodeLimits, Encoded, MetadataArena, MetadataNode, NodeId};

/// Entry name of the root descriptor.
pub const ROOT_METADATA_NAME: &str = ".metadata";

/// Entry name of the `index`-th auxiliary descriptor.
pub fn aux_metadata_name(index: usize) -> String {
    format!("{ROOT_METADATA_NAME}-{index}")
}

/// True for names the resolver writes at the top level of a container:
/// `.metadata` and `.metadata-<digits>`.
pub fn is_reserved_name(name: &str) -> bool {
    match name.strip_prefix(ROOT_METADATA_NAME) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('-')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveReport {
    /// Auxiliary descriptors written.
    pub aux_entries: usize,
    /// Top-level encode attempts, including the successful one.
    pub attempts: usize,
}

pub struct Resolver<'a> {
    arena: &'a mut MetadataArena,
    limits: EncodeLimits,
    buckets: &'a dyn BucketFactory,
    entries: &'a mut Vec<ContainerEntry>,
    next_index: usize,
    resolved: HashSet<NodeId>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        arena: &'a mut MetadataArena,
        limits: EncodeLimits,
        buckets: &'a dyn BucketFactory,
        entries: &'a mut Vec<ContainerEntry>,
    ) -> Self {
        Self { arena, limits, buckets, entries, next_index: 0, resolved: HashSet::new() }
    }

    /// Encode `root`, splitting out sub-trees until it succeeds, then append
    /// the root descriptor as `.metadata`.
    pub fn run(mut self, root: NodeId) -> Result<ResolveReport> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.arena.encode(root, &self.limits).context("encode root metadata")? {
                Encoded::Bytes(bytes) => {
                    trace!(len = bytes.len(), attempts, "root metadata encoded");
                    self.push_entry(ROOT_METADATA_NAME.to_string(), &bytes)?;
                    return Ok(ResolveReport { aux_entries: self.next_index, attempts });
                }
                Encoded::Unresolved(nodes) => {
                    debug!(count = nodes.len(), attempt = attempts, "metadata unresolved");
                    if self.resolve_nodes(&nodes)? == 0 {
                        bail!("metadata resolution made no progress ({} nodes pending)", nodes.len());
                    }
                }
            }
        }
    }

    fn resolve_nodes(&mut self, nodes: &[NodeId]) -> Result<usize> {
        let mut patched = 0;
        for &id in nodes {
            // A patched redirect reported again is itself too large to inline.
            if self.resolved.contains(&id) {
                continue;
            }
            // Reported nodes carry no unresolved descendants, so they encode
            // on their own.
            let Encoded::Bytes(bytes) = self.arena.encode(id, &self.limits).context("encode metadata fragment")?
            else {
                bail!("metadata fragment {} did not encode on its own", id.index());
            };
            let name = aux_metadata_name(self.next_index);
            self.next_index += 1;
            trace!(node = id.index(), %name, len = bytes.len(), "split out metadata");
            self.push_entry(name.clone(), &bytes)?;
            self.arena.patch(id, MetadataNode::ArchiveInternalRedirect { path: name, content_type: None });
            self.resolved.insert(id);
            patched += 1;
        }
        Ok(patched)
    }

    fn push_entry(&mut self, name: String, bytes: &[u8]) -> Result<()> {
        let payload = make_immutable_bucket(self.buckets, bytes)
            .with_context(|| format!("store {}", name))?;
        self.entries.push(ContainerEntry { payload, name });
        Ok(())
    }
}

/// Convenience wrapper around [`Resolver::run`].
pub fn resolve(
    arena: &mut MetadataArena,
    root: NodeId,
    limits: EncodeLimits,
    buckets: &dyn BucketFactory,
    entries: &mut Vec<ContainerEntry>,
) -> Result<ResolveReport> {
    Resolver::new(arena, limits, buckets, entries).run(root)
}
