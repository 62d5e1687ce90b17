//! Packing container entries into a single TAR or ZIP stream, and reading
//! such containers back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;
use tracing::{debug, trace};

use crate::bucket::{exact_reader, Bucket, BucketRef};
use crate::path_safety::{destination_for, PathPolicy};
use crate::zip::{self, ZipWriter};

/// One file inside a container.
#[derive(Clone, Debug)]
pub struct ContainerEntry {
    pub payload: BucketRef,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    #[default]
    Tar,
    Zip,
}

impl ArchiveType {
    /// Registered content types; the first one is canonical.
    pub fn mime_types(self) -> &'static [&'static str] {
        match self {
            ArchiveType::Tar => &["application/x-tar"],
            ArchiveType::Zip => &["application/zip", "application/x-zip-compressed"],
        }
    }

    pub fn content_type(self) -> &'static str {
        self.mime_types()[0]
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        [ArchiveType::Tar, ArchiveType::Zip]
            .into_iter()
            .find(|t| t.mime_types().contains(&content_type))
    }

    /// Guess from a file name's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "tar" => Some(ArchiveType::Tar),
            "zip" => Some(ArchiveType::Zip),
            _ => None,
        }
    }

    /// Whether the format compresses its entries itself.
    pub fn compresses(self) -> bool {
        matches!(self, ArchiveType::Zip)
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveType::Tar => "tar",
            ArchiveType::Zip => "zip",
        })
    }
}

/// Write `entries`, in order, as one `format` container to `out`, returning
/// the container's content type. Entry times are fixed at the epoch so equal
/// input gives equal output. On error the partial output must be discarded.
pub fn pack<W: Write>(entries: &[ContainerEntry], format: ArchiveType, out: W) -> Result<&'static str> {
    debug!(%format, entries = entries.len(), "packing container");
    match format {
        ArchiveType::Tar => pack_tar(entries, out)?,
        ArchiveType::Zip => pack_zip(entries, out)?,
    }
    Ok(format.content_type())
}

fn pack_tar<W: Write>(entries: &[ContainerEntry], out: W) -> Result<()> {
    let mut tar = tar::Builder::new(out);
    for e in entries {
        let size = e.payload.size();
        trace!(name = %e.name, size, "tar entry");
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        header.set_mtime(0);
        header.set_mode(0o644);
        let data = exact_reader(e.payload.as_ref())?;
        // Long names get a GNU long-name record.
        tar.append_data(&mut header, &e.name, data).with_context(|| format!("append {}", e.name))?;
    }
    let mut out = tar.into_inner().context("finish tar")?;
    out.flush()?;
    Ok(())
}

fn pack_zip<W: Write>(entries: &[ContainerEntry], out: W) -> Result<()> {
    let mut zw = ZipWriter::new(out);
    for e in entries {
        let size = e.payload.size();
        trace!(name = %e.name, size, "zip entry");
        let mut data = exact_reader(e.payload.as_ref())?;
        zw.append(&e.name, &mut data).with_context(|| format!("append {}", e.name))?;
    }
    zw.finish().context("finish zip")?;
    Ok(())
}

/// An entry read back out of a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Read all entries of a container.
pub fn read_container<R: Read + Seek>(mut r: R, format: ArchiveType) -> Result<Vec<ExtractedEntry>> {
    match format {
        ArchiveType::Tar => {
            let mut ar = tar::Archive::new(r);
            let mut out = Vec::new();
            for ent in ar.entries().context("read tar")? {
                let mut ent = ent.context("read tar entry")?;
                if ent.header().entry_type() != tar::EntryType::Regular {
                    continue;
                }
                let name = ent.path()?.to_string_lossy().into_owned();
                let mut data = Vec::with_capacity(ent.size() as usize);
                ent.read_to_end(&mut data).with_context(|| format!("read {}", name))?;
                out.push(ExtractedEntry { name, data });
            }
            Ok(out)
        }
        ArchiveType::Zip => Ok(zip::read_entries(&mut r)?
            .into_iter()
            .map(|(name, data)| ExtractedEntry { name, data })
            .collect()),
    }
}

/// Open and read a container file.
pub fn read_container_file(path: &Path, format: ArchiveType) -> Result<Vec<ExtractedEntry>> {
    let f = File::open(path).with_context(|| format!("open {:?}", path))?;
    read_container(BufReader::new(f), format).with_context(|| format!("read container {:?}", path))
}

/// Read a container held in a bucket.
pub fn read_container_bucket(bucket: &dyn Bucket, format: ArchiveType) -> Result<Vec<ExtractedEntry>> {
    read_container(std::io::Cursor::new(bucket.read_all()?), format)
}

/// Entry names and sizes of a container file, in archive order.
pub fn list(path: &Path, format: ArchiveType) -> Result<Vec<(String, u64)>> {
    Ok(read_container_file(path, format)?
        .into_iter()
        .map(|e| {
            let len = e.data.len() as u64;
            (e.name, len)
        })
        .collect())
}

/// Unpack a container file under `dest`, returning the written entry names.
pub fn extract(path: &Path, format: ArchiveType, dest: &Path, policy: PathPolicy) -> Result<Vec<String>> {
    std::fs::create_dir_all(dest).with_context(|| format!("create dir {:?}", dest))?;
    let mut names = Vec::new();
    for ent in read_container_file(path, format)? {
        let target = destination_for(dest, &ent.name, policy)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create dir {:?}", parent))?;
        }
        let mut f = File::create(&target).with_context(|| format!("create {:?}", target))?;
        f.write_all(&ent.data)?;
        names.push(ent.name);
    }
    Ok(names)
}
