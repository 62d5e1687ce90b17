//! Byte containers ("buckets") and the allocators that hand them out.
//!
//! A bucket is an immutable run of bytes that can be read any number of
//! times. New buckets are produced by writing into a [`BucketWriter`] obtained
//! from a [`BucketFactory`] and sealing it with [`BucketWriter::finish`].
//! Dropping a writer without finishing it discards whatever was written,
//! including any backing temporary file.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read-only handle on a run of bytes.
pub trait Bucket: fmt::Debug + Send + Sync {
    /// Length in bytes.
    fn size(&self) -> u64;

    /// Open a fresh reader positioned at the first byte.
    fn reader(&self) -> Result<Box<dyn Read + Send + '_>>;

    /// Read the whole bucket into memory.
    fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        self.reader()?.read_to_end(&mut buf).context("read bucket")?;
        Ok(buf)
    }
}

/// Shared bucket handle, as stored in manifests and container entries.
pub type BucketRef = Arc<dyn Bucket>;

/// Writable sink for a bucket under construction.
pub trait BucketWriter: Write + Send {
    /// Flush and seal the written bytes into an immutable bucket.
    fn finish(self: Box<Self>) -> Result<BucketRef>;
}

/// Allocator for new buckets.
pub trait BucketFactory: Send + Sync {
    /// Create an empty writable bucket. `size_hint` is `None` when the final
    /// size is unknown.
    fn make_bucket(&self, size_hint: Option<u64>) -> Result<Box<dyn BucketWriter>>;
}

/// Write `bytes` into a freshly allocated bucket and seal it.
pub fn make_immutable_bucket(factory: &dyn BucketFactory, bytes: &[u8]) -> Result<BucketRef> {
    let mut w = factory.make_bucket(Some(bytes.len() as u64))?;
    w.write_all(bytes).context("write bucket")?;
    w.finish()
}

/// Reader over exactly `bucket.size()` bytes; fails with `UnexpectedEof` if
/// the bucket yields fewer.
pub fn exact_reader(bucket: &dyn Bucket) -> Result<ExactReader<'_>> {
    Ok(ExactReader { inner: bucket.reader()?.take(bucket.size()), remaining: bucket.size() })
}

pub struct ExactReader<'a> {
    inner: io::Take<Box<dyn Read + Send + 'a>>,
    remaining: u64,
}

impl Read for ExactReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("bucket ended {} bytes early", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Bucket held entirely in memory.
#[derive(Clone)]
pub struct MemoryBucket {
    data: Arc<[u8]>,
}

impl MemoryBucket {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into().into() }
    }

    /// Convenience constructor returning a shared handle.
    pub fn shared(data: impl Into<Vec<u8>>) -> BucketRef {
        Arc::new(Self::new(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBucket").field("len", &self.data.len()).finish()
    }
}

impl Bucket for MemoryBucket {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(&self.data[..]))
    }

    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(self.data.to_vec())
    }
}

struct MemoryBucketWriter {
    buf: Vec<u8>,
}

impl Write for MemoryBucketWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BucketWriter for MemoryBucketWriter {
    fn finish(self: Box<Self>) -> Result<BucketRef> {
        Ok(MemoryBucket::shared(self.buf))
    }
}

/// Allocates [`MemoryBucket`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryBucketFactory;

impl BucketFactory for MemoryBucketFactory {
    fn make_bucket(&self, size_hint: Option<u64>) -> Result<Box<dyn BucketWriter>> {
        let cap = size_hint.unwrap_or(0).min(64 * 1024 * 1024) as usize;
        Ok(Box::new(MemoryBucketWriter { buf: Vec::with_capacity(cap) }))
    }
}

/// Bucket backed by a file on disk. Temporary buckets delete their file when
/// the last handle is dropped.
#[derive(Debug)]
pub struct FileBucket {
    path: PathBuf,
    size: u64,
    _temp: Option<tempfile::TempPath>,
}

impl FileBucket {
    /// Wrap an existing file. The file is not removed on drop.
    pub fn open(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).with_context(|| format!("stat {:?}", path))?;
        if !meta.is_file() {
            bail!("not a regular file: {:?}", path);
        }
        Ok(Self { path: path.to_path_buf(), size: meta.len(), _temp: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Bucket for FileBucket {
    fn size(&self) -> u64 {
        self.size
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        let f = File::open(&self.path).with_context(|| format!("open {:?}", self.path))?;
        Ok(Box::new(BufReader::new(f)))
    }
}

struct TempBucketWriter {
    out: BufWriter<tempfile::NamedTempFile>,
}

impl Write for TempBucketWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.out.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl BucketWriter for TempBucketWriter {
    fn finish(self: Box<Self>) -> Result<BucketRef> {
        let tmp = self.out.into_inner().map_err(|e| e.into_error()).context("flush temp bucket")?;
        let size = tmp.as_file().metadata().context("stat temp bucket")?.len();
        let temp = tmp.into_temp_path();
        Ok(Arc::new(FileBucket { path: temp.to_path_buf(), size, _temp: Some(temp) }))
    }
}

/// Allocates file-backed temporary buckets, optionally under a given directory.
#[derive(Clone, Debug, Default)]
pub struct TempBucketFactory {
    dir: Option<PathBuf>,
}

impl TempBucketFactory {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }
}

impl BucketFactory for TempBucketFactory {
    fn make_bucket(&self, _size_hint: Option<u64>) -> Result<Box<dyn BucketWriter>> {
        let tmp = match &self.dir {
            Some(dir) => tempfile::Builder::new()
                .prefix("sitepack-")
                .tempfile_in(dir)
                .with_context(|| format!("create temp bucket in {:?}", dir))?,
            None => tempfile::Builder::new()
                .prefix("sitepack-")
                .tempfile()
                .context("create temp bucket")?,
        };
        Ok(Box::new(TempBucketWriter { out: BufWriter::new(tmp) }))
    }
}
