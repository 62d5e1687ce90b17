//! A block-insertion engine that stores blocks in a local directory.
//!
//! Each block is kept as `<key>.blk` next to a `<key>.json` record. Keys are
//! `CHK@` followed by the hex BLAKE3 digest of the stored bytes, keyed with
//! the forced crypto key when one is given.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, instrument, warn};

use crate::bucket::Bucket;
use crate::client::{
    BlockInsertOptions, BlockInserter, ClientContext, ClientPutter, InsertBlock, JobId, PutCompletion, PutState,
    Token,
};
use crate::error::InsertError;

pub const KEY_PREFIX: &str = "CHK@";

const ZSTD_LEVEL: i32 = 3;

/// Sidecar record written next to each stored block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub key: String,
    pub content_type: String,
    pub target_uri: Option<String>,
    pub compressed: bool,
    pub crypto_algorithm: u8,
    pub raw_size: u64,
    pub stored_size: u64,
    pub inserted_utc: String,
}

/// Directory of stored blocks.
#[derive(Clone, Debug)]
pub struct LocalBlockStore {
    dir: PathBuf,
}

impl LocalBlockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        let hex = key.strip_prefix(KEY_PREFIX).unwrap_or_default();
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("malformed key {:?}", key);
        }
        Ok((self.dir.join(format!("{key}.blk")), self.dir.join(format!("{key}.json"))))
    }

    /// Read a block back, undoing any compression.
    pub fn load(&self, key: &str) -> Result<(StoredBlock, Vec<u8>)> {
        let (blk, json) = self.paths(key)?;
        let rec: StoredBlock = serde_json::from_slice(&fs::read(&json).with_context(|| format!("read {:?}", json))?)
            .with_context(|| format!("parse {:?}", json))?;
        let stored = fs::read(&blk).with_context(|| format!("read {:?}", blk))?;
        if stored.len() as u64 != rec.stored_size {
            bail!("block {} is {} bytes, record says {}", key, stored.len(), rec.stored_size);
        }
        let data = if rec.compressed {
            zstd::stream::decode_all(&stored[..]).with_context(|| format!("zstd decompress {}", key))?
        } else {
            stored
        };
        Ok((rec, data))
    }

    /// Records of every stored block, sorted by key.
    pub fn list(&self) -> Result<Vec<StoredBlock>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for ent in fs::read_dir(&self.dir).with_context(|| format!("read dir {:?}", self.dir))? {
            let p = ent?.path();
            if p.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let rec: StoredBlock = serde_json::from_slice(&fs::read(&p)?).with_context(|| format!("parse {:?}", p))?;
            out.push(rec);
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).with_context(|| format!("temp file in {:?}", self.dir))?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).with_context(|| format!("persist {:?}", path))?;
        Ok(())
    }
}

impl BlockInserter for LocalBlockStore {
    fn make_inserter(
        &self,
        parent: Arc<ClientPutter>,
        cb: Arc<dyn PutCompletion>,
        block: InsertBlock,
        options: BlockInsertOptions,
        token: Option<Token>,
    ) -> Result<Arc<dyn PutState>> {
        fs::create_dir_all(&self.dir).with_context(|| format!("create dir {:?}", self.dir))?;
        Ok(Arc::new(LocalBlockInserter {
            id: JobId::next(),
            parent,
            cb,
            block,
            options,
            token,
            store: self.clone(),
            finished: Mutex::new(false),
        }))
    }
}

/// One block being written to a [`LocalBlockStore`].
pub struct LocalBlockInserter {
    id: JobId,
    parent: Arc<ClientPutter>,
    cb: Arc<dyn PutCompletion>,
    block: InsertBlock,
    options: BlockInsertOptions,
    token: Option<Token>,
    store: LocalBlockStore,
    finished: Mutex<bool>,
}

impl LocalBlockInserter {
    pub fn options(&self) -> &BlockInsertOptions {
        &self.options
    }

    /// Claim the right to report an outcome. Only the first caller wins.
    fn claim(&self) -> bool {
        let mut f = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        !std::mem::replace(&mut *f, true)
    }

    fn store(&self) -> Result<String> {
        let raw = self.block.data.read_all().context("read block data")?;
        let mut compressed = false;
        let mut stored = raw.clone();
        if !self.options.dont_compress {
            let z = zstd::stream::encode_all(&raw[..], ZSTD_LEVEL).context("zstd compress block")?;
            if z.len() < raw.len() {
                stored = z;
                compressed = true;
            }
        }
        let digest = match &self.options.force_crypto_key {
            Some(k) => blake3::keyed_hash(k, &stored),
            None => blake3::hash(&stored),
        };
        let key = format!("{KEY_PREFIX}{}", digest.to_hex());
        debug!(%key, raw = raw.len(), stored = stored.len(), compressed, "block key computed");
        if self.options.get_chk_only {
            return Ok(key);
        }

        let (blk, json) = self.store.paths(&key)?;
        let rec = StoredBlock {
            key: key.clone(),
            content_type: self.block.content_type.clone(),
            target_uri: self.block.target_uri.clone(),
            compressed,
            crypto_algorithm: self.options.crypto_algorithm,
            raw_size: raw.len() as u64,
            stored_size: stored.len() as u64,
            inserted_utc: chrono::Utc::now().to_rfc3339(),
        };
        self.store.write_atomic(&blk, &stored)?;
        self.store.write_atomic(&json, &serde_json::to_vec_pretty(&rec)?)?;
        Ok(key)
    }
}

impl PutState for LocalBlockInserter {
    fn job_id(&self) -> JobId {
        self.id
    }

    fn parent(&self) -> &Arc<ClientPutter> {
        &self.parent
    }

    fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    #[instrument(skip_all, fields(job = %self.id))]
    fn schedule(&self, ctx: &ClientContext) -> Result<(), InsertError> {
        if !self.claim() {
            return Ok(());
        }
        match self.store() {
            Ok(key) => {
                self.cb.on_generated_key(self, &key, ctx);
                self.cb.on_success(self, ctx);
            }
            Err(e) => {
                warn!(error = ?e, "storing block failed");
                self.cb.on_failure(InsertError::storage(e), self, ctx);
            }
        }
        Ok(())
    }

    fn cancel(&self, ctx: &ClientContext) {
        if self.claim() {
            self.cb.on_failure(InsertError::cancelled(), self, ctx);
        }
    }
}
