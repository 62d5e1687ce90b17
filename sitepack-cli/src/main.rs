use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use globset::{Glob, GlobSetBuilder};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sitepack_core::archive::{self, ArchiveType};
use sitepack_core::bucket::TempBucketFactory;
use sitepack_core::client::{outcome_channel, ClientContext, ClientPutter, PutState};
use sitepack_core::container::{build_entries, ContainerInserter, InsertContext};
use sitepack_core::local_store::LocalBlockStore;
use sitepack_core::manifest::{self, DirFilter, Directory};
use sitepack_core::metadata::{decode, Document};
use sitepack_core::path_safety::PathPolicy;
use sitepack_core::resolve::ROOT_METADATA_NAME;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Tar,
    Zip,
}

impl From<Format> for ArchiveType {
    fn from(f: Format) -> Self {
        match f {
            Format::Tar => ArchiveType::Tar,
            Format::Zip => ArchiveType::Zip,
        }
    }
}

#[derive(Parser)]
#[command(name = "sitepack", version, about = "Pack sites into single-block containers")]
struct Cli {
    /// Log debug events (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,
    /// JSON insertion settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Args)]
struct Input {
    /// Directory to pack
    input: PathBuf,
    /// JSON manifest describing the site instead of walking the directory
    #[arg(long)]
    manifest: Option<PathBuf>,
    #[arg(long)]
    include: Vec<String>,
    #[arg(long)]
    exclude: Vec<String>,
    #[arg(long, value_enum)]
    format: Option<Format>,
    /// Largest descriptor a directory may embed inline
    #[arg(long)]
    max_inline: Option<usize>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Pack a directory into a container file
    Pack {
        #[command(flatten)]
        input: Input,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Pack a directory and insert it into a local block store
    Insert {
        #[command(flatten)]
        input: Input,
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        target_uri: Option<String>,
        #[arg(long)]
        dont_compress: bool,
        /// Compute the key without storing anything
        #[arg(long)]
        chk_only: bool,
        /// 64 hex digits
        #[arg(long)]
        crypto_key: Option<String>,
    },
    /// List container entries
    List {
        archive: PathBuf,
        #[arg(long, value_enum)]
        format: Option<Format>,
    },
    /// Unpack a container
    Extract {
        archive: PathBuf,
        dest: PathBuf,
        #[arg(long, value_enum)]
        format: Option<Format>,
        #[arg(long)]
        follow_symlinks: bool,
    },
    /// Print a container's descriptors as JSON
    Inspect {
        archive: PathBuf,
        #[arg(long, value_enum)]
        format: Option<Format>,
    },
    /// Read a block back out of a local store
    Fetch {
        #[arg(long)]
        store: PathBuf,
        key: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut cfg = match &cli.config {
        Some(p) => InsertContext::load(p)?,
        None => InsertContext::default(),
    };
    match cli.cmd {
        Cmd::Pack { input, output } => pack(&mut cfg, &input, &output),
        Cmd::Insert { input, store, target_uri, dont_compress, chk_only, crypto_key } => {
            let key = crypto_key.as_deref().map(parse_key).transpose()?;
            insert(&mut cfg, &input, &store, target_uri, dont_compress, chk_only, key)
        }
        Cmd::List { archive, format } => list(&archive, format_of(format, &archive, None)?),
        Cmd::Extract { archive, dest, format, follow_symlinks } => {
            let format = format_of(format, &archive, None)?;
            let names = archive::extract(&archive, format, &dest, PathPolicy { follow_symlinks })?;
            println!("extracted {} entries to {}", names.len(), dest.display());
            Ok(())
        }
        Cmd::Inspect { archive, format } => inspect(&archive, format_of(format, &archive, None)?),
        Cmd::Fetch { store, key, output } => fetch(&store, &key, output.as_deref()),
    }
}

fn init_tracing(verbose: bool) {
    let format = tracing_subscriber::fmt::format().without_time().with_target(false).compact();
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).event_format(format).with_writer(std::io::stderr).init();
}

/// Explicit flag, then the file extension, then the configured default.
fn format_of(flag: Option<Format>, path: &Path, default: Option<ArchiveType>) -> Result<ArchiveType> {
    if let Some(f) = flag {
        return Ok(f.into());
    }
    ArchiveType::from_path(path)
        .or(default)
        .ok_or_else(|| anyhow!("cannot tell the format of {}; pass --format", path.display()))
}

fn build_filter(includes: &[String], excludes: &[String]) -> Result<DirFilter> {
    let mut incb = GlobSetBuilder::new();
    let mut excb = GlobSetBuilder::new();
    if includes.is_empty() {
        incb.add(Glob::new("**")?);
    }
    for g in includes {
        incb.add(Glob::new(g).with_context(|| format!("bad include glob {g:?}"))?);
    }
    for g in excludes {
        excb.add(Glob::new(g).with_context(|| format!("bad exclude glob {g:?}"))?);
    }
    Ok(DirFilter { include: incb.build()?, exclude: excb.build()? })
}

fn load_manifest(input: &Input) -> Result<Directory> {
    let dir = match &input.manifest {
        Some(m) => manifest::from_json(m, &input.input)?,
        None => manifest::from_dir(&input.input, Some(&build_filter(&input.include, &input.exclude)?))?,
    };
    if dir.is_empty() {
        bail!("nothing to pack under {}", input.input.display());
    }
    debug!(items = dir.embedded_count(), bytes = manifest::payload_bytes(&dir), "manifest loaded");
    Ok(dir)
}

fn apply_overrides(cfg: &mut InsertContext, input: &Input) {
    if let Some(n) = input.max_inline {
        cfg.max_inline_metadata_bytes = n;
    }
    if let Some(f) = input.format {
        cfg.archive_type = f.into();
    }
}

fn pack(cfg: &mut InsertContext, input: &Input, output: &Path) -> Result<()> {
    apply_overrides(cfg, input);
    let format = format_of(input.format, output, Some(cfg.archive_type))?;
    let dir = load_manifest(input)?;
    let buckets = TempBucketFactory::new(cfg.temp_dir.clone());
    let (entries, report) = build_entries(&dir, cfg.limits(), &buckets)?;

    let partial = output.with_extension("partial");
    let res = File::create(&partial)
        .with_context(|| format!("create {}", partial.display()))
        .and_then(|f| {
            let mut w = BufWriter::new(f);
            let ct = archive::pack(&entries, format, &mut w)?;
            w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(ct)
        });
    let content_type = match res {
        Ok(ct) => ct,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
    };
    fs::rename(&partial, output).with_context(|| format!("rename to {}", output.display()))?;
    info!(entries = entries.len(), aux = report.aux_entries, "container written");
    println!(
        "packed {} entries ({} split descriptors) as {} to {}",
        entries.len(),
        report.aux_entries,
        content_type,
        output.display()
    );
    Ok(())
}

fn parse_key(s: &str) -> Result<[u8; 32]> {
    if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("crypto key must be 64 hex digits");
    }
    let mut out = [0u8; 32];
    for (i, b) in out.iter_mut().enumerate() {
        *b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).context("crypto key is not hex")?;
    }
    Ok(out)
}

fn insert(
    cfg: &mut InsertContext,
    input: &Input,
    store: &Path,
    target_uri: Option<String>,
    dont_compress: bool,
    chk_only: bool,
    crypto_key: Option<[u8; 32]>,
) -> Result<()> {
    apply_overrides(cfg, input);
    let dir = load_manifest(input)?;
    let mut options = cfg.default_options();
    options.dont_compress |= dont_compress;
    options.get_chk_only = chk_only;
    options.force_crypto_key = crypto_key;

    let ctx = ClientContext::temp_files(cfg.temp_dir.clone());
    let (tx, rx) = outcome_channel();
    let job = ContainerInserter::new(
        ClientPutter::new(input.input.display().to_string(), false),
        Arc::new(tx),
        dir,
        target_uri,
        cfg,
        options,
        Arc::new(LocalBlockStore::new(store)),
        None,
    );
    job.schedule(&ctx).map_err(|e| anyhow!(e)).context("insert container")?;
    let fin = rx.wait_final(job.job_id(), Duration::from_secs(600))?;
    fin.result.map_err(|e| anyhow!(e)).context("insert container")?;
    let key = fin.key.ok_or_else(|| anyhow!("store reported success without a key"))?;
    println!("{key}");
    Ok(())
}

fn list(path: &Path, format: ArchiveType) -> Result<()> {
    for (name, len) in archive::list(path, format)? {
        println!("{:>10}  {}", len, name);
    }
    Ok(())
}

fn inspect(path: &Path, format: ArchiveType) -> Result<()> {
    let mut docs: BTreeMap<String, Document> = BTreeMap::new();
    for e in archive::read_container_file(path, format)? {
        if e.name == ROOT_METADATA_NAME || e.name.starts_with(&format!("{ROOT_METADATA_NAME}-")) {
            let doc = decode(&e.data).with_context(|| format!("decode {}", e.name))?;
            docs.insert(e.name, doc);
        }
    }
    if !docs.contains_key(ROOT_METADATA_NAME) {
        bail!("{} has no {} entry", path.display(), ROOT_METADATA_NAME);
    }
    println!("{}", serde_json::to_string_pretty(&docs)?);
    Ok(())
}

fn fetch(store: &Path, key: &str, output: Option<&Path>) -> Result<()> {
    let (rec, data) = LocalBlockStore::new(store).load(key)?;
    match output {
        Some(out) => {
            fs::write(out, &data).with_context(|| format!("write {}", out.display()))?;
            println!("{} bytes ({}) written to {}", data.len(), rec.content_type, out.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&rec)?),
    }
    Ok(())
}
