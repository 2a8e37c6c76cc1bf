//! Administrative CLI for segment images.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use segstore::{
    admin::{format_image, open_image, stats, verify, AdminError, SegImage, VerifyLevel},
    config::StoreConfig,
    error::StoreError,
    storage::btree::{BTree, BytewiseOps, KvOps},
};
use tracing_subscriber::EnvFilter;

/// Dictionary name of the tree the key/value commands work on.
const KV_TREE: &str = "segctl.kv";

#[derive(Parser, Debug)]
#[command(
    name = "segctl",
    version,
    about = "Administrative CLI for segstore segment images",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "SEGCTL_CONFIG",
        value_name = "FILE",
        help = "Configuration file (defaults to the per-user segctl.toml)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new image with an allocator and an empty dictionary
    Format {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        #[arg(long, help = "Segment size in bytes (overrides the configuration)")]
        size: Option<u64>,
    },
    /// Print segment, allocator and dictionary statistics
    Stats {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },
    /// Check the image structures and report findings
    Verify {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Full)]
        level: VerifyLevelArg,
    },
    /// Store a key/value pair
    Put {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        key: String,
        value: String,
        #[arg(long, help = "Replace the value when the key exists")]
        overwrite: bool,
        #[arg(long, help = "Decode KEY and VALUE from hex")]
        hex: bool,
    },
    /// Print the value stored under a key
    Get {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        key: String,
        #[arg(long, help = "Decode KEY from hex")]
        hex: bool,
    },
    /// Delete a key
    Del {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        key: String,
        #[arg(long, help = "Decode KEY from hex")]
        hex: bool,
    },
    /// List key/value pairs in key order
    List {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        #[arg(long, help = "Start at the first key not below this one")]
        from: Option<String>,
        #[arg(long, help = "Stop after this many pairs")]
        limit: Option<usize>,
    },
    /// List dictionary entries
    Dict {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        #[arg(long, default_value = "", help = "Only names starting with this prefix")]
        prefix: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

#[derive(Debug, Serialize)]
struct PairOutput {
    key: String,
    value: String,
    value_hex: String,
}

impl PairOutput {
    fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: printable(key),
            value: printable(value),
            value_hex: hex::encode(value),
        }
    }
}

#[derive(Debug, Serialize)]
struct DictEntryOutput {
    name: String,
    header: u64,
}

#[derive(Debug, Serialize)]
struct ChangeOutput {
    action: &'static str,
    key: String,
    tx: u64,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct FormatOutput {
    image: String,
    size: u64,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SEGCTL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = StoreConfig::load(cli.config.clone())?;
    let open_opts = config.admin_options();

    match cli.command {
        Command::Format { image, size } => {
            let size = size.unwrap_or(config.segment.size);
            format_image(&image, size, &open_opts)?;
            let out = FormatOutput {
                image: image.display().to_string(),
                size,
            };
            emit(&cli.format, &out, |_| {
                println!("formatted {} ({} bytes)", out.image, out.size)
            })?;
        }
        Command::Stats { image } => {
            let report = stats(&image, &open_opts)?;
            emit(&cli.format, &report, |fmt| print_stats_text(fmt, &report))?;
        }
        Command::Verify { image, level } => {
            let report = verify(&image, &open_opts, level.into())?;
            emit(&cli.format, &report, |fmt| print_verify_text(fmt, &report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::Put {
            image,
            key,
            value,
            overwrite,
            hex,
        } => {
            let key = decode_arg(&key, hex)?;
            let value = decode_arg(&value, hex)?;
            let image = open_image(&image, &open_opts)?;
            let tree = kv_tree(&image)?;
            let tx = image.begin_tx(tree.save_credit(1, key.len() as u64, value.len() as u64))?;
            tree.save(Some(&tx), &key, &value, overwrite).wait().map_err(|err| match err {
                StoreError::Exists => AdminError::Message(format!(
                    "key {} exists; pass --overwrite to replace it",
                    printable(&key)
                )),
                other => other.into(),
            })?;
            let record = image.commit(&tx)?;
            let out = ChangeOutput {
                action: "put",
                key: printable(&key),
                tx: record.tx(),
                bytes: record.bytes(),
            };
            emit(&cli.format, &out, |_| println!("stored {}", out.key))?;
        }
        Command::Get { image, key, hex } => {
            let key = decode_arg(&key, hex)?;
            let image = open_image(&image, &open_opts)?;
            let value = existing_kv_tree(&image)?
                .ok_or(StoreError::NotFound)
                .and_then(|tree| tree.lookup(&key).wait())
                .map_err(|err| not_found_message(err, &key))?;
            let out = PairOutput::new(&key, &value);
            emit(&cli.format, &out, |_| println!("{}", out.value))?;
        }
        Command::Del { image, key, hex } => {
            let key = decode_arg(&key, hex)?;
            let image = open_image(&image, &open_opts)?;
            let tree = existing_kv_tree(&image)?.ok_or_else(|| not_found_message(StoreError::NotFound, &key))?;
            let tx = image.begin_tx(tree.delete_credit(1))?;
            tree.delete(Some(&tx), &key)
                .wait()
                .map_err(|err| not_found_message(err, &key))?;
            let record = image.commit(&tx)?;
            let out = ChangeOutput {
                action: "del",
                key: printable(&key),
                tx: record.tx(),
                bytes: record.bytes(),
            };
            emit(&cli.format, &out, |_| println!("deleted {}", out.key))?;
        }
        Command::List { image, from, limit } => {
            let image = open_image(&image, &open_opts)?;
            let pairs = match existing_kv_tree(&image)? {
                Some(tree) => collect_pairs(&tree, from.as_deref(), limit.unwrap_or(usize::MAX))?,
                None => Vec::new(),
            };
            emit(&cli.format, &pairs, |_| {
                for pair in &pairs {
                    println!("{}\t{}", pair.key, pair.value);
                }
            })?;
        }
        Command::Dict { image, prefix } => {
            let image = open_image(&image, &open_opts)?;
            let entries: Vec<DictEntryOutput> = image
                .dict()
                .list(&prefix)?
                .into_iter()
                .map(|(name, addr)| DictEntryOutput {
                    name,
                    header: addr.get(),
                })
                .collect();
            emit(&cli.format, &entries, |_| {
                for entry in &entries {
                    println!("{}\t{:#x}", entry.name, entry.header);
                }
            })?;
        }
    }

    Ok(())
}

fn kv_ops() -> Arc<dyn KvOps> {
    Arc::new(BytewiseOps)
}

/// Opens the key/value tree, registering it first when the image has none.
fn kv_tree(image: &SegImage) -> Result<BTree, AdminError> {
    if let Some(tree) = existing_kv_tree(image)? {
        return Ok(tree);
    }
    let tx = image.begin_tx(image.create_tree_credit(KV_TREE))?;
    let tree = image.create_tree(Some(&tx), KV_TREE, kv_ops())?;
    image.commit(&tx)?;
    tracing::info!(target: "segctl", tree = KV_TREE, "created key/value tree");
    Ok(tree)
}

fn existing_kv_tree(image: &SegImage) -> Result<Option<BTree>, AdminError> {
    match image.open_tree(KV_TREE, kv_ops()) {
        Ok(tree) => Ok(Some(tree)),
        Err(AdminError::Core(StoreError::NotFound)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn collect_pairs(tree: &BTree, from: Option<&str>, limit: usize) -> Result<Vec<PairOutput>, StoreError> {
    let mut pairs = Vec::new();
    if limit == 0 {
        return Ok(pairs);
    }
    let mut cursor = tree.cursor();
    let positioned = match from {
        Some(from) => cursor.get(from.as_bytes(), true).wait(),
        None => cursor.first().wait(),
    };
    match positioned {
        Ok(()) => {}
        Err(StoreError::NotFound) => return Ok(pairs),
        Err(err) => return Err(err),
    }
    while let Some((key, value)) = cursor.kv_get() {
        pairs.push(PairOutput::new(key, value));
        if pairs.len() >= limit {
            break;
        }
        match cursor.next().wait() {
            Ok(()) => {}
            Err(StoreError::NotFound) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(pairs)
}

fn decode_arg(raw: &str, as_hex: bool) -> Result<Vec<u8>, AdminError> {
    if as_hex {
        hex::decode(raw).map_err(|err| AdminError::Message(format!("invalid hex {raw:?}: {err}")))
    } else {
        Ok(raw.as_bytes().to_vec())
    }
}

fn not_found_message(err: StoreError, key: &[u8]) -> AdminError {
    match err {
        StoreError::NotFound => AdminError::Message(format!("key {} not found", printable(key))),
        other => other.into(),
    }
}

fn printable(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("0x{}", hex::encode(bytes)),
    }
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_stats_text(_: OutputFormat, report: &segstore::admin::StatsReport) {
    println!("Segment:");
    println!(
        "  path={} file_size={} size={} version={} dict_root={}",
        report.segment.path,
        report.segment.file_size_bytes,
        report.segment.size,
        report.segment.version,
        report
            .segment
            .dict_root
            .map(|addr| format!("{addr:#x}"))
            .unwrap_or_else(|| "none".to_string()),
    );
    let alloc = &report.allocator;
    println!("Allocator:");
    println!(
        "  space={} chunks={} free_chunks={} used={} free={} lost={} overhead={}",
        alloc.space_size,
        alloc.chunks_nr,
        alloc.free_chunks_nr,
        alloc.used,
        alloc.free,
        alloc.lost,
        alloc.overhead(),
    );
    println!(
        "  calls: alloc={} ({} bytes) failed={} free={} small_alloc={} large_alloc={}",
        alloc.total.alloc_nr,
        alloc.total.alloc_size,
        alloc.total.fail_nr,
        alloc.total.free_nr,
        alloc.small.alloc_nr,
        alloc.large.alloc_nr,
    );
    let dict = &report.dictionary;
    println!("Dictionary:");
    println!(
        "  entries={} height={} fanout={}",
        dict.entries, dict.height, dict.fanout
    );
    for tree in &dict.trees {
        match &tree.summary {
            Some(summary) => println!(
                "  {} @ {:#x}: items={} nodes={} height={} fanout={} kv_bytes={}",
                tree.name,
                tree.header,
                summary.items,
                summary.nodes,
                summary.height,
                summary.fanout,
                summary.kv_bytes,
            ),
            None => println!("  {} @ {:#x}: not a bytewise tree", tree.name, tree.header),
        }
    }
}

fn print_verify_text(_: OutputFormat, report: &segstore::admin::VerifyReport) {
    println!(
        "Verify ({:?}) => success={} chunks={} free_chunks={} dict_entries={} trees={} nodes={} items={}",
        report.level,
        report.success,
        report.counts.chunks,
        report.counts.free_chunks,
        report.counts.dict_entries,
        report.counts.trees_checked,
        report.counts.tree_nodes,
        report.counts.tree_items,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}
