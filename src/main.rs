use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use docstore::{
    CollectingVisitor, Config, DocumentStore, FileHeaderContext, NoopTlogSync, ThreadPoolExecutor,
};

#[derive(Parser)]
#[command(name = "docstore", version = "0.1.0", about = "Document store maintenance CLI")]
struct Cli {
    /// Directory holding the chunk-file set
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a payload under a lid
    Write {
        lid: u32,
        serial: u64,
        /// Read the payload from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print a lid's payload to stdout
    Read { lid: u32 },
    /// Logically remove a lid
    Remove { lid: u32, serial: u64 },
    /// Flush the active file and wait for durability up to a serial
    Flush {
        #[arg(long, default_value = "0")]
        token: u64,
    },
    /// Run one compaction round
    Compact,
    /// Print storage statistics
    Stats,
    /// Visit every live record
    Visit {
        /// Clear each lid from the directory after visiting it
        #[arg(long)]
        prune: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let store = DocumentStore::open(
        &cli.dir,
        Config::default(),
        Arc::new(ThreadPoolExecutor::new(2)),
        Arc::new(NoopTlogSync),
        None,
        FileHeaderContext::new("docstore-cli"),
        false,
    )?;

    match cli.command {
        Commands::Write { lid, serial, file } => {
            let bytes = match file {
                Some(path) => std::fs::read(path)?,
                None => {
                    use std::io::Read;
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            store.write(serial, lid, &bytes)?;
            println!("wrote lid={lid} serial={serial} ({} B)", bytes.len());
        }

        Commands::Read { lid } => {
            let mut buf = Vec::new();
            let n = store.read(lid, &mut buf)?;
            if n == 0 {
                eprintln!("lid {lid} not found");
                std::process::exit(1);
            }
            use std::io::Write;
            std::io::stdout().write_all(&buf)?;
        }

        Commands::Remove { lid, serial } => {
            store.remove(serial, lid)?;
            println!("removed lid={lid} serial={serial}");
        }

        Commands::Flush { token } => {
            let target = if token == 0 { store.init_flush()? } else { token };
            store.flush(target)?;
            println!("flushed up to serial {target}");
        }

        Commands::Compact => {
            let did_work = store.compact()?;
            println!(
                "{}",
                if did_work {
                    "compacted one file"
                } else {
                    "nothing eligible for compaction"
                }
            );
        }

        Commands::Stats => {
            let stats = store.storage_stats();
            println!("── document store stats ─────────────────────────────────");
            println!("  files           {}", stats.num_files);
            println!("  disk footprint  {} B", stats.disk_footprint);
            println!("  disk bloat      {} B", stats.disk_bloat);
            println!("  live lids       {}", stats.num_live_lids);
            println!("  docIdLimit      {}", stats.doc_id_limit);
            println!("  last serial     {}", stats.last_serial);
            println!("  last synced     {}", stats.last_synced_serial);
            if let Some(spread) = stats.max_bucket_spread {
                println!("  max bucket spread {spread}");
            }
            println!("  memory (lid dir) {} B", store.memory_used());
            println!("  memory (meta)    {} B", store.memory_meta());
            println!("  estimated compaction gain {} B", store.estimate_compact_gain());
        }

        Commands::Visit { prune } => {
            let mut visitor = CollectingVisitor::new();
            store.accept(&mut visitor, None, prune)?;
            for (lid, bytes) in &visitor.records {
                println!("lid={lid} ({} B)", bytes.len());
            }
            println!("{} live record(s)", visitor.records.len());
        }
    }

    Ok(())
}
