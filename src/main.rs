use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use layerfs::{
    load_blockset, make_key, save_blockset, BlockLayerSpec, BlockStore, BlockStoreRegistry,
    Blockset, BlocksetScrubber, InodeRef, LayerfsConfig, MemoryMetadataStore, OpContext,
    ScrubConfig,
};

#[derive(Parser)]
#[command(name = "layerfs")]
#[command(about = "Layered, replicated block storage for inodes")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config/layerfs.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a layer spec and print its canonical form
    ParseSpec {
        #[arg(short, long)]
        spec: String,
    },
    /// Create an empty blockset for an inode
    Create {
        #[arg(short, long)]
        inode: u64,
        #[arg(short, long, default_value_t = 1)]
        generation: u64,
        /// Layer spec; defaults to the configured spec
        #[arg(short, long)]
        spec: Option<String>,
    },
    /// Write a file's contents as one block
    Put {
        #[arg(short, long)]
        inode: u64,
        #[arg(short, long, default_value_t = 1)]
        generation: u64,
        #[arg(long)]
        index: u64,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Read one block into a file
    Get {
        #[arg(short, long)]
        inode: u64,
        #[arg(long)]
        index: u64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show the layer stack and contents of a blockset
    Inspect {
        #[arg(short, long)]
        inode: u64,
    },
    /// Read back every block of a blockset and report problems
    Scrub {
        #[arg(short, long)]
        inode: u64,
        /// Stop at the first critical issue
        #[arg(long)]
        quick: bool,
    },
    /// Show version information
    Version,
}

/// Everything a subcommand needs: config, block store and metadata snapshot
struct Session {
    config: LayerfsConfig,
    store: Arc<dyn BlockStore>,
    metadata: MemoryMetadataStore,
    ctx: OpContext,
}

impl Session {
    fn open(config_path: &str) -> anyhow::Result<Self> {
        let config = load_or_create_config(config_path)?;
        config.validate()?;

        let registry = BlockStoreRegistry::with_defaults();
        let store = registry.open(&config.store)?;
        if config.store.backend == "memory" {
            warn!("The memory backend does not keep blocks between invocations");
        }

        let metadata = if config.blockset_state_path.exists() {
            let json = std::fs::read_to_string(&config.blockset_state_path)?;
            MemoryMetadataStore::from_json(&json)?
        } else {
            MemoryMetadataStore::new()
        };

        let mut ctx = OpContext::background();
        if let Some(timeout) = config.operation_timeout() {
            ctx = ctx.with_timeout(timeout);
        }
        let canceller = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling in-flight operations");
                canceller.cancel();
            }
        });

        Ok(Self {
            config,
            store,
            metadata,
            ctx,
        })
    }

    fn inode_key(&self, inode: u64) -> String {
        make_key(&self.config.metadata_prefix, ["inodes", inode.to_string().as_str()])
    }

    async fn load(&self, inode: u64) -> anyhow::Result<(Blockset, u64)> {
        let key = self.inode_key(inode);
        load_blockset(&self.ctx, &self.metadata, &key, Arc::clone(&self.store))
            .await
            .with_context(|| format!("no blockset for inode {}", inode))
    }

    async fn save(&self, inode: u64, blockset: &Blockset, version: u64) -> anyhow::Result<u64> {
        let key = self.inode_key(inode);
        let version = save_blockset(&self.ctx, &self.metadata, &key, blockset, version).await?;
        self.persist()?;
        Ok(version)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let path = &self.config.blockset_state_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.metadata.to_json()?)?;
        Ok(())
    }
}

fn load_or_create_config(path: &str) -> anyhow::Result<LayerfsConfig> {
    if Path::new(path).exists() {
        return Ok(LayerfsConfig::from_file(path)?);
    }

    warn!("Configuration file not found, creating default configuration");
    let config = LayerfsConfig::new();
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save_to_file(path)?;
    info!("Default configuration saved to: {}", path);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ParseSpec { spec } => {
            let spec = BlockLayerSpec::parse(&spec)?;
            println!("{}", spec);
            for (position, layer) in spec.layers().iter().enumerate() {
                println!("  {}: {} (tag {})", position, layer, layer.kind().tag());
            }
            Ok(())
        }
        Commands::Create {
            inode,
            generation,
            spec,
        } => {
            let session = Session::open(&cli.config)?;
            let spec = spec.unwrap_or_else(|| session.config.default_layer_spec.clone());
            let spec = BlockLayerSpec::parse(&spec)?;

            let blockset = Blockset::build(&spec, Arc::clone(&session.store))?;
            let version = session.save(inode, &blockset, 0).await?;

            println!(
                "Created blockset '{}' for inode {} (generation {}, version {})",
                spec,
                inode,
                generation,
                version
            );
            Ok(())
        }
        Commands::Put {
            inode,
            generation,
            index,
            file,
        } => {
            let session = Session::open(&cli.config)?;
            let data = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;

            let (blockset, version) = session.load(inode).await?;
            let writer = InodeRef::new(inode, generation);
            blockset.put_block(&session.ctx, writer, index, &data).await?;
            let version = session.save(inode, &blockset, version).await?;

            println!(
                "Wrote {} to block {} of inode {} (version {})",
                format_bytes(data.len() as u64),
                index,
                inode,
                version
            );
            Ok(())
        }
        Commands::Get {
            inode,
            index,
            output,
        } => {
            let session = Session::open(&cli.config)?;
            let (blockset, version) = session.load(inode).await?;
            let data = blockset.get_block(&session.ctx, index).await?;
            std::fs::write(&output, &data)?;

            // Reads may have repaired replicas
            session.save(inode, &blockset, version).await?;

            println!(
                "Read {} from block {} of inode {} into {:?}",
                format_bytes(data.len() as u64),
                index,
                inode,
                output
            );
            Ok(())
        }
        Commands::Inspect { inode } => {
            let session = Session::open(&cli.config)?;
            let (blockset, version) = session.load(inode).await?;
            let encoded = blockset.marshal_to_wire().await?;

            println!("Blockset for inode {}:", inode);
            println!("  Layer spec: {}", blockset.spec());
            println!("  Version: {}", version);
            println!("  Blocks: {}", blockset.len());
            println!("  Indices: {:?}", blockset.indices());
            println!("  Stored blocks: {}", blockset.block_ids().len());
            let writers: Vec<String> = blockset.live_inodes().iter().map(|w| w.to_string()).collect();
            println!("  Writers: {}", writers.join(", "));
            println!("  Encoded size: {}", format_bytes(encoded.len() as u64));
            Ok(())
        }
        Commands::Scrub { inode, quick } => {
            let session = Session::open(&cli.config)?;
            let (blockset, version) = session.load(inode).await?;
            let config = if quick {
                ScrubConfig::quick()
            } else {
                ScrubConfig::full()
            };

            let report = BlocksetScrubber::new()
                .scrub(&session.ctx, &blockset, config)
                .await;
            session.save(inode, &blockset, version).await?;

            println!("Scrub of inode {}:", inode);
            println!("  Blocks checked: {}", report.stats.indices_checked);
            println!("  Bytes checked: {}", format_bytes(report.stats.bytes_checked));
            println!("  Issues: {}", report.stats.total_issues());
            for issue in &report.issues {
                println!(
                    "  [{:?}] block {}: {:?} - {}",
                    issue.severity, issue.index, issue.issue_type, issue.description
                );
            }
            if report.stats.cancelled {
                println!("  Scrub was interrupted before completion");
            }
            Ok(())
        }
        Commands::Version => {
            println!("layerfs v{}", env!("CARGO_PKG_VERSION"));
            println!("Layered, replicated block storage for inodes");
            Ok(())
        }
    }
}

/// Format bytes in a human-readable format
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["layerfs", "parse-spec", "--spec", "crc,base"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "layerfs", "put", "--inode", "3", "--index", "0", "--file", "data.bin",
        ])
        .unwrap();
        match cli.command {
            Commands::Put {
                inode,
                generation,
                index,
                ..
            } => {
                assert_eq!((inode, generation, index), (3, 1, 0));
            }
            _ => panic!("Expected Put command"),
        }
    }

    #[test]
    fn test_version_command() {
        let cli = Cli::try_parse_from(["layerfs", "version"]).unwrap();
        assert!(matches!(cli.command, Commands::Version));
        assert_eq!(cli.config, "config/layerfs.yaml");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
    }
}
