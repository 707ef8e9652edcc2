use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use montage::prelude::*;
use montage::protocol::Message;

#[derive(Parser)]
#[command(name = "montage")]
#[command(about = "Crash-safe two-phase commit of collages assembled from remote sources")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator: serve, and resume unfinished transactions
    Coordinator {
        /// TOML file with node settings; flags take precedence
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to accept protocol messages on
        #[arg(long)]
        listen: Option<String>,
        /// Participant address as NAME=HOST:PORT (repeatable)
        #[arg(long = "peer", value_parser = parse_peer)]
        peers: Vec<(NodeId, String)>,
        /// Directory for the recovery log
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Directory committed collages are written to
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Vote deadline in milliseconds
        #[arg(long)]
        vote_timeout_ms: Option<u64>,
        /// Decision re-broadcast interval in milliseconds
        #[arg(long)]
        retry_ms: Option<u64>,
    },
    /// Run a participant: recover unfinished transactions, then serve
    Participant {
        /// This participant's node name
        #[arg(long)]
        id: String,
        /// TOML file with node settings; flags take precedence
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to accept protocol messages on
        #[arg(long)]
        listen: Option<String>,
        /// Coordinator address
        #[arg(long)]
        coordinator: Option<String>,
        /// Coordinator node name
        #[arg(long, default_value = DEFAULT_COORDINATOR_ID)]
        coordinator_id: String,
        /// Directory for the recovery log
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Directory holding this node's sources
        #[arg(long)]
        source_dir: Option<PathBuf>,
        /// How to vote once the requested sources are reserved
        #[arg(long, value_enum, default_value_t = VoteMode::Prompt)]
        vote: VoteMode,
    },
    /// Ask a running coordinator to commit a collage
    Submit {
        /// Coordinator address
        #[arg(long)]
        coordinator: String,
        /// Coordinator node name
        #[arg(long, default_value = DEFAULT_COORDINATOR_ID)]
        coordinator_id: String,
        /// Collage name; also the transaction id
        #[arg(long)]
        id: String,
        /// File holding the collage bytes
        #[arg(long)]
        payload: PathBuf,
        /// Source as NODE:RESOURCE (repeatable)
        #[arg(long = "source", required = true)]
        sources: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VoteMode {
    /// Approve every request
    Always,
    /// Reject every request
    Never,
    /// Ask on the terminal
    Prompt,
}

fn parse_peer(raw: &str) -> std::result::Result<(NodeId, String), String> {
    match raw.split_once('=') {
        Some((name, addr)) if !name.is_empty() && !addr.is_empty() => {
            Ok((NodeId::from(name), addr.to_string()))
        }
        _ => Err(format!("expected NAME=HOST:PORT, got `{}`", raw)),
    }
}

/// Asks the operator on stdin, one request at a time.
#[derive(Default)]
struct PromptDecider {
    terminal: Mutex<()>,
}

impl VoteDecider for PromptDecider {
    fn decide(
        &self,
        transaction: &TransactionId,
        payload: &[u8],
        resources: &[ResourceId],
    ) -> Decision {
        let _terminal = self.terminal.lock();
        let names: Vec<&str> = resources.iter().map(ResourceId::as_str).collect();
        eprint!(
            "Approve {} ({} bytes) using [{}]? [y/n] ",
            transaction,
            payload.len(),
            names.join(", ")
        );
        let _ = io::stderr().flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return Decision::Abort;
        }
        Decision::from(matches!(answer.trim(), "y" | "Y" | "yes"))
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<NodeConfig> {
    match path {
        Some(path) => Ok(NodeConfig::from_file(path)?),
        None => Ok(NodeConfig::default()),
    }
}

fn serve_forever() -> ! {
    loop {
        thread::park();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Coordinator {
            config,
            listen,
            peers,
            state_dir,
            output_dir,
            vote_timeout_ms,
            retry_ms,
        } => {
            let mut node = load_config(config.as_ref())?;
            node.peers.extend(peers);
            if let Some(ms) = vote_timeout_ms {
                node.coordinator.vote_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = retry_ms {
                node.coordinator.ack_retry_interval = Duration::from_millis(ms);
            }
            let listen = listen.or(node.listen).context("--listen is required")?;
            let state_dir = state_dir.or(node.state_dir).context("--state-dir is required")?;
            let output_dir = output_dir
                .or(node.data_dir)
                .context("--output-dir is required")?;
            if node.peers.is_empty() {
                bail!("at least one --peer is required");
            }

            let network = Arc::new(TcpNetwork::new(
                node.coordinator.node_id.clone(),
                node.peers.clone(),
            )?);
            let coordinator = Coordinator::new(
                node.coordinator.clone(),
                network.clone(),
                Arc::new(FileLog::<CoordinatorRecord>::open(&state_dir)?),
                Arc::new(DirectoryArtifactSink::new(&output_dir)?),
            );
            let addr = network.serve(&listen, coordinator.clone())?;
            info!(
                "Coordinator {} listening on {}, writing to {}",
                node.coordinator.node_id,
                addr,
                output_dir.display()
            );

            for (id, decision) in coordinator.recover()? {
                info!("Recovered {}: {}", id, decision);
            }
            serve_forever()
        }
        Commands::Participant {
            id,
            config,
            listen,
            coordinator,
            coordinator_id,
            state_dir,
            source_dir,
            vote,
        } => {
            let mut node = load_config(config.as_ref())?;
            let coordinator_id = NodeId::from(coordinator_id);
            if let Some(addr) = coordinator {
                node.peers.insert(coordinator_id.clone(), addr);
            }
            if !node.peers.contains_key(&coordinator_id) {
                bail!("--coordinator is required");
            }
            let listen = listen.or(node.listen).context("--listen is required")?;
            let state_dir = state_dir.or(node.state_dir).context("--state-dir is required")?;
            let source_dir = source_dir
                .or(node.data_dir)
                .context("--source-dir is required")?;

            let decider: Arc<dyn VoteDecider> = match vote {
                VoteMode::Always => Arc::new(AlwaysCommit),
                VoteMode::Never => Arc::new(AlwaysAbort),
                VoteMode::Prompt => Arc::new(PromptDecider::default()),
            };
            let config = ParticipantConfig {
                node_id: NodeId::from(id),
                coordinator_id,
            };
            let network = Arc::new(TcpNetwork::new(config.node_id.clone(), node.peers)?);
            let participant = Participant::new(
                config.clone(),
                network.clone(),
                Arc::new(FileLog::<ParticipantRecord>::open(&state_dir)?),
                Arc::new(DirectorySourceStore::new(&source_dir)),
                decider,
            );

            // Locks must be back in place before new vote requests are accepted.
            let resumed = participant.recover()?;
            let addr = network.serve(&listen, participant)?;
            info!(
                "Participant {} listening on {} ({} recovered), sources in {}",
                config.node_id,
                addr,
                resumed,
                source_dir.display()
            );
            serve_forever()
        }
        Commands::Submit {
            coordinator,
            coordinator_id,
            id,
            payload,
            sources,
        } => {
            let coordinator_id = NodeId::from(coordinator_id);
            let payload = std::fs::read(&payload)
                .with_context(|| format!("cannot read {}", payload.display()))?;
            let transaction = TransactionId::from(id.as_str());
            // Fail here rather than inside the coordinator.
            parse_sources(&id, &sources)?;
            validate_artifact_name(&transaction)?;

            let network = TcpNetwork::new("submit", [(coordinator_id.clone(), coordinator)])?;
            let message = Message::Submit {
                transaction,
                payload,
                sources,
            };
            network.send_and_wait(&coordinator_id, message.encode()?)?;
            info!("Submitted {}", id);
            Ok(())
        }
    }
}
