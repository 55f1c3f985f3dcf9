// Distributed backup peer: joins the control, backup and restore channels and
// serves the protocol until Ctrl+C/SIGTERM or a channel failure.

mod channel;
mod config;
mod peer;
mod pool;
mod request;
mod status;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::peer::{Peer, PeerSettings};

#[derive(Parser, Debug)]
#[command(name = "dbs-peer", version, about = "Distributed backup peer")]
struct Args {
    /// Config file (default: ~/.config/dbs/config.toml, /etc/dbs/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    id: Option<u32>,

    #[arg(long)]
    protocol_version: Option<String>,

    /// Control channel, address:port.
    #[arg(long)]
    mc: Option<String>,

    /// Backup data channel, address:port.
    #[arg(long)]
    mdb: Option<String>,

    /// Restore data channel, address:port.
    #[arg(long)]
    mdr: Option<String>,

    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Run once after start-up; the peer keeps serving afterwards.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Back up a file with the given desired replication degree (1-9).
    Backup {
        path: PathBuf,
        #[arg(value_parser = config::parse_degree)]
        degree: u8,
    },
    /// Restore a file this peer backed up into <storage dir>/restored.
    Restore { path: PathBuf },
    /// Delete every replica of a file this peer backed up.
    Delete { path: PathBuf },
    /// Limit the space offered to other peers, in bytes.
    Reclaim { bytes: u64 },
    /// Print backed-up files and stored replicas.
    State,
}

impl Args {
    fn apply(&self, c: &mut config::Config) {
        if let Some(id) = self.id {
            c.peer_id = id;
        }
        if let Some(v) = &self.protocol_version {
            c.protocol_version = v.clone();
        }
        if let Some(mc) = &self.mc {
            c.mc = mc.clone();
        }
        if let Some(mdb) = &self.mdb {
            c.mdb = mdb.clone();
        }
        if let Some(mdr) = &self.mdr {
            c.mdr = mdr.clone();
        }
        if let Some(dir) = &self.storage_dir {
            c.storage_dir = Some(dir.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    args.apply(&mut cfg);
    let settings = PeerSettings::from_config(&cfg)?;

    let (peer, mut loops) = Peer::start(settings).await?;
    if let Some(command) = args.command.clone() {
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = run_command(&peer, command).await {
                error!(error = %e, "command failed");
            }
        });
    }

    let result = tokio::select! {
        r = shutdown_signal() => {
            info!("shutting down");
            r
        }
        Some(joined) = loops.join_next() => match joined {
            Ok(Ok(())) => Err(anyhow::anyhow!("receive loop stopped")),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
    };
    if let Err(e) = peer.save() {
        error!(error = %e, "failed to save metadata");
    }
    result
}

async fn run_command(peer: &Arc<Peer>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Backup { path, degree } => {
            let report = peer.backup(&path, degree).await?;
            println!(
                "backed up {} as {} ({} chunks, degree {})",
                path.display(),
                report.file_id,
                report.chunk_count,
                report.replication_degree
            );
        }
        Command::Restore { path } => {
            let out = peer.restore(&path).await?;
            println!("restored {} to {}", path.display(), out.display());
        }
        Command::Delete { path } => {
            let file_id = peer.delete(&path).await?;
            println!("deleted {} ({})", path.display(), file_id);
        }
        Command::Reclaim { bytes } => {
            let evicted = peer.reclaim(bytes).await?;
            println!("capacity set to {bytes} bytes, {} chunks evicted", evicted.len());
        }
        Command::State => println!("{}", peer.status()),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "dbs-peer",
            "--id",
            "4",
            "--mdb",
            "230.0.0.2:4447",
            "backup",
            "/tmp/file.txt",
            "3",
        ]);
        let mut c = config::Config::default();
        args.apply(&mut c);
        assert_eq!(c.peer_id, 4);
        assert_eq!(c.mdb, "230.0.0.2:4447");
        assert_eq!(c.mc, config::Config::default().mc);
        assert!(matches!(args.command, Some(Command::Backup { degree: 3, .. })));
    }

    #[test]
    fn degree_out_of_range_is_rejected() {
        assert!(Args::try_parse_from(["dbs-peer", "backup", "/tmp/f", "12"]).is_err());
        assert!(Args::try_parse_from(["dbs-peer", "state"]).is_ok());
    }
}
