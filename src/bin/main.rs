use anyhow::Result;
use clap::builder::RangedU64ValueParser;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;
use gridrun::{
    Collaborators, Decomposition, GlobalDomain, GlobalParameters, LocalGroup, exit_status,
    read_manifest, resolve_config_path, run_local,
};

#[derive(Parser)]
#[command(name = "gridrun")]
#[command(about = "Grid simulation lifecycle driver")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulation
    Run {
        /// Global parameter file (falls back to GRIDRUN_CONFIG, then ./gridrun.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of in-process workers
        #[arg(
            short,
            long,
            default_value_t = 1,
            env = "GRIDRUN_WORKERS",
            value_parser = worker_count()
        )]
        workers: usize,
        /// Join the MPI world instead of spawning local workers
        #[cfg(feature = "mpi")]
        #[arg(long, default_value_t = false)]
        mpi: bool,
    },
    /// Print how the domain would be split across workers
    Partition {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, value_parser = worker_count())]
        workers: usize,
    },
    /// Print a checkpoint manifest
    InspectCheckpoint {
        path: PathBuf,
    },
}

fn worker_count() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gridrun=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workers,
            #[cfg(feature = "mpi")]
            mpi,
        } => {
            #[cfg(feature = "mpi")]
            {
                if mpi {
                    let outcome = gridrun::start_worker(
                        gridrun::MpiEndpoint,
                        config,
                        &Collaborators::reference,
                    );
                    return Ok(ExitCode::from(outcome.exit_code as u8));
                }
            }

            let group = LocalGroup::new(workers);
            info!("Starting {} local worker(s)", group.size());
            let outcomes = run_local(group, config, Arc::new(Collaborators::reference)).await;
            return Ok(ExitCode::from(exit_status(&outcomes) as u8));
        }
        Commands::Partition { config, workers } => {
            let path = resolve_config_path(config)?;
            let params = GlobalParameters::from_file(&path)?;
            let domain = GlobalDomain::from_config(&params.domain)?;
            let decomposition =
                Decomposition::compute(&domain, workers, params.domain.decomposition)?;

            println!(
                "{} active cells of {}x{}, {} worker(s), {:?}",
                domain.ncells(),
                domain.nx,
                domain.ny,
                workers,
                decomposition.strategy
            );
            println!("fingerprint {}", decomposition.fingerprint);
            println!();
            println!("{:<6} {:<8} {:<8} {}", "RANK", "CELLS", "OFFSET", "FIRST CELLS");
            println!("{}", "-".repeat(60));
            for rank in 0..workers {
                let local = decomposition.local_domain(&domain, rank);
                let head: Vec<String> = local.cells.iter().take(8).map(|c| c.to_string()).collect();
                let more = if local.ncells() > 8 { " ..." } else { "" };
                println!(
                    "{:<6} {:<8} {:<8} {}{}",
                    rank,
                    decomposition.local_sizes[rank],
                    decomposition.offsets[rank],
                    head.join(","),
                    more
                );
            }
        }
        Commands::InspectCheckpoint { path } => {
            let manifest = read_manifest(&path)?;
            println!("Checkpoint: {}", path.display());
            println!("  Run:        {}", manifest.run_id);
            println!("  Timestep:   {}", manifest.timestep);
            println!("  Valid at:   {}", manifest.valid_at);
            println!("  Created:    {}", manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("  Workers:    {}", manifest.size);
            println!("  Cells:      {}", manifest.ncells);
            println!("  Variables:  {}", manifest.state_variables.join(", "));
            println!("  Partition:  {}", manifest.fingerprint);
            println!();
            println!("{:<6} {:<8} {:<40} {}", "RANK", "CELLS", "FILE", "SHA256");
            println!("{}", "-".repeat(100));
            for entry in &manifest.ranks {
                println!(
                    "{:<6} {:<8} {:<40} {}",
                    entry.rank, entry.ncells, entry.file, entry.sha256
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
