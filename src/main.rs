// coordctl: inspect and repair the shared coordination state kept in a
// file-backend synch directory.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use crawl_coord::{CoordinationConfig, CoordinationResult, LockSystem, ServiceCleanup};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    name = "coordctl",
    about = "Inspect crawler coordination state",
    long_about = r#"Inspect crawler coordination state

Examples:
    # List the services registered under a type and whether they are alive
    coordctl --synch-dir /var/lib/crawler/synch services AGENT

    # Unregister every inactive service of a type
    coordctl --synch-dir /var/lib/crawler/synch cleanup AGENT

Logging:
    Use the RUST_LOG environment variable to configure the desired logging level.
"#,
    version
)]
struct Cli {
    /// Synch directory shared by the coordinating processes
    #[clap(long, env = "COORD_SYNCH_DIR")]
    synch_dir: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered services of a type
    Services { service_type: String },
    /// Unregister the inactive services of a type
    Cleanup { service_type: String },
    /// Show, set or clear a global flag
    Flag {
        name: String,
        #[clap(long, conflicts_with = "clear")]
        set: bool,
        #[clap(long)]
        clear: bool,
    },
    /// Show, replace or delete a shared data blob
    Data {
        name: String,
        /// New contents, as UTF-8 text
        #[clap(long, conflicts_with = "delete")]
        write: Option<String>,
        #[clap(long)]
        delete: bool,
    },
}

/// Nothing to release beyond the registration itself
struct RegistrationOnly;

impl ServiceCleanup for RegistrationOnly {
    fn clean_up_service(&self, service_name: &str) -> CoordinationResult<()> {
        info!(service_name, "unregistering inactive service");
        Ok(())
    }

    fn clean_up_all_services(&self) -> CoordinationResult<()> {
        Ok(())
    }

    fn cluster_init(&self) -> CoordinationResult<()> {
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if !cli.synch_dir.is_dir() {
        bail!("synch directory {} does not exist", cli.synch_dir.display());
    }
    let config = CoordinationConfig::builder()
        .synch_directory(&cli.synch_dir)
        .build()?;
    let system = LockSystem::open(&config).context("opening coordination backend")?;
    let mut lm = system.session();

    match cli.command {
        Command::Services { service_type } => {
            for name in lm.list_registered_services(&service_type)? {
                let active = lm.check_service_active(&service_type, &name)?;
                let data_len = lm
                    .retrieve_service_data(&service_type, &name)?
                    .map_or(0, |data| data.len());
                println!(
                    "{name}\t{}\t{data_len} bytes",
                    if active { "active" } else { "inactive" }
                );
            }
        }
        Command::Cleanup { service_type } => {
            let mut removed = 0usize;
            while !lm.cleanup_inactive_service(&service_type, &RegistrationOnly)? {
                removed += 1;
            }
            println!("removed {removed} inactive services");
        }
        Command::Flag { name, set, clear } => {
            if set {
                lm.set_global_flag(&name)?;
            } else if clear {
                lm.clear_global_flag(&name)?;
            }
            println!("{name}: {}", lm.check_global_flag(&name)?);
        }
        Command::Data {
            name,
            write,
            delete,
        } => {
            if delete {
                lm.write_data(&name, None)?;
            } else if let Some(text) = write {
                lm.write_data(&name, Some(text.as_bytes()))?;
            }
            match lm.read_data(&name)? {
                Some(data) => println!("{}", String::from_utf8_lossy(&data)),
                None => println!("(no data)"),
            }
        }
    }
    Ok(())
}
