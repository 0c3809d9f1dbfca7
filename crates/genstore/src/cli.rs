//! Exposes the command line application.
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genstore_service::config::Config;
use genstore_service::{CacheEngine, WriteDestination, metrics};

use crate::backend::CommandBackend;
use crate::logging;

/// Genstore commands.
#[derive(Subcommand)]
enum Command {
    /// Write an object, generating it if it is not cached yet.
    Obtain {
        /// The id of the object.
        id: String,

        /// Write the object to this file instead of standard output.
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Remove an object from the cache.
    Remove {
        /// The id of the object.
        id: String,
    },

    /// Print the location of an object in the cache.
    Path {
        /// The id of the object.
        id: String,
    },

    /// Remove temporary files left behind by crashed generations.
    ///
    /// This must not run while other genstore processes are generating objects.
    ClearTmp,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "genstore", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(concat!("genstore@", env!("CARGO_PKG_VERSION")).into()),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure metrics")?;
    }

    let backend = CommandBackend::from_config(&config)?;

    match cli.command {
        Command::Obtain { id, output } => {
            let engine = CacheEngine::new(backend);
            let obtained = match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    let mut dest = WriteDestination(BufWriter::new(file));
                    engine.obtain_item(&mut dest, &id, ())
                }
                None => {
                    let mut dest = WriteDestination(io::stdout().lock());
                    engine.obtain_item(&mut dest, &id, ())
                }
            };
            obtained.with_context(|| format!("failed to obtain {id}"))?;
        }
        Command::Remove { id } => {
            CacheEngine::new(backend)
                .remove_item(&id)
                .with_context(|| format!("failed to remove {id}"))?;
        }
        Command::Path { id } => {
            println!("{}", backend.dir().object_path(&id).display());
        }
        Command::ClearTmp => {
            backend
                .dir()
                .clear_tmp()
                .context("failed to clear temporary files")?;
        }
    }

    Ok(())
}
