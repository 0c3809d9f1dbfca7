//! Generates artifacts by running an external command.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use genstore_service::config::Config;
use genstore_service::{Backend, CacheDir};
use tempfile::NamedTempFile;

/// A [`Backend`] running the configured generator command on a cache miss.
///
/// The object id is appended to the command line, and the standard output of the command
/// becomes the artifact. The command fails the generation by exiting with a non-zero status.
#[derive(Debug)]
pub struct CommandBackend {
    dir: CacheDir,
    command: Vec<String>,
}

impl CommandBackend {
    pub fn new(dir: CacheDir, command: Vec<String>) -> Self {
        Self { dir, command }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let dir =
            CacheDir::from_config("objects", config).context("failed to create cache directory")?;
        Ok(Self::new(dir, config.generator.command.clone()))
    }

    pub fn dir(&self) -> &CacheDir {
        &self.dir
    }
}

impl Backend for CommandBackend {
    type Info = ();

    fn make_filename(&self, id: &str) -> PathBuf {
        self.dir.object_path(id)
    }

    fn new_temp_file(&self) -> io::Result<NamedTempFile> {
        self.dir.tempfile()
    }

    fn generate(&self, sink: &mut dyn Write, id: &str, _info: &()) -> io::Result<()> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "no generator command configured",
            )
        })?;

        tracing::debug!(id, program, "Running generator");
        let mut child = Command::new(program)
            .args(args)
            .arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, sink),
            None => Err(io::Error::other("generator output not captured")),
        };
        if copied.is_err() {
            // nobody is reading anymore, don't wait for the command to finish on its own
            let _ = child.kill();
        }

        let status = child.wait()?;
        let copied = copied?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "generator for {id} {status} after {copied} bytes"
            )));
        }
        Ok(())
    }
}
