// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cryptattic_core::keyfile::KeyFile;
use cryptattic_core::repo::Repository;
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Transparent file encryption for version-controlled working trees", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a key and install the filter driver configuration.
    Init {
        #[arg(short = 'k', long = "key-name", value_name = "NAME")]
        key_name: Option<String>,
    },
    /// Generate a standalone key file.
    Keygen {
        keyfile: PathBuf,
    },
    /// Export the installed key file to a path.
    ExportKey {
        #[arg(short = 'k', long = "key-name", value_name = "NAME")]
        key_name: Option<String>,
        keyfile: PathBuf,
    },
    /// Install one or more key files and decrypt their bound paths.
    Unlock {
        keyfiles: Vec<PathBuf>,
    },
    /// Remove an installed key and re-encrypt its bound paths.
    Lock {
        #[arg(short = 'k', long = "key-name", value_name = "NAME")]
        key_name: Option<String>,
    },
    /// Report the encryption state of tracked paths.
    Status {
        #[arg(short = 'e', long = "encrypted-only")]
        encrypted_only: bool,
        #[arg(short = 'f', long = "fix")]
        fix: bool,
    },
    /// Internal: invoked by the host VCS on checkin.
    Clean {
        #[arg(long = "key-name", value_name = "NAME")]
        key_name: Option<String>,
    },
    /// Internal: invoked by the host VCS on checkout.
    Smudge {
        #[arg(long = "key-name", value_name = "NAME")]
        key_name: Option<String>,
    },
    /// Internal: invoked by the host VCS for diffs.
    Diff {
        path: PathBuf,
        #[arg(long = "key-name", value_name = "NAME")]
        key_name: Option<String>,
    },
}

fn git_executable() -> String {
    std::env::var("GIT_CRYPT_GIT_PATH").unwrap_or_else(|_| "git".to_string())
}

/// Walk upward from the current directory looking for a `.git` control
/// directory.
fn discover_control_dir() -> Result<PathBuf> {
    let mut dir = std::env::current_dir().context("reading current directory")?;
    loop {
        let candidate = dir.join(".git");
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            bail!("not inside a working tree (no .git directory found)");
        }
    }
}

fn open_repository() -> Result<Repository> {
    let control_dir = discover_control_dir()?;
    Ok(Repository::new(control_dir, git_executable()))
}

fn key_path_for(control_dir: &Path, key_name: Option<&str>) -> PathBuf {
    control_dir
        .join("git-crypt")
        .join("keys")
        .join(key_name.unwrap_or("default"))
}

fn load_installed_key_file(key_name: Option<&str>) -> Result<KeyFile> {
    let control_dir = discover_control_dir()?;
    let path = key_path_for(&control_dir, key_name);
    let bytes = std::fs::read(&path)
        .with_context(|| format!("reading installed key file at {}", path.display()))?;
    Ok(KeyFile::parse(&bytes)?)
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(cli.command)) {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Init { key_name } => {
            let repo = open_repository()?;
            repo.init(key_name.as_deref()).await?;
            info!("initialized key '{}'", key_name.as_deref().unwrap_or("default"));
            Ok(())
        }
        Commands::Keygen { keyfile } => {
            Repository::keygen(&keyfile)?;
            eprintln!("generated key file at {}", keyfile.display());
            Ok(())
        }
        Commands::ExportKey { key_name, keyfile } => {
            let repo = open_repository()?;
            repo.export_key(key_name.as_deref(), &keyfile)?;
            eprintln!("exported key to {}", keyfile.display());
            Ok(())
        }
        Commands::Unlock { keyfiles } => {
            if keyfiles.is_empty() {
                bail!("unlock without key files requires the asymmetric key-wrapping path, which is not supported");
            }
            let repo = open_repository()?;
            let summary = repo.unlock(&keyfiles).await?;
            eprintln!(
                "unlocked {} key(s), re-checked-out {} path(s)",
                summary.keys_installed.len(),
                summary.paths_touched
            );
            Ok(())
        }
        Commands::Lock { key_name } => {
            let repo = open_repository()?;
            let summary = repo.lock(key_name.as_deref()).await?;
            eprintln!("locked key '{}', re-checked-out {} path(s)", key_name.as_deref().unwrap_or("default"), summary.paths_touched);
            Ok(())
        }
        Commands::Status { encrypted_only, fix } => {
            if fix {
                eprintln!("warning: --fix is not implemented; reporting only");
            }
            let repo = open_repository()?;
            let entries = repo.status(encrypted_only).await?;
            for entry in entries {
                println!("{:?}\t{}", entry.binding, entry.path);
            }
            Ok(())
        }
        Commands::Clean { key_name } => {
            let key_file = load_installed_key_file(key_name.as_deref())?;
            let entry = key_file
                .latest()
                .context("no key installed for this path")?;
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            cryptattic_core::filter::clean(stdin.lock(), stdout.lock(), entry)?;
            Ok(())
        }
        Commands::Smudge { key_name } => {
            let key_file = load_installed_key_file(key_name.as_deref()).unwrap_or_default();
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            cryptattic_core::filter::smudge(stdin.lock(), stdout.lock(), &key_file)?;
            Ok(())
        }
        Commands::Diff { path, key_name } => {
            let key_file = load_installed_key_file(key_name.as_deref()).unwrap_or_default();
            let stdout = std::io::stdout();
            cryptattic_core::filter::diff(&path, stdout.lock(), &key_file)?;
            Ok(())
        }
    }
}
