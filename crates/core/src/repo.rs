// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Repository lifecycle: `init`, `unlock`, `lock`, `status`, `export-key`,
//! and `keygen`. Each operation shells out to the host VCS for
//! configuration and checkout, and manages the internal key directory.

use std::path::{Path, PathBuf};

use log::info;

use crate::attributes::{self, IndexEntry, KeyBinding};
use crate::error::RepoError;
use crate::keyfile::KeyFile;
use crate::process::ProcessChannel;

/// Host VCS checkout is invoked in batches of at most this many paths per
/// child-process call.
const CHECKOUT_BATCH_SIZE: usize = 100;

/// Summary returned by `unlock`/`lock`, for the caller to report to the user.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LifecycleSummary {
    pub keys_installed: Vec<String>,
    pub paths_touched: usize,
}

/// One entry in a `status` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub path: String,
    pub binding: KeyBinding,
}

pub struct Repository {
    control_dir: PathBuf,
    git_path: String,
}

impl Repository {
    /// `control_dir` is the host VCS's private control directory (e.g. the
    /// `.git` directory); `git_path` is the executable used to invoke the
    /// host VCS, overridable for test isolation.
    pub fn new(control_dir: PathBuf, git_path: String) -> Self {
        Self { control_dir, git_path }
    }

    fn keys_dir(&self) -> PathBuf {
        self.control_dir.join("git-crypt").join("keys")
    }

    fn key_path(&self, name: Option<&str>) -> PathBuf {
        self.keys_dir().join(name.unwrap_or("default"))
    }

    fn filter_name(name: Option<&str>) -> String {
        match name {
            None => "git-crypt".to_string(),
            Some(n) => format!("git-crypt-{n}"),
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<Vec<u8>, RepoError> {
        let channel = ProcessChannel::spawn_capturing_stderr(&self.git_path, args)?;
        Ok(channel.exchange(Vec::new()).await?)
    }

    /// Fail with [`RepoError::WorkingDirectoryDirty`] unless the working
    /// directory has no staged or unstaged modifications.
    pub async fn require_clean_working_directory(&self) -> Result<(), RepoError> {
        let output = self.run_git(&["status", "--porcelain"]).await?;
        if !output.is_empty() {
            return Err(RepoError::WorkingDirectoryDirty);
        }
        Ok(())
    }

    async fn list_tracked_entries(&self) -> Result<Vec<IndexEntry>, RepoError> {
        let output = self.run_git(&["ls-files", "--stage", "-z"]).await?;
        Ok(attributes::parse_index_listing(&output)?)
    }

    /// True when the host VCS is recent enough to support batch
    /// `check-attr --stdin`; policy threshold is version 1.8.5.
    async fn supports_batch_attr_query(&self) -> Result<bool, RepoError> {
        let output = self.run_git(&["--version"]).await?;
        let text = String::from_utf8_lossy(&output);
        Ok(parse_git_version(&text).map(|v| v >= (1, 8, 5)).unwrap_or(false))
    }

    async fn paths_bound_to(&self, name: Option<&str>) -> Result<Vec<String>, RepoError> {
        let entries = self.list_tracked_entries().await?;
        let batch = self.supports_batch_attr_query().await?;
        let bindings = attributes::resolve_bindings(&self.git_path, &entries, batch).await?;

        let target = match name {
            None => KeyBinding::Default,
            Some(n) => KeyBinding::Named(n.to_string()),
        };
        Ok(bindings
            .into_iter()
            .filter(|(_, binding)| *binding == target)
            .map(|(entry, _)| entry.path)
            .collect())
    }

    async fn install_filter_config(&self, name: Option<&str>) -> Result<(), RepoError> {
        let filter = Self::filter_name(name);
        let exe = std::env::current_exe()
            .map_err(RepoError::Io)?
            .to_string_lossy()
            .into_owned();
        let key_arg = match name {
            None => String::new(),
            Some(n) => format!(" --key-name={n}"),
        };

        let clean_cmd = format!("{exe} clean{key_arg}");
        let smudge_cmd = format!("{exe} smudge{key_arg}");
        let diff_cmd = format!("{exe} diff{key_arg}");

        self.run_git(&["config", &format!("filter.{filter}.clean"), &clean_cmd]).await?;
        self.run_git(&["config", &format!("filter.{filter}.smudge"), &smudge_cmd]).await?;
        self.run_git(&["config", &format!("filter.{filter}.required"), "true"]).await?;
        self.run_git(&["config", &format!("diff.{filter}.textconv"), &diff_cmd]).await?;
        Ok(())
    }

    async fn remove_filter_config(&self, name: Option<&str>) -> Result<(), RepoError> {
        let filter = Self::filter_name(name);
        // Unknown config sections are not an error to remove; ignore failures here.
        let _ = self.run_git(&["config", "--remove-section", &format!("filter.{filter}")]).await;
        let _ = self.run_git(&["config", "--remove-section", &format!("diff.{filter}")]).await;
        Ok(())
    }

    async fn touch_and_checkout(&self, paths: &[String]) -> Result<(), RepoError> {
        for path in paths {
            let full = self.repo_root_join(path);
            if full.exists() {
                filetime_touch(&full)?;
            }
        }
        for batch in paths.chunks(CHECKOUT_BATCH_SIZE) {
            let mut args: Vec<&str> = vec!["checkout", "--"];
            args.extend(batch.iter().map(|s| s.as_str()));
            self.run_git(&args).await?;
        }
        Ok(())
    }

    fn repo_root_join(&self, relative: &str) -> PathBuf {
        // The control directory is a child of the working tree root in the
        // common case; callers needing a different layout construct their
        // own Repository rooted appropriately.
        self.control_dir
            .parent()
            .map(|root| root.join(relative))
            .unwrap_or_else(|| PathBuf::from(relative))
    }

    /// Generate a new key file for `key_name`, install it, and register the
    /// filter driver configuration.
    pub async fn init(&self, key_name: Option<&str>) -> Result<(), RepoError> {
        self.require_clean_working_directory().await?;

        let path = self.key_path(key_name);
        if path.exists() {
            return Err(RepoError::AlreadyInitialized(key_name.unwrap_or("default").to_string()));
        }

        let key_file = crate::keyfile::KeyFile::generate(key_name.map(str::to_string))?;
        write_key_file_secure(&path, &key_file)?;

        self.install_filter_config(key_name).await?;
        info!("initialized key '{}'", key_name.unwrap_or("default"));
        Ok(())
    }

    /// Generate a standalone key file at `path`, unrelated to any installed
    /// repository key.
    pub fn keygen(path: &Path) -> Result<(), RepoError> {
        let key_file = crate::keyfile::KeyFile::generate(None)?;
        write_key_file_secure(path, &key_file)?;
        Ok(())
    }

    /// Copy the installed key file for `key_name` to `path`.
    pub fn export_key(&self, key_name: Option<&str>, path: &Path) -> Result<(), RepoError> {
        let installed = self.key_path(key_name);
        if !installed.exists() {
            return Err(RepoError::NotInitialized(key_name.unwrap_or("default").to_string()));
        }
        let key_file = load_key_file(&installed)?;
        write_key_file_secure(path, &key_file)?;
        Ok(())
    }

    /// Install each supplied key file under its embedded name, register
    /// filter configuration, and re-checkout every path newly bound to it.
    pub async fn unlock(&self, key_file_paths: &[PathBuf]) -> Result<LifecycleSummary, RepoError> {
        self.require_clean_working_directory().await?;

        let mut summary = LifecycleSummary::default();
        let mut all_paths = Vec::new();

        for path in key_file_paths {
            let key_file = load_key_file(path)?;
            let name = key_file.name().map(str::to_string);

            let internal_path = self.key_path(name.as_deref());
            write_key_file_secure(&internal_path, &key_file)?;
            self.install_filter_config(name.as_deref()).await?;
            summary.keys_installed.push(name.clone().unwrap_or_else(|| "default".to_string()));

            let bound_paths = self.paths_bound_to(name.as_deref()).await?;
            all_paths.extend(bound_paths);
        }

        all_paths.sort();
        all_paths.dedup();
        summary.paths_touched = all_paths.len();
        self.touch_and_checkout(&all_paths).await?;

        Ok(summary)
    }

    /// Remove the installed key for `key_name`, uninstall its filter
    /// configuration, and re-checkout its paths so they read back as
    /// ciphertext.
    pub async fn lock(&self, key_name: Option<&str>) -> Result<LifecycleSummary, RepoError> {
        self.require_clean_working_directory().await?;

        let path = self.key_path(key_name);
        if !path.exists() {
            return Err(RepoError::NotInitialized(key_name.unwrap_or("default").to_string()));
        }

        let bound_paths = self.paths_bound_to(key_name).await?;

        std::fs::remove_file(&path)?;
        self.remove_filter_config(key_name).await?;
        self.touch_and_checkout(&bound_paths).await?;

        Ok(LifecycleSummary {
            keys_installed: Vec::new(),
            paths_touched: bound_paths.len(),
        })
    }

    /// Enumerate tracked paths and their encryption state.
    pub async fn status(&self, encrypted_only: bool) -> Result<Vec<StatusEntry>, RepoError> {
        let entries = self.list_tracked_entries().await?;
        let batch = self.supports_batch_attr_query().await?;
        let bindings = attributes::resolve_bindings(&self.git_path, &entries, batch).await?;

        Ok(bindings
            .into_iter()
            .filter(|(_, binding)| !encrypted_only || *binding != KeyBinding::None)
            .map(|(entry, binding)| StatusEntry { path: entry.path, binding })
            .collect())
    }
}

fn write_key_file_secure(path: &Path, key_file: &crate::keyfile::KeyFile) -> Result<(), RepoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = key_file.serialize();
    std::fs::write(path, &bytes)?;
    set_owner_only_permissions(path)?;
    Ok(())
}

fn load_key_file(path: &Path) -> Result<KeyFile, RepoError> {
    let bytes = std::fs::read(path)?;
    Ok(KeyFile::parse(&bytes)?)
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn filetime_touch(path: &Path) -> Result<(), RepoError> {
    let now = std::time::SystemTime::now();
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(now)?;
    Ok(())
}

/// Parse `git version X.Y.Z...` into a comparable tuple, ignoring any
/// platform-specific suffix.
fn parse_git_version(text: &str) -> Option<(u32, u32, u32)> {
    let version_str = text.split_whitespace().find(|tok| tok.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))?;
    let mut parts = version_str.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_git_version_string() {
        assert_eq!(parse_git_version("git version 2.39.2"), Some((2, 39, 2)));
    }

    #[test]
    fn parses_git_version_with_platform_suffix() {
        assert_eq!(parse_git_version("git version 2.30.1.windows.1"), Some((2, 30, 1)));
    }

    #[test]
    fn rejects_unparseable_version_string() {
        assert_eq!(parse_git_version("not a version"), None);
    }

    #[test]
    fn filter_name_formats_default_and_named() {
        assert_eq!(Repository::filter_name(None), "git-crypt");
        assert_eq!(Repository::filter_name(Some("team-A")), "git-crypt-team-A");
    }

    #[test]
    fn key_path_layout() {
        let repo = Repository::new(PathBuf::from("/work/.git"), "git".to_string());
        assert_eq!(repo.key_path(None), PathBuf::from("/work/.git/git-crypt/keys/default"));
        assert_eq!(repo.key_path(Some("team-A")), PathBuf::from("/work/.git/git-crypt/keys/team-A"));
    }

    #[test]
    fn keygen_writes_owner_only_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exported.key");
        Repository::keygen(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let key_file = KeyFile::parse(&bytes).unwrap();
        assert!(key_file.is_filled());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
