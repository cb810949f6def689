use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub vault_home: PathBuf,
    pub data_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub sources_file: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<VaultPaths> {
    let vault_home = match env::var("VAULT_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join("chat-vault"),
    };
    Ok(VaultPaths::under(vault_home))
}

impl VaultPaths {
    /// Lay out every runtime path below `vault_home`, honouring per-path env overrides.
    pub fn under(vault_home: PathBuf) -> Self {
        let data_dir = env_or_default_path("VAULT_DATA_DIR", vault_home.join("data"));
        let downloads_dir =
            env_or_default_path("VAULT_DOWNLOADS_DIR", vault_home.join("downloads"));
        let logs_dir = env_or_default_path("VAULT_LOGS_DIR", vault_home.join("logs"));
        let state_dir = env_or_default_path("VAULT_STATE_DIR", vault_home.join("state"));
        let sources_file =
            env_or_default_path("VAULT_SOURCES_FILE", vault_home.join("sources.json"));

        Self {
            vault_home,
            data_dir,
            downloads_dir,
            logs_dir,
            state_dir,
            sources_file,
        }
    }

    pub fn source_data_dir(&self, source_id: &str) -> PathBuf {
        self.data_dir.join(source_id)
    }

    pub fn source_downloads_dir(&self, source_id: &str) -> PathBuf {
        self.downloads_dir.join(source_id)
    }

    pub fn archive_db(&self, source_id: &str) -> PathBuf {
        self.source_data_dir(source_id).join("messages.db")
    }

    /// Batch left behind by an interrupted cycle; appended to, never replaced.
    pub fn pending_batch(&self, source_id: &str) -> PathBuf {
        self.source_data_dir(source_id)
            .join(format!("{source_id}_chat.json"))
    }

    /// Fresh tool output for the current cycle.
    pub fn export_batch(&self, source_id: &str) -> PathBuf {
        self.source_data_dir(source_id)
            .join(format!("{source_id}_chat_temp.json"))
    }

    pub fn resync_batch(&self, source_id: &str) -> PathBuf {
        self.source_data_dir(source_id)
            .join(format!("{source_id}_resync_temp.json"))
    }

    pub fn cleanup_checkpoint(&self, source_id: &str) -> PathBuf {
        self.source_data_dir(source_id)
            .join("cleanup.checkpoint.json")
    }

    pub fn cleanup_snapshot(&self, source_id: &str) -> PathBuf {
        self.source_data_dir(source_id).join("cleanup.job.json")
    }

    /// Presence asks a cleanup running in another process to stop.
    pub fn cleanup_stop_request(&self, source_id: &str) -> PathBuf {
        self.source_data_dir(source_id).join("cleanup.stop")
    }

    pub fn workers_marker(&self) -> PathBuf {
        self.state_dir.join("workers.lock")
    }

    pub fn cleanup_lock(&self) -> PathBuf {
        self.state_dir.join("cleanup.lock")
    }
}

/// Join `relative` onto `base` and refuse anything that escapes it.
pub fn contained_join(base: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    if relative.trim().is_empty() || rel.is_absolute() {
        return None;
    }
    let mut out = base.to_path_buf();
    for part in rel.components() {
        match part {
            std::path::Component::Normal(seg) => out.push(seg),
            std::path::Component::CurDir => {}
            _ => return None,
        }
    }
    if out == base {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::{VaultPaths, contained_join};
    use std::path::{Path, PathBuf};

    #[test]
    fn per_source_paths_live_under_data_dir() {
        let paths = VaultPaths::under(PathBuf::from("/srv/vault"));
        assert_eq!(
            paths.archive_db("42"),
            PathBuf::from("/srv/vault/data/42/messages.db")
        );
        assert_eq!(
            paths.pending_batch("42"),
            PathBuf::from("/srv/vault/data/42/42_chat.json")
        );
    }

    #[test]
    fn contained_join_rejects_escapes() {
        let base = Path::new("/srv/vault/data");
        assert_eq!(
            contained_join(base, "42"),
            Some(PathBuf::from("/srv/vault/data/42"))
        );
        assert_eq!(contained_join(base, "../etc"), None);
        assert_eq!(contained_join(base, "/etc"), None);
        assert_eq!(contained_join(base, ""), None);
        assert_eq!(contained_join(base, "."), None);
    }
}
