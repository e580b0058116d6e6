/// Integrity checks for the persisted TDLib database.
///
/// TDLib keeps its session in a binlog plus an SQLite file inside the
/// database directory. A truncated binlog or an SQLite file with a bad
/// header leaves the client stuck, so the login flow checks for both and
/// moves a damaged directory aside before reconnecting.
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tracing::{info, warn};

const BINLOG_FILES: &[&str] = &["td.binlog", "td_test.binlog"];
const SQLITE_FILE: &str = "db.sqlite";
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Result of an integrity check.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseHealth {
    /// No database yet (first login)
    Missing,
    Healthy,
    Corrupt(String),
}

impl DatabaseHealth {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, DatabaseHealth::Corrupt(_))
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseGuard {
    dir: PathBuf,
}

impl DatabaseGuard {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Inspects the database directory without modifying it.
    pub async fn check(&self) -> DatabaseHealth {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return DatabaseHealth::Missing;
        }

        for name in BINLOG_FILES {
            let path = self.dir.join(name);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() == 0 => {
                    return DatabaseHealth::Corrupt(format!("{name} is empty"));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return DatabaseHealth::Corrupt(format!("{name} unreadable: {e}")),
            }
        }

        let sqlite = self.dir.join(SQLITE_FILE);
        match tokio::fs::File::open(&sqlite).await {
            Ok(mut file) => {
                let mut header = [0u8; 16];
                match file.read_exact(&mut header).await {
                    Ok(_) if &header == SQLITE_HEADER => {}
                    Ok(_) => return DatabaseHealth::Corrupt(format!("{SQLITE_FILE} has a bad header")),
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        // An empty file is what SQLite creates before the first write
                        let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
                        if len > 0 {
                            return DatabaseHealth::Corrupt(format!("{SQLITE_FILE} is truncated"));
                        }
                    }
                    Err(e) => return DatabaseHealth::Corrupt(format!("{SQLITE_FILE} unreadable: {e}")),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return DatabaseHealth::Corrupt(format!("{SQLITE_FILE} unreadable: {e}")),
        }

        DatabaseHealth::Healthy
    }

    /// Moves the database directory aside and recreates it empty.
    /// Returns where the old directory went, if there was one.
    pub async fn reset(&self) -> std::io::Result<Option<PathBuf>> {
        let backup = if tokio::fs::try_exists(&self.dir).await? {
            let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%3f");
            let name = match self.dir.file_name() {
                Some(n) => format!("{}.corrupt-{stamp}", n.to_string_lossy()),
                None => format!("db.corrupt-{stamp}"),
            };
            let target = self.dir.with_file_name(name);
            tokio::fs::rename(&self.dir, &target).await?;
            warn!("Moved TDLib database to {}", target.display());
            Some(target)
        } else {
            None
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        info!("TDLib database reset at {}", self.dir.display());
        Ok(backup)
    }
}
