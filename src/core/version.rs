use crate::error::{Result, UpdateError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, info_span, warn, Span};

/// Build installed on this machine, written after every successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(rename = "BuildNumber")]
    pub build_number: u64,
    #[serde(rename = "InstallationDate")]
    pub installed_at: DateTime<Local>,
}

impl VersionRecord {
    pub fn new(build_number: u64) -> Self {
        Self {
            build_number,
            installed_at: Local::now(),
        }
    }
}

/// Persistence of the [`VersionRecord`].
pub trait VersionStore: Send + Sync {
    /// Reads the record. Missing or unreadable records read as `None`.
    fn load(&self) -> Option<VersionRecord>;

    fn save(&self, record: &VersionRecord) -> Result<()>;
}

/// Stores the record as a JSON document on disk.
pub struct FileVersionStore {
    path: PathBuf,
    span: Span,
}

impl FileVersionStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            span: info_span!("version_store"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn decode(content: &str) -> Result<VersionRecord> {
        serde_json::from_str(content)
            .map_err(|e| UpdateError::parse(format!("malformed version record: {e}")))
    }

    pub fn encode(record: &VersionRecord) -> Result<String> {
        Ok(serde_json::to_string_pretty(record)?)
    }
}

impl VersionStore for FileVersionStore {
    fn load(&self) -> Option<VersionRecord> {
        let _guard = self.span.enter();

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Unable to read '{}'. {}", self.path.display(), e);
                return None;
            }
        };

        match Self::decode(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                info!("Version file '{}' is malformed. {}", self.path.display(), e);
                None
            }
        }
    }

    fn save(&self, record: &VersionRecord) -> Result<()> {
        let _guard = self.span.enter();

        if let Some(parent) = self.path.parent() {
            crate::utils::fs::ensure_dir_exists(parent)?;
        }

        // Write beside the target and rename so a crash never leaves half a record.
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, Self::encode(record)?)
            .map_err(|e| UpdateError::filesystem(&temp_path, e))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| UpdateError::filesystem(&self.path, e))?;

        info!("Registered build {}", record.build_number);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory store remembering every save.
    #[derive(Default)]
    pub struct MemoryVersionStore {
        pub current: Mutex<Option<VersionRecord>>,
        pub saves: Mutex<Vec<VersionRecord>>,
    }

    impl MemoryVersionStore {
        pub fn at_build(build_number: u64) -> Self {
            Self {
                current: Mutex::new(Some(VersionRecord::new(build_number))),
                saves: Mutex::new(Vec::new()),
            }
        }

        pub fn save_count(&self) -> usize {
            self.saves.lock().unwrap().len()
        }
    }

    impl VersionStore for MemoryVersionStore {
        fn load(&self) -> Option<VersionRecord> {
            self.current.lock().unwrap().clone()
        }

        fn save(&self, record: &VersionRecord) -> Result<()> {
            *self.current.lock().unwrap() = Some(record.clone());
            self.saves.lock().unwrap().push(record.clone());
            Ok(())
        }
    }
}
