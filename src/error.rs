use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UpdateError>;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("Download failed for {url}: {message}")]
    Download { url: String, message: String },

    #[error("Download of {url} was aborted")]
    Aborted { url: String },

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Extraction failed for {path}: {message}")]
    Extraction { path: PathBuf, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Process control error: {message}")]
    Process { message: String },

    #[error("Update worker error: {message}")]
    Worker { message: String },

    #[error("Update was cancelled")]
    Cancelled,

    #[error("Home directory not found")]
    HomeDirectoryNotFound,
}

impl From<reqwest::Error> for UpdateError {
    fn from(error: reqwest::Error) -> Self {
        UpdateError::Network {
            url: error
                .url()
                .map(|url| url.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: error.to_string(),
        }
    }
}

impl From<regex::Error> for UpdateError {
    fn from(error: regex::Error) -> Self {
        UpdateError::Parse {
            message: error.to_string(),
        }
    }
}

impl From<semver::Error> for UpdateError {
    fn from(error: semver::Error) -> Self {
        UpdateError::Parse {
            message: error.to_string(),
        }
    }
}

impl UpdateError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        UpdateError::Config {
            message: message.into(),
        }
    }

    pub fn parse<S: Into<String>>(message: S) -> Self {
        UpdateError::Parse {
            message: message.into(),
        }
    }

    pub fn network<U: Into<String>, S: Into<String>>(url: U, message: S) -> Self {
        UpdateError::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn extraction<S: Into<String>>(path: &std::path::Path, message: S) -> Self {
        UpdateError::Extraction {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    pub fn process<S: Into<String>>(message: S) -> Self {
        UpdateError::Process {
            message: message.into(),
        }
    }

    /// Wraps an IO error with the path it happened on.
    pub fn filesystem(path: &std::path::Path, source: std::io::Error) -> Self {
        UpdateError::Filesystem {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }
}
