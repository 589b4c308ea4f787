use crate::error::{Result, UpdateError};
use std::process::Command;
use tracing::{debug, info};

/// Lifecycle control of the application being updated.
pub trait TargetProcess: Send + Sync {
    fn is_running(&self) -> Result<bool>;

    /// Stops every running instance. Stopping an application that is not running
    /// succeeds.
    fn stop(&self) -> Result<()>;
}

/// Controls the target by executable name using the platform process tools.
#[derive(Debug, Clone)]
pub struct NamedProcess {
    name: String,
}

impl NamedProcess {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(windows)]
    fn image_name(&self) -> String {
        if self.name.to_lowercase().ends_with(".exe") {
            self.name.clone()
        } else {
            format!("{}.exe", self.name)
        }
    }

    fn tool(name: &str) -> Result<std::path::PathBuf> {
        which::which(name).map_err(|e| UpdateError::process(format!("'{name}' not found: {e}")))
    }
}

impl TargetProcess for NamedProcess {
    fn is_running(&self) -> Result<bool> {
        #[cfg(unix)]
        {
            let output = Command::new(Self::tool("pgrep")?)
                .args(["-x", &self.name])
                .output()
                .map_err(|e| UpdateError::process(format!("failed to run pgrep: {e}")))?;

            // pgrep exits 1 when nothing matched.
            match output.status.code() {
                Some(0) => Ok(true),
                Some(1) => Ok(false),
                code => Err(UpdateError::process(format!(
                    "pgrep exited with status {code:?}"
                ))),
            }
        }

        #[cfg(windows)]
        {
            let image = self.image_name();
            let output = Command::new(Self::tool("tasklist")?)
                .args(["/FI", &format!("IMAGENAME eq {image}"), "/NH"])
                .output()
                .map_err(|e| UpdateError::process(format!("failed to run tasklist: {e}")))?;

            let listing = String::from_utf8_lossy(&output.stdout).to_lowercase();
            Ok(listing.contains(&image.to_lowercase()))
        }
    }

    fn stop(&self) -> Result<()> {
        if !self.is_running()? {
            debug!("{} is not running", self.name);
            return Ok(());
        }

        info!("Stopping {}", self.name);

        #[cfg(unix)]
        let output = Command::new(Self::tool("pkill")?)
            .args(["-TERM", "-x", &self.name])
            .output();

        #[cfg(windows)]
        let output = Command::new(Self::tool("taskkill")?)
            .args(["/IM", &self.image_name(), "/F"])
            .output();

        match output {
            Ok(o) if o.status.success() => Ok(()),
            // The process may have exited on its own in the meantime.
            Ok(_) if !self.is_running()? => Ok(()),
            Ok(o) => Err(UpdateError::process(format!(
                "failed to stop {} (exit code: {:?})",
                self.name,
                o.status.code()
            ))),
            Err(e) => Err(UpdateError::process(format!(
                "failed to stop {}: {e}",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Target that records stop requests.
    #[derive(Default)]
    pub struct FakeProcess {
        pub running: AtomicBool,
        pub stops: AtomicUsize,
    }

    impl FakeProcess {
        pub fn running() -> Self {
            Self {
                running: AtomicBool::new(true),
                stops: AtomicUsize::new(0),
            }
        }

        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl TargetProcess for FakeProcess {
        fn is_running(&self) -> Result<bool> {
            Ok(self.running.load(Ordering::SeqCst))
        }

        fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_unknown_process_is_not_running() {
        // Skip on systems without procps.
        if which::which("pgrep").is_err() {
            return;
        }
        let process = NamedProcess::new("sh-no-such-prc");
        assert!(!process.is_running().unwrap());
        assert!(process.stop().is_ok());
    }

    #[test]
    fn test_name() {
        assert_eq!(NamedProcess::new("xbmc").name(), "xbmc");
    }
}
