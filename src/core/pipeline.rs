//! The update pipeline: check, download, extract, install, clean up.
//!
//! [`UpdateOrchestrator::check_for_update`] only reads. Installing runs the staged
//! pipeline either on the calling thread ([`UpdateOrchestrator::apply_update`]) or on a
//! dedicated background thread ([`UpdateOrchestrator::install_updates_async`]). At most
//! one pipeline may run per orchestrator at a time; nothing enforces this internally.

use crate::core::config::Config;
use crate::core::discovery::{BuildDiscovery, FeedDiscovery};
use crate::core::download::{DownloadProgress, Downloader, HttpTransport, Transport};
use crate::core::events::{CancelToken, Notifier, Stage};
use crate::core::extract::{extraction_dir, ArchiveExtractor, Extractor};
use crate::core::process::{NamedProcess, TargetProcess};
use crate::core::version::{FileVersionStore, VersionRecord, VersionStore};
use crate::error::{Result, UpdateError};
use crate::utils::fs::{self, CleanupReport, CopyAll, CopyFilter, InstallRules};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Span};

/// Where a pipeline run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Checking,
    UpdateAvailable,
    UpToDate,
    Downloading,
    Extracting,
    Installing,
    CleaningUp,
    Done,
    /// Nothing was touched: the target was running with automatic shutdown off, or
    /// the requested build is older than the installed one.
    Skipped,
    Cancelled,
    Failed,
}

/// Result of [`UpdateOrchestrator::check_for_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCheck {
    /// Installed build, 0 when no version record exists.
    pub current_build: u64,
    /// Newest published build, `None` when the feed lists nothing.
    pub online_build: Option<u64>,
}

impl UpdateCheck {
    pub fn is_available(&self) -> bool {
        self.online_build
            .map(|online| online > self.current_build)
            .unwrap_or(false)
    }
}

/// Paths and switches the pipeline runs with.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target_name: String,
    pub install_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Sub-directory of the extracted archive holding the build tree.
    pub archive_root: Option<String>,
    pub auto_shutdown: bool,
    pub lock_grace: Duration,
    pub atomic_install: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_name: config.target_name.clone(),
            install_dir: config.install_dir.clone(),
            temp_dir: config.temp_dir.clone(),
            archive_root: config.archive_root.clone(),
            auto_shutdown: config.auto_shutdown,
            lock_grace: config.lock_grace(),
            atomic_install: config.atomic_install,
        }
    }

    /// Canonical temp path of the archive for `build`, keeping the extension of `url`.
    pub fn archive_path(&self, build: u64, url: &str) -> PathBuf {
        let lower = url.to_lowercase();
        let extension = if lower.ends_with(".tar.gz") {
            "tar.gz"
        } else if lower.ends_with(".tgz") {
            "tgz"
        } else {
            "zip"
        };
        self.temp_dir
            .join(format!("{}-{}.{}", self.target_name, build, extension))
    }
}

/// Capabilities the orchestrator delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn BuildDiscovery>,
    pub store: Arc<dyn VersionStore>,
    pub target: Arc<dyn TargetProcess>,
    pub extractor: Arc<dyn Extractor>,
    pub downloader: Arc<Downloader>,
    pub rules: Arc<dyn CopyFilter>,
}

/// State of one install run. Never persisted.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub build: u64,
    pub archive_path: PathBuf,
    pub extracted_path: PathBuf,
    pub install_dir: PathBuf,
}

enum RunOutcome {
    Installed,
    TargetRunning,
    OlderBuild { installed: u64 },
}

pub struct UpdateOrchestrator {
    settings: PipelineSettings,
    discovery: Arc<dyn BuildDiscovery>,
    store: Arc<dyn VersionStore>,
    target: Arc<dyn TargetProcess>,
    extractor: Arc<dyn Extractor>,
    downloader: Arc<Downloader>,
    rules: Arc<dyn CopyFilter>,
    notifier: Notifier,
    cancel: CancelToken,
    state: Mutex<PipelineState>,
    span: Span,
}

impl UpdateOrchestrator {
    /// Creates the orchestrator and its temp root.
    pub fn new(
        settings: PipelineSettings,
        collaborators: Collaborators,
        notifier: Notifier,
    ) -> Result<Self> {
        fs::ensure_dir_exists(&settings.temp_dir)?;
        info!(
            "Creating temporary folder at: {}",
            settings.temp_dir.display()
        );

        Ok(Self {
            settings,
            discovery: collaborators.discovery,
            store: collaborators.store,
            target: collaborators.target,
            extractor: collaborators.extractor,
            downloader: collaborators.downloader,
            rules: collaborators.rules,
            notifier,
            cancel: CancelToken::new(),
            state: Mutex::new(PipelineState::Idle),
            span: info_span!("update"),
        })
    }

    /// Wires the production collaborators described by `config`.
    pub fn from_config(config: &Config, notifier: Notifier) -> Result<Self> {
        config.validate()?;

        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.request_timeout())?);
        let collaborators = Collaborators {
            discovery: Arc::new(
                FeedDiscovery::new(
                    Arc::clone(&transport),
                    &config.build_feed_url,
                    &config.build_pattern,
                )?
                .with_span(info_span!("discovery", feed = %config.build_feed_url)),
            ),
            store: Arc::new(
                FileVersionStore::new(&config.version_file)
                    .with_span(info_span!("version_store", path = %config.version_file.display())),
            ),
            target: Arc::new(NamedProcess::new(&config.target_name)),
            extractor: Arc::new(ArchiveExtractor::new()),
            downloader: Arc::new(
                Downloader::new(transport)
                    .with_span(info_span!("downloader", target = %config.target_name)),
            ),
            rules: Arc::new(InstallRules::new(
                &config.user_data_marker,
                &config.protected_file,
            )),
        };

        Ok(
            Self::new(PipelineSettings::from_config(config), collaborators, notifier)?
                .with_span(info_span!("update", target = %config.target_name)),
        )
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Shares `token` with the caller instead of owning a private one.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Last stage reached, for display. Nothing in the pipeline branches on it.
    pub fn state(&self) -> PipelineState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: PipelineState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Progress counters of the download stage.
    pub fn progress(&self) -> Arc<DownloadProgress> {
        self.downloader.progress()
    }

    pub fn current_build(&self) -> u64 {
        self.store.load().map(|r| r.build_number).unwrap_or(0)
    }

    /// Compares the installed build with the newest published one.
    ///
    /// Reads only: no download and no write happens here.
    pub fn check_for_update(&self) -> Result<UpdateCheck> {
        let _guard = self.span.enter();
        self.set_state(PipelineState::Checking);
        self.notifier.started(Stage::Check, "Looking for updates");

        let current_build = self.current_build();
        let builds = match self.discovery.build_ids() {
            Ok(builds) => builds,
            Err(e) => {
                error!("An error has occurred while checking for updates. {}", e);
                self.set_state(PipelineState::Failed);
                self.notifier
                    .error("An error has occurred while checking for updates");
                return Err(e);
            }
        };

        let check = UpdateCheck {
            current_build,
            online_build: builds.into_iter().max(),
        };

        if let Some(online) = check.online_build {
            info!(
                "Latest available build: {}. Currently installed: {}",
                online, current_build
            );
        }

        if check.is_available() {
            self.set_state(PipelineState::UpdateAvailable);
            self.notifier.finished(
                Stage::Check,
                format!(
                    "Latest available build: {}",
                    check.online_build.unwrap_or_default()
                ),
            );
        } else {
            info!("No update is necessary");
            self.set_state(PipelineState::UpToDate);
            self.notifier.finished(
                Stage::Check,
                format!("No update is necessary. Build installed: {current_build}"),
            );
        }

        Ok(check)
    }

    /// Runs the install pipeline for `build` on the calling thread.
    pub fn apply_update(&self, build: u64) -> Result<PipelineState> {
        self.cancel.reset();
        self.downloader.reset();
        self.run_update(build)
    }

    /// Runs the install pipeline for `build` on a dedicated thread.
    pub fn install_updates_async(self: &Arc<Self>, build: u64) -> Result<InstallHandle> {
        self.cancel.reset();
        self.downloader.reset();

        let orchestrator = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("stagehand-update".to_string())
            .spawn(move || orchestrator.run_update(build))
            .map_err(|e| UpdateError::Worker {
                message: format!("failed to start update thread: {e}"),
            })?;

        Ok(InstallHandle {
            thread,
            orchestrator: Arc::clone(self),
        })
    }

    /// Requests cancellation of the running pipeline.
    ///
    /// Checked between stages and between download chunks; a stage already copying
    /// files into the installation finishes first.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.downloader.stop();
    }

    fn run_update(&self, build: u64) -> Result<PipelineState> {
        let _guard = self.span.enter();
        self.notifier.started(
            Stage::Process,
            format!("Starting update process for build {build}"),
        );

        match self.run_pipeline(build) {
            Ok(RunOutcome::Installed) => {
                info!("Successfully updated to build {}", build);
                self.set_state(PipelineState::Done);
                self.notifier
                    .finished(Stage::Process, "Update successfully completed");
                Ok(PipelineState::Done)
            }
            Ok(RunOutcome::TargetRunning) => {
                info!(
                    "An instance of {} is detected. Skipping update.",
                    self.settings.target_name
                );
                self.set_state(PipelineState::Skipped);
                self.notifier.finished(
                    Stage::Process,
                    format!(
                        "{} is running. Unable to proceed with update.",
                        self.settings.target_name
                    ),
                );
                Ok(PipelineState::Skipped)
            }
            Ok(RunOutcome::OlderBuild { installed }) => {
                warn!(
                    "Build {} is older than installed build {}. Skipping update.",
                    build, installed
                );
                self.set_state(PipelineState::Skipped);
                self.notifier.finished(
                    Stage::Process,
                    format!(
                        "Build {build} is older than installed build {installed}. Nothing to do."
                    ),
                );
                Ok(PipelineState::Skipped)
            }
            Err(e) if e.is_cancelled() => {
                warn!("Update to build {} was cancelled", build);
                self.clean_temp();
                self.set_state(PipelineState::Cancelled);
                self.notifier.finished(Stage::Process, "Update cancelled");
                Err(e)
            }
            Err(e) => {
                error!("An error has occurred during update. {}", e);
                self.set_state(PipelineState::Failed);
                let message = format!("An error has occurred during update: {e}");
                self.notifier.error(message.clone());
                self.notifier.finished(Stage::Process, message);
                Err(e)
            }
        }
    }

    fn run_pipeline(&self, build: u64) -> Result<RunOutcome> {
        self.cancel.checkpoint()?;

        // Installed build numbers never go backwards.
        let installed = self.current_build();
        if build < installed {
            return Ok(RunOutcome::OlderBuild { installed });
        }

        if !self.settings.auto_shutdown && self.target.is_running()? {
            return Ok(RunOutcome::TargetRunning);
        }

        let mut context = PipelineContext {
            build,
            archive_path: PathBuf::new(),
            extracted_path: PathBuf::new(),
            install_dir: self.settings.install_dir.clone(),
        };

        self.set_state(PipelineState::Downloading);
        self.download_build(&mut context)?;
        self.cancel.checkpoint()?;

        self.set_state(PipelineState::Extracting);
        self.extract_build(&mut context)?;
        self.cancel.checkpoint()?;

        self.set_state(PipelineState::Installing);
        self.install_build(&context)?;

        self.set_state(PipelineState::CleaningUp);
        self.clean_temp();

        Ok(RunOutcome::Installed)
    }

    fn download_build(&self, context: &mut PipelineContext) -> Result<()> {
        let build = context.build;
        self.notifier
            .started(Stage::Download, format!("Downloading build {build}..."));

        let url = self.discovery.build_url(build)?;
        context.archive_path = self.settings.archive_path(build, &url);
        let archive = &context.archive_path;

        if archive.exists() {
            let remote_size = match self.downloader.query_remote_size(&url) {
                Ok(size) => size,
                Err(e) => {
                    warn!("Unable to query remote file size. {}", e);
                    0
                }
            };
            let local_size = std::fs::metadata(archive)
                .map_err(|e| UpdateError::filesystem(archive, e))?
                .len();

            if remote_size > 0 && remote_size == local_size {
                info!(
                    "File '{}' with the matching file size exists. Skipping download",
                    archive.display()
                );
                self.notifier
                    .finished(Stage::Download, "Already downloaded, skipping");
                return Ok(());
            }

            info!("Partial file detected. Re-downloading file");
        }

        self.cancel.checkpoint()?;
        info!("Downloading build {} from the server", build);
        if let Err(e) = self.downloader.download(&url, archive) {
            if let Err(remove_error) = std::fs::remove_file(archive) {
                if remove_error.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Unable to delete partial download '{}'. {}",
                        archive.display(),
                        remove_error
                    );
                }
            }
            return Err(if self.cancel.is_cancelled() {
                UpdateError::Cancelled
            } else {
                e
            });
        }

        self.notifier
            .finished(Stage::Download, format!("Build {build} downloaded"));
        Ok(())
    }

    fn extract_build(&self, context: &mut PipelineContext) -> Result<()> {
        self.notifier.started(Stage::Unzip, "Extracting build...");

        let unzip_dir = extraction_dir(&context.archive_path);
        if unzip_dir.exists() {
            info!("Trying to delete previous extracted copy");
            if let Err(e) = std::fs::remove_dir_all(&unzip_dir) {
                warn!("Unable to delete old extracted files. {}", e);
            }
        }
        fs::ensure_dir_exists(&unzip_dir)?;

        info!(
            "Extracting build {} to {}",
            context.build,
            unzip_dir.display()
        );
        self.extractor
            .extract(&context.archive_path, &unzip_dir, None)?;

        context.extracted_path = match &self.settings.archive_root {
            Some(root) => unzip_dir.join(root),
            None => unzip_dir,
        };
        if !context.extracted_path.is_dir() {
            return Err(UpdateError::extraction(
                &context.archive_path,
                format!(
                    "archive does not contain '{}'",
                    self.settings.archive_root.as_deref().unwrap_or_default()
                ),
            ));
        }

        self.notifier
            .finished(Stage::Unzip, "All files extracted successfully");
        Ok(())
    }

    fn install_build(&self, context: &PipelineContext) -> Result<()> {
        let build = context.build;
        self.notifier
            .started(Stage::Install, format!("Installing build {build}..."));

        info!("Stopping {}", self.settings.target_name);
        self.target.stop()?;

        // Give the stopped application time to release its file locks.
        std::thread::sleep(self.settings.lock_grace);
        self.cancel.checkpoint()?;

        if self.settings.atomic_install {
            let staged = StagedInstall::new(&context.install_dir)?;
            staged.prepare(&context.extracted_path, self.rules.as_ref())?;
            staged.commit()?;

            if let Err(e) = self.store.save(&VersionRecord::new(build)) {
                staged.rollback();
                return Err(e);
            }
            staged.finish();
        } else {
            fs::copy_dir_filtered(
                &context.extracted_path,
                &context.install_dir,
                self.rules.as_ref(),
            )?;
            self.store.save(&VersionRecord::new(build))?;
        }

        self.notifier.finished(
            Stage::Install,
            format!("Successfully installed build {build}"),
        );
        Ok(())
    }

    /// Deletes every subdirectory of the temp root, carrying on past failures.
    pub fn clean_temp(&self) -> CleanupReport {
        info!("Cleaning temp folder");
        match fs::clear_subdirectories(&self.settings.temp_dir, fs::remove_tree) {
            Ok(report) => report,
            Err(e) => {
                warn!("Unable to clean temp folder. {}", e);
                CleanupReport::default()
            }
        }
    }
}

/// Handle to a pipeline running on its own thread.
pub struct InstallHandle {
    thread: JoinHandle<Result<PipelineState>>,
    orchestrator: Arc<UpdateOrchestrator>,
}

impl InstallHandle {
    pub fn cancel(&self) {
        self.orchestrator.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the pipeline and returns how it ended.
    pub fn join(self) -> Result<PipelineState> {
        self.thread.join().map_err(|_| UpdateError::Worker {
            message: "update thread panicked".to_string(),
        })?
    }
}

/// New tree assembled next to the live installation, then swapped in by renames.
struct StagedInstall {
    live: PathBuf,
    staging: PathBuf,
    previous: PathBuf,
}

impl StagedInstall {
    fn new(live: &Path) -> Result<Self> {
        let (Some(parent), Some(name)) = (live.parent(), live.file_name()) else {
            return Err(UpdateError::config(format!(
                "installation directory '{}' has no parent",
                live.display()
            )));
        };
        let name = name.to_string_lossy();

        Ok(Self {
            live: live.to_path_buf(),
            staging: parent.join(format!(".{name}.staging")),
            previous: parent.join(format!(".{name}.previous")),
        })
    }

    /// Copies the live tree and overlays `build_tree` onto it under the staging path.
    fn prepare(&self, build_tree: &Path, rules: &dyn CopyFilter) -> Result<()> {
        fs::remove_dir_recursive(&self.staging)?;
        fs::remove_dir_recursive(&self.previous)?;

        let result = (|| -> Result<()> {
            if self.live.exists() {
                fs::copy_dir_filtered(&self.live, &self.staging, &CopyAll)?;
            } else {
                fs::ensure_dir_exists(&self.staging)?;
            }
            fs::copy_dir_filtered(build_tree, &self.staging, rules)?;
            Ok(())
        })();

        if result.is_err() {
            fs::remove_tree_best_effort(&self.staging);
        }
        result
    }

    fn commit(&self) -> Result<()> {
        let had_live = self.live.exists();
        if had_live {
            std::fs::rename(&self.live, &self.previous)
                .map_err(|e| UpdateError::filesystem(&self.live, e))?;
        }

        if let Err(e) = std::fs::rename(&self.staging, &self.live) {
            if had_live {
                if let Err(restore) = std::fs::rename(&self.previous, &self.live) {
                    error!(
                        "Unable to restore '{}' from '{}'. {}",
                        self.live.display(),
                        self.previous.display(),
                        restore
                    );
                }
            }
            fs::remove_tree_best_effort(&self.staging);
            return Err(UpdateError::filesystem(&self.live, e));
        }

        info!("Swapped new build into '{}'", self.live.display());
        Ok(())
    }

    /// Puts the previous tree back after a successful [`StagedInstall::commit`].
    fn rollback(&self) {
        if !self.previous.exists() {
            return;
        }
        warn!("Rolling back '{}'", self.live.display());

        if let Err(e) = std::fs::rename(&self.live, &self.staging) {
            error!("Unable to move new build aside. {}", e);
            return;
        }
        if let Err(e) = std::fs::rename(&self.previous, &self.live) {
            error!("Unable to restore previous build. {}", e);
            return;
        }
        fs::remove_tree_best_effort(&self.staging);
    }

    fn finish(&self) {
        if self.previous.exists() && fs::remove_tree_best_effort(&self.previous) > 0 {
            warn!(
                "Previous build left behind at '{}'",
                self.previous.display()
            );
        }
    }
}
