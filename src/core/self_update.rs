use crate::core::config::Config;
use crate::core::discovery::latest_self_update;
use crate::core::download::{Downloader, HttpTransport, Transport};
use crate::core::extract::{ArchiveExtractor, ExtractFilter, Extractor};
use crate::error::{Result, UpdateError};
use crate::utils::fs;
use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Span};

/// Name of the helper that swaps the updater binary on next launch.
#[cfg(windows)]
pub const HELPER_FILES: [&str; 2] = ["selfupdate.exe", "selfupdate.pdb"];
#[cfg(not(windows))]
pub const HELPER_FILES: [&str; 2] = ["selfupdate", "selfupdate.pdb"];

#[derive(Debug, Clone)]
pub struct SelfUpdateSettings {
    pub feed_url: String,
    /// Package prefix on the feed, as in `<name>_1.2.3.zip`.
    pub name: String,
    pub filter: ExtractFilter,
    /// Directory the running updater executable lives in.
    pub app_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub current_version: Version,
}

impl SelfUpdateSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let app_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
            .unwrap_or_else(|| config.stagehand_dir.clone());

        Ok(Self {
            feed_url: config.self_update_url.clone(),
            name: config.self_update_name.clone(),
            filter: ExtractFilter::parse(&config.self_update_filter)?,
            app_dir,
            staging_dir: config.get_self_update_staging_dir(),
            temp_dir: config.get_self_update_temp_dir(),
            current_version: Version::parse(env!("CARGO_PKG_VERSION"))?,
        })
    }
}

/// Keeps the updater itself current.
///
/// New binaries are only staged; the running executable is replaced by the helper on
/// the next launch (see [`SelfUpdater::apply_staged`]).
pub struct SelfUpdater {
    settings: SelfUpdateSettings,
    transport: Arc<dyn Transport>,
    downloader: Downloader,
    extractor: Arc<dyn Extractor>,
    span: Span,
}

impl SelfUpdater {
    pub fn new(
        settings: SelfUpdateSettings,
        transport: Arc<dyn Transport>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let downloader = Downloader::new(Arc::clone(&transport));
        Self {
            settings,
            transport,
            downloader,
            extractor,
            span: info_span!("self_update"),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        if config.self_update_url.trim().is_empty() {
            return Err(UpdateError::config("self_update_url cannot be empty"));
        }
        let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
        Ok(Self::new(
            SelfUpdateSettings::from_config(config)?,
            transport,
            Arc::new(ArchiveExtractor::new()),
        )
        .with_span(info_span!("self_update", name = %config.self_update_name)))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn settings(&self) -> &SelfUpdateSettings {
        &self.settings
    }

    /// Stages a newer updater package if the feed has one.
    ///
    /// Returns `true` when new files were staged.
    pub fn check_and_stage(&self) -> Result<bool> {
        let _guard = self.span.enter();
        let started = Instant::now();

        info!(
            "Initiating self-update. Local version: {}",
            self.settings.current_version
        );

        let staged = self.stage_latest().map_err(|e| {
            error!(
                "An error has occurred while checking for application update. {}",
                e
            );
            e
        })?;

        info!(
            "Self-update preparation took {:.2}s",
            started.elapsed().as_secs_f64()
        );
        Ok(staged)
    }

    fn stage_latest(&self) -> Result<bool> {
        self.cleanup();
        fs::ensure_dir_exists(&self.settings.temp_dir)?;

        let page = self.transport.fetch_text(&self.settings.feed_url)?;
        let latest = match latest_self_update(&page, &self.settings.name)? {
            Some(latest) if latest.id > self.settings.current_version => latest,
            _ => {
                info!("You have the most recent build. No update is necessary");
                return Ok(false);
            }
        };

        info!(
            "Version {} is available from the server. Initiating download.",
            latest.id
        );
        let archive = self
            .settings
            .temp_dir
            .join(format!("{}{}.zip", self.settings.name, latest.id));
        self.downloader.download(&latest.url, &archive)?;

        info!("Extracting update");
        fs::ensure_dir_exists(&self.settings.staging_dir)?;
        self.extractor.extract(
            &archive,
            &self.settings.staging_dir,
            Some(&self.settings.filter),
        )?;
        info!(
            "Update extracted to {}",
            self.settings.staging_dir.display()
        );

        self.install_helper()?;
        Ok(true)
    }

    /// Moves a freshly staged helper next to the running executable.
    fn install_helper(&self) -> Result<()> {
        for name in HELPER_FILES {
            let staged = self.settings.staging_dir.join(name);
            if !staged.exists() {
                continue;
            }

            let destination = self.settings.app_dir.join(name);
            fs::copy_file(&staged, &destination)?;
            if name == HELPER_FILES[0] {
                fs::make_executable(&destination)?;
            }
            std::fs::remove_file(&staged).map_err(|e| UpdateError::filesystem(&staged, e))?;
            info!("Installed {}", destination.display());
        }
        Ok(())
    }

    fn cleanup(&self) {
        info!("Performing self-update cleanup");

        for dir in [&self.settings.staging_dir, &self.settings.temp_dir] {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    error!(
                        "An error has occurred while cleaning '{}'. {}",
                        dir.display(),
                        e
                    );
                }
            }
        }
    }

    /// Moves every staged file into the application directory and drops the staging
    /// directory. Returns the number of files moved.
    pub fn apply_staged(&self) -> Result<usize> {
        let _guard = self.span.enter();
        let staging = &self.settings.staging_dir;

        if !staging.exists() {
            info!("Nothing staged in {}", staging.display());
            return Ok(0);
        }

        let moved = fs::copy_dir_filtered(staging, &self.settings.app_dir, &fs::CopyAll)?;
        fs::remove_tree(staging)?;

        info!(
            "Applied {} staged file(s) to {}",
            moved,
            self.settings.app_dir.display()
        );
        Ok(moved)
    }
}
