use crate::error::{Result, UpdateError};
use flate2::read::GzDecoder;
use regex::{Regex, RegexBuilder};
use std::fs::File;
use std::path::Path;
use tar::Archive;
use tracing::{debug, info};
use zip::ZipArchive;

/// Include/exclude rules matched against the file name of each archive entry.
///
/// An entry is kept when it matches at least one include rule (or there are none)
/// and no exclude rule. Matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct ExtractFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl ExtractFilter {
    /// Parses a `;`-separated rule list such as `+\.exe$;+\.pdb$;-^nlog\.dll$`.
    ///
    /// Rules prefixed with `-` exclude, `+` or no prefix include.
    pub fn parse(rules: &str) -> Result<Self> {
        let mut filter = Self::default();

        for rule in rules.split(';').map(str::trim).filter(|r| !r.is_empty()) {
            let (is_exclude, pattern) = match rule.as_bytes()[0] {
                b'-' => (true, &rule[1..]),
                b'+' => (false, &rule[1..]),
                _ => (false, rule),
            };

            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| UpdateError::parse(format!("invalid filter rule '{rule}': {e}")))?;

            if is_exclude {
                filter.exclude.push(regex);
            } else {
                filter.include.push(regex);
            }
        }

        Ok(filter)
    }

    pub fn is_match(&self, file_name: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|r| r.is_match(file_name));
        included && !self.exclude.iter().any(|r| r.is_match(file_name))
    }
}

/// Archive extraction capability.
pub trait Extractor: Send + Sync {
    /// Extracts `archive` into `destination`, keeping only files accepted by `filter`.
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        filter: Option<&ExtractFilter>,
    ) -> Result<()>;
}

/// Extracts `.zip`, `.tar.gz` and `.tgz` archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extract_zip(
        &self,
        archive_path: &Path,
        destination: &Path,
        filter: Option<&ExtractFilter>,
    ) -> Result<()> {
        let fail = |message: String| UpdateError::extraction(archive_path, message);

        let file = File::open(archive_path).map_err(|e| fail(e.to_string()))?;
        let mut archive = ZipArchive::new(file).map_err(|e| fail(e.to_string()))?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| fail(e.to_string()))?;
            let relative = match entry.enclosed_name() {
                Some(path) => path,
                None => continue,
            };
            let outpath = destination.join(&relative);

            if entry.is_dir() {
                if filter.is_none() {
                    std::fs::create_dir_all(&outpath).map_err(|e| fail(e.to_string()))?;
                }
                continue;
            }

            if !accepts(filter, &relative) {
                debug!("Filtered out {}", relative.display());
                continue;
            }

            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
            }
            let mut outfile = File::create(&outpath).map_err(|e| fail(e.to_string()))?;
            std::io::copy(&mut entry, &mut outfile).map_err(|e| fail(e.to_string()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode))
                        .map_err(|e| fail(e.to_string()))?;
                }
            }
        }

        Ok(())
    }

    fn extract_tar_gz(
        &self,
        archive_path: &Path,
        destination: &Path,
        filter: Option<&ExtractFilter>,
    ) -> Result<()> {
        let fail = |message: String| UpdateError::extraction(archive_path, message);

        let file = File::open(archive_path).map_err(|e| fail(e.to_string()))?;
        let mut archive = Archive::new(GzDecoder::new(file));

        for entry in archive.entries().map_err(|e| fail(e.to_string()))? {
            let mut entry = entry.map_err(|e| fail(e.to_string()))?;
            let relative = entry.path().map_err(|e| fail(e.to_string()))?.into_owned();

            let is_dir = entry.header().entry_type().is_dir();
            if (is_dir && filter.is_some()) || (!is_dir && !accepts(filter, &relative)) {
                continue;
            }

            // unpack_in refuses entries escaping the destination.
            entry
                .unpack_in(destination)
                .map_err(|e| fail(e.to_string()))?;
        }

        Ok(())
    }
}

fn accepts(filter: Option<&ExtractFilter>, relative: &Path) -> bool {
    match filter {
        None => true,
        Some(filter) => relative
            .file_name()
            .map(|name| filter.is_match(&name.to_string_lossy()))
            .unwrap_or(false),
    }
}

impl Extractor for ArchiveExtractor {
    fn extract(
        &self,
        archive_path: &Path,
        destination: &Path,
        filter: Option<&ExtractFilter>,
    ) -> Result<()> {
        info!(
            "Extracting {} to {}",
            archive_path.display(),
            destination.display()
        );

        std::fs::create_dir_all(destination)
            .map_err(|e| UpdateError::filesystem(destination, e))?;

        let file_name = archive_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UpdateError::extraction(archive_path, "invalid archive file name"))?
            .to_lowercase();

        if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
            self.extract_tar_gz(archive_path, destination, filter)?;
        } else if file_name.ends_with(".zip") {
            self.extract_zip(archive_path, destination, filter)?;
        } else {
            return Err(UpdateError::extraction(
                archive_path,
                format!("unsupported archive format: {file_name}"),
            ));
        }

        info!("All files extracted successfully");
        Ok(())
    }
}

/// Directory an archive extracts into: its path with the archive extension stripped.
pub fn extraction_dir(archive_path: &Path) -> std::path::PathBuf {
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = name.to_lowercase();

    let stem_len = [".tar.gz", ".tgz", ".zip"]
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| name.len() - ext.len())
        .unwrap_or(name.len());

    archive_path.with_file_name(&name[..stem_len])
}


#[cfg(test)]
mod tests {
    use super::testing::zip_bytes;
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_filter_parse_and_match() {
        let filter = ExtractFilter::parse(r"+\.exe$;+\.pdb$;+\.dll$;-^nlog\.dll$").unwrap();

        assert!(filter.is_match("stagehand.exe"));
        assert!(filter.is_match("SelfUpdate.PDB"));
        assert!(filter.is_match("zip.dll"));
        assert!(!filter.is_match("NLog.dll"));
        assert!(!filter.is_match("readme.txt"));
    }

    #[test]
    fn test_filter_without_includes_accepts_everything_not_excluded() {
        let filter = ExtractFilter::parse(r"-\.log$").unwrap();
        assert!(filter.is_match("app"));
        assert!(!filter.is_match("debug.log"));
        assert!(ExtractFilter::parse("").unwrap().is_match("anything"));
    }

    #[test]
    fn test_filter_rejects_bad_regex() {
        assert!(matches!(
            ExtractFilter::parse("+(unclosed"),
            Err(UpdateError::Parse { .. })
        ));
    }

    #[test]
    fn test_extract_zip() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("XBMC-42.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[
                ("xbmc/", ""),
                ("xbmc/xbmc.exe", "binary"),
                ("xbmc/system/keymap.xml", "<keymap/>"),
                ("xbmc/empty/", ""),
            ]),
        )
        .unwrap();
        let destination = temp.path().join("out");

        ArchiveExtractor::new()
            .extract(&archive, &destination, None)
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(destination.join("xbmc/xbmc.exe")).unwrap(),
            "binary"
        );
        assert!(destination.join("xbmc/system/keymap.xml").exists());
        assert!(destination.join("xbmc/empty").is_dir());
    }

    #[test]
    fn test_extract_zip_with_filter() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("stagehand_1.3.0.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[
                ("stagehand.exe", "new"),
                ("selfupdate.pdb", "symbols"),
                ("NLog.dll", "logger"),
                ("docs/readme.txt", "docs"),
            ]),
        )
        .unwrap();
        let destination = temp.path().join("staging");
        let filter = ExtractFilter::parse(r"+\.exe$;+\.pdb$;+\.dll$;-^nlog\.dll$").unwrap();

        ArchiveExtractor::new()
            .extract(&archive, &destination, Some(&filter))
            .unwrap();

        assert!(destination.join("stagehand.exe").exists());
        assert!(destination.join("selfupdate.pdb").exists());
        assert!(!destination.join("NLog.dll").exists());
        assert!(!destination.join("docs").exists());
    }

    #[test]
    fn test_extract_tar_gz() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("build-9.tar.gz");

        let encoder = flate2::write::GzEncoder::new(
            File::create(&archive).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        let data = b"tarred";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "build/app.bin", &data[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let destination = temp.path().join("out");
        ArchiveExtractor::new()
            .extract(&archive, &destination, None)
            .unwrap();

        assert_eq!(
            std::fs::read(destination.join("build/app.bin")).unwrap(),
            b"tarred"
        );
    }

    #[test]
    fn test_extract_corrupt_archive_is_extraction_error() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("broken.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();

        let err = ArchiveExtractor::new()
            .extract(&archive, &temp.path().join("out"), None)
            .unwrap_err();
        match err {
            UpdateError::Extraction { path, .. } => assert_eq!(path, archive),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extract_unsupported_format() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("build.rar");
        std::fs::write(&archive, b"rar").unwrap();

        let err = ArchiveExtractor::new()
            .extract(&archive, &temp.path().join("out"), None)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported archive format"));
    }

    #[test]
    fn test_extraction_dir_strips_extension() {
        assert_eq!(
            extraction_dir(Path::new("/tmp/stagehand/XBMC-42.zip")),
            PathBuf::from("/tmp/stagehand/XBMC-42")
        );
        assert_eq!(
            extraction_dir(Path::new("/tmp/build-9.tar.gz")),
            PathBuf::from("/tmp/build-9")
        );
        assert_eq!(
            extraction_dir(Path::new("/tmp/plain")),
            PathBuf::from("/tmp/plain")
        );
    }
}
