use crate::core::config::Config;
use crate::error::Result;
use crate::utils::fs;

/// Removes leftover extraction folders from the temp directory.
pub fn clean_temp() -> Result<()> {
    let config = Config::load()?;
    println!("🧹 Cleaning {}", config.temp_dir.display());

    let report = fs::clear_subdirectories(&config.temp_dir, fs::remove_tree)?;

    for path in &report.removed {
        println!("  ✅ Removed {}", path.display());
    }
    for path in &report.failed {
        println!("  ❌ Could not remove {}", path.display());
    }

    if report.removed.is_empty() && report.failed.is_empty() {
        println!("Nothing to clean.");
    }

    Ok(())
}
