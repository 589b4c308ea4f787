use crate::core::config::Config;
use crate::core::self_update::SelfUpdater;
use crate::error::Result;

pub fn update_self() -> Result<()> {
    println!("🔄 Checking for stagehand updates...");

    let config = Config::load()?;
    let updater = SelfUpdater::from_config(&config)?;

    if updater.check_and_stage()? {
        println!(
            "📦 New version staged in {}",
            updater.settings().staging_dir.display()
        );
        println!();
        println!("To finish the update:");
        println!("  stagehand apply-staged");
    } else {
        println!(
            "✅ stagehand is up to date (version {})",
            env!("CARGO_PKG_VERSION")
        );
    }

    Ok(())
}
