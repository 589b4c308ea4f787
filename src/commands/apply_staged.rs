use crate::core::config::Config;
use crate::core::self_update::SelfUpdater;
use crate::error::Result;

pub fn apply_staged_update() -> Result<()> {
    let config = Config::load()?;
    let updater = SelfUpdater::from_config(&config)?;

    match updater.apply_staged()? {
        0 => println!("Nothing staged."),
        moved => println!(
            "✅ Applied {} staged file(s) to {}",
            moved,
            updater.settings().app_dir.display()
        ),
    }

    Ok(())
}
