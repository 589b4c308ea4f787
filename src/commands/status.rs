use crate::core::config::Config;
use crate::core::process::{NamedProcess, TargetProcess};
use crate::core::version::{FileVersionStore, VersionStore};
use crate::error::Result;

pub fn show_status() -> Result<()> {
    let config = Config::load()?;
    let store = FileVersionStore::new(&config.version_file);

    println!("📋 stagehand {}", env!("CARGO_PKG_VERSION"));
    println!();

    match store.load() {
        Some(record) => {
            println!("Installed build: {}", record.build_number);
            println!(
                "Installed on:    {}",
                record.installed_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        None => println!("Installed build: none"),
    }

    match NamedProcess::new(&config.target_name).is_running() {
        Ok(true) => println!("{} is running", config.target_name),
        Ok(false) => println!("{} is not running", config.target_name),
        Err(e) => println!("{} state unknown: {}", config.target_name, e),
    }

    println!();
    println!("Install directory: {}", config.install_dir.display());
    println!("Temp directory:    {}", config.temp_dir.display());
    println!("Version file:      {}", config.version_file.display());
    println!("Build feed:        {}", config.build_feed_url);

    Ok(())
}
