use crate::core::config::Config;
use crate::core::events::Notifier;
use crate::core::pipeline::UpdateOrchestrator;
use crate::error::Result;

pub fn check_for_updates() -> Result<()> {
    println!("🔄 Checking for updates...");

    let config = Config::load()?;
    let orchestrator = UpdateOrchestrator::from_config(&config, Notifier::silent())?;
    let check = orchestrator.check_for_update()?;

    match check.online_build {
        None => {
            println!("❌ No builds found on {}", config.build_feed_url);
        }
        Some(online) if check.is_available() => {
            println!(
                "🎉 New build available: {} (installed: {})",
                online,
                describe_build(check.current_build)
            );
            println!();
            println!("To update:");
            println!("  stagehand install");
        }
        Some(_) => {
            println!(
                "✅ You're on the latest build: {}",
                describe_build(check.current_build)
            );
        }
    }

    Ok(())
}

pub(crate) fn describe_build(build: u64) -> String {
    if build == 0 {
        "none".to_string()
    } else {
        build.to_string()
    }
}
