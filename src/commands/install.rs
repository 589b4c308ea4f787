use crate::commands::check::describe_build;
use crate::core::config::Config;
use crate::core::events::{Notification, Notifier, Stage};
use crate::core::pipeline::{PipelineState, UpdateOrchestrator};
use crate::error::{Result, UpdateError};
use dialoguer::Confirm;
use std::io::{self, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Checks for a newer build and installs it, reporting each stage as it happens.
pub fn install_update(assume_yes: bool) -> Result<()> {
    let config = Config::load()?;
    let (notifier, events) = Notifier::channel();
    let orchestrator = Arc::new(UpdateOrchestrator::from_config(&config, notifier)?);

    println!("🔄 Checking for updates...");
    let check = orchestrator.check_for_update()?;
    // Check notifications were already summarised above.
    events.try_iter().for_each(drop);

    let build = match check.online_build {
        Some(build) if check.is_available() => build,
        _ => {
            println!(
                "✅ No update is necessary. Build installed: {}",
                describe_build(check.current_build)
            );
            return Ok(());
        }
    };

    println!(
        "🎉 Build {} is available (installed: {})",
        build,
        describe_build(check.current_build)
    );

    if !assume_yes {
        let proceed = Confirm::new()
            .with_prompt(format!(
                "Install build {} into {}?",
                build,
                config.install_dir.display()
            ))
            .default(true)
            .interact()
            .map_err(|e| UpdateError::Io(io::Error::other(e)))?;

        if !proceed {
            println!("Update cancelled.");
            return Ok(());
        }
    }

    let handle = orchestrator.install_updates_async(build)?;
    let progress = orchestrator.progress();
    let mut last_percent = None;

    while !handle.is_finished() {
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(notification) => print_notification(&notification),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if orchestrator.state() == PipelineState::Downloading {
            if let Some(fraction) = progress.fraction() {
                let percent = (fraction * 100.0) as u64;
                if last_percent != Some(percent) {
                    print!("\r⬇️  {percent:>3}%");
                    io::stdout().flush()?;
                    last_percent = Some(percent);
                }
            }
        }
    }

    let state = handle.join();
    drain(&events);

    match state? {
        PipelineState::Done => println!("✅ Build {build} installed"),
        PipelineState::Skipped => println!("⚠️  Close {} and try again", config.target_name),
        other => println!("Update finished in state {other:?}"),
    }

    Ok(())
}

fn drain(events: &Receiver<Notification>) {
    for notification in events.try_iter() {
        print_notification(&notification);
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::Started { stage, message } => {
            println!("{} {}", stage_icon(*stage), message);
        }
        Notification::Finished {
            stage: Stage::Download,
            message,
        } => {
            println!("\r   {message}");
        }
        Notification::Finished { message, .. } => println!("   {message}"),
        Notification::Error { message } => eprintln!("❌ {message}"),
    }
}

fn stage_icon(stage: Stage) -> &'static str {
    match stage {
        Stage::Process => "🚀",
        Stage::Check => "🔍",
        Stage::Download => "⬇️ ",
        Stage::Unzip => "📦",
        Stage::Install => "🔧",
    }
}
