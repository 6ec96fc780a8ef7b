//! Long-running mode: schedule trigger, idle sweeper, and stdin commands.
//!
//! Every stdin line is handled in its own task so a slow harvest never
//! blocks the next caller's throttle check. Replies go to stdout, one line
//! each. Closing stdin does not stop the service; Ctrl-C does.

use crate::dispatch::{Command, Dispatcher, parse_command};
use crate::limiter::KeyedLimiter;
use crate::schedule::{ScheduleEntry, ScheduleTrigger};
use crate::scrapers::PageSource;
use crate::utils::truncate_for_log;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

/// How often idle per-caller windows are forgotten.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Run one command line to completion and produce the reply, if any.
pub async fn handle_line<S: PageSource>(dispatcher: &Dispatcher<S>, line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match parse_command(line) {
        Err(e) => {
            warn!(line = %truncate_for_log(line, 80), error = %e, "Ignoring command");
            Some(format!("error: {e}"))
        }
        Ok(Command::News { caller, hours_back }) => {
            match dispatcher.news(&caller, hours_back).await {
                Ok(digest) => match serde_json::to_string(&digest) {
                    Ok(json) => Some(json),
                    Err(e) => {
                        error!(caller = %caller, error = %e, "Failed to serialize digest");
                        None
                    }
                },
                Err(e) => Some(format!("{caller}: {e}")),
            }
        }
    }
}

#[instrument(level = "info", skip_all, fields(entries = entries.len()))]
pub async fn run<S: PageSource + 'static>(
    dispatcher: Arc<Dispatcher<S>>,
    commands: Arc<KeyedLimiter<String>>,
    entries: Vec<ScheduleEntry>,
) -> Result<(), Box<dyn Error>> {
    let (stop_tx, stop_rx) = watch::channel(false);

    let trigger = {
        let dispatcher = Arc::clone(&dispatcher);
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut trigger = ScheduleTrigger::new(entries);
            trigger.run(dispatcher.as_ref(), stop).await;
        })
    };

    let sweeper = {
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = commands.sweep_idle();
                        debug!(removed, tracked = commands.tracked_keys(), "Swept idle command windows");
                    }
                    _ = stop.changed() => break,
                }
            }
        })
    };

    info!("Serving; send `news <caller> [hours]` on stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    tasks.spawn(async move {
                        if let Some(reply) = handle_line(&dispatcher, &line).await {
                            println!("{reply}");
                        }
                    });
                }
                Ok(None) => {
                    info!("stdin closed; scheduler keeps running");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin; no more commands");
                    stdin_open = false;
                }
            },
            Some(joined) = tasks.join_next() => {
                if let Err(e) = joined {
                    error!(error = %e, "Command task failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let _ = stop_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Command task failed");
        }
    }
    trigger.await?;
    sweeper.await?;
    info!("Stopped");
    Ok(())
}
