mod api;
mod channel;
mod config;
mod error;
mod models;
mod sync;
mod tasks;

use api::HttpPollSource;
use channel::WsConnector;
use config::SyncConfig;
use log::{error, info, warn};
use models::Standing;
use std::env;
use std::sync::Arc;
use sync::{SyncController, SyncHandle, SyncView};
use tokio::io::{AsyncBufReadExt, BufReader};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    if let Err(e) = run().await {
        error!("rusty-tally stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    // Poll id from the first argument, else from the environment
    let poll_id = match env::args().nth(1).or_else(|| env::var("POLL_ID").ok()) {
        Some(id) => id,
        None => return Err("usage: rusty-tally <poll-id> (or set POLL_ID)".into()),
    };

    let config = SyncConfig::from_env();
    info!("Using API {} and live updates from {}", config.api_url, config.ws_url);
    let source = Arc::new(HttpPollSource::new(config.api_url.clone(), config.http_timeout)?);
    let connector = Arc::new(WsConnector::new(config.ws_url.clone()));

    let (handle, task) = SyncController::spawn(poll_id, config, source, connector);
    let mut views = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("{}", views.borrow_and_update().clone());
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                println!("{}", view);
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_input(&handle, line.trim()) {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown();
    task.await?;
    Ok(())
}

// Returns false when the user asked to quit
fn handle_input(handle: &SyncHandle, input: &str) -> bool {
    match input {
        "" => {}
        "r" | "refresh" => handle.force_refresh(),
        "c" | "connect" | "retry" => handle.retry_connection(),
        "s" | "standings" => print_standings(&handle.get_view()),
        "q" | "quit" => return false,
        other => println!("unknown command '{}' (refresh, retry, standings, quit)", other),
    }
    true
}

fn print_standings(view: &SyncView) {
    let standings: Vec<Standing> = view.tally.standings();
    for standing in &standings {
        println!(
            "  #{:<3} {:<24} {:>6}  {:>5.1}%",
            standing.rank, standing.key, standing.count, standing.percentage
        );
    }

    let Some(results) = &view.results else {
        return;
    };
    for (category, category_results) in results.ordered_categories() {
        println!("  [{}] {} votes", category, category_results.total_votes);
        for contestant in &category_results.contestants {
            println!(
                "    {:<24} {:>6}  {:>5.1}%",
                contestant.name, contestant.vote_count, contestant.percentage
            );
        }
    }
}
