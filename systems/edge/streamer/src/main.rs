//! Edge streamer binary
use clap::Parser;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Handle,
};
use tracing::{error, info};
use vigil::{components::prelude::*, devices::software::vision::ChatAssistant};

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Edge Streamer Component.
    #[arg(short, long)]
    filepath: String,
}

/// Answer operator questions typed on stdin, one per line, from the
/// verdict history.
async fn answer_questions(assistant: Arc<ChatAssistant>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let question = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read question");
                break;
            }
        };
        let question = question.trim();
        if question.is_empty() {
            continue;
        }
        match assistant.ask(question).await {
            Ok(answer) => info!(%question, %answer, "assistant answer"),
            Err(e) => error!(%question, error = %e, "assistant failed"),
        }
    }
}

#[tokio::main]
async fn main() {
    vigil::logging::init("info");
    let args = Args::parse();
    let streamer = match EdgeStreamer::from_config_file(&args.filepath) {
        Ok(streamer) => streamer,
        Err(e) => {
            error!(filepath = %args.filepath, error = %e, "failed to build streamer");
            std::process::exit(1);
        }
    };
    let questions = tokio::spawn(answer_questions(streamer.assistant()));
    let handle = EdgeStreamerController::start(streamer, Handle::current());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for ctrl-c");
    }
    info!("shutting down");
    questions.abort();
    if tokio::task::spawn_blocking(move || handle.stop()).await.is_err() {
        error!("streamer did not stop cleanly");
    }
}
