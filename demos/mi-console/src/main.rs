//! Interactive MI console.
//!
//! Run with: cargo run -p mi-console -- <launch.json | debugger>
//!
//! Each stdin line is sent as a command. Lines starting with `-` are MI
//! commands; anything else goes through the backend's console interpreter.
//! Out-of-band records are printed as they arrive.

use std::{fmt::Write, path::Path};

use anyhow::Context;
use futures::StreamExt;
use mi_core::{LaunchConfig, Record, Tuple};
use mi_session::{Command, Session, SessionEvent, SessionOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let target = std::env::args()
        .nth(1)
        .context("usage: mi-console <launch.json | debugger>")?;
    let config = load_config(&target).await?;

    let session = Session::start(&config, SessionOptions::default()).await?;
    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            print_event(&event);
        }
    });

    session
        .wait_until_ready()
        .await
        .context("debugger did not start")?;
    tracing::info!(session_id = %session.id(), "Type MI or console commands, Ctrl-D to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match session.send(Command::new(line).accept_any()).await {
            Ok(response) => println!("{}", render('^', response.class(), response.results())),
            Err(e) if e.is_fatal() => {
                tracing::error!("{e}");
                break;
            }
            Err(e) => println!("error: {e}"),
        }
    }

    session.close().await;
    Ok(())
}

/// A JSON launch configuration, or a debugger to run locally.
async fn load_config(target: &str) -> anyhow::Result<LaunchConfig> {
    let path = Path::new(target);
    if path.extension().is_some_and(|ext| ext == "json") {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(LaunchConfig::from_json(&json)?)
    } else {
        Ok(LaunchConfig::local(path))
    }
}

/// A record as the backend wrote it, minus the token.
fn render(marker: char, class: impl std::fmt::Display, results: &Tuple) -> String {
    let mut line = format!("{marker}{class}");
    for result in results.iter() {
        let _ = write!(line, ",{result}");
    }
    line
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Record(Record::ConsoleStream(text) | Record::TargetStream(text)) => {
            print!("{text}");
        }
        SessionEvent::Record(Record::LogStream(text)) => eprint!("{text}"),
        SessionEvent::Record(Record::Raw(line)) => println!("{line}"),
        SessionEvent::Record(Record::ExecAsync(record)) => {
            println!("{}", render('*', &record.class, &record.results));
        }
        SessionEvent::Record(Record::StatusAsync(record)) => {
            println!("{}", render('+', &record.class, &record.results));
        }
        SessionEvent::Record(Record::NotifyAsync(record)) => {
            println!("{}", render('=', &record.class, &record.results));
        }
        SessionEvent::Record(record) => tracing::debug!(?record, "Unclaimed record"),
        SessionEvent::Stderr(line) => eprintln!("{line}"),
        SessionEvent::Malformed { line, error } => tracing::warn!(%error, "Malformed: {line}"),
        SessionEvent::Disconnected { exit_code, reason } => {
            tracing::info!(?exit_code, ?reason, "Debugger exited");
        }
    }
}
