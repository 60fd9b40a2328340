use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{connect_realtime, ClientEvent, HttpGateway, SyncEngine};
use shared::domain::{Message, MessageId, Registrant, SenderId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    uid: String,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    avatar_ref: Option<String>,
    #[arg(long, default_value_t = 10)]
    timeout_seconds: u64,
}

enum Command {
    Send(String),
    Delete(MessageId),
    Edit(MessageId, String),
    History,
    Quit,
    Invalid(&'static str),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };
    let mut parts = rest.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("quit"), _, _) => Command::Quit,
        (Some("history"), _, _) => Command::History,
        (Some("delete"), Some(id), _) => match id.parse() {
            Ok(id) => Command::Delete(MessageId(id)),
            Err(_) => Command::Invalid("usage: /delete <id>"),
        },
        (Some("edit"), Some(id), Some(body)) if !body.trim().is_empty() => match id.parse() {
            Ok(id) => Command::Edit(MessageId(id), body.to_string()),
            Err(_) => Command::Invalid("usage: /edit <id> <text>"),
        },
        _ => Command::Invalid("commands: /history, /delete <id>, /edit <id> <text>, /quit"),
    }
}

fn print_timeline(messages: &[Message]) {
    for message in messages {
        let id = message
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "…".to_string());
        if message.show_avatar == Some(true) {
            println!(
                "[{}] {}",
                message.timestamp.format("%H:%M"),
                message.display_name
            );
        }
        println!("  #{id} {}", message.body);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let args = Args::parse();

    let gateway = HttpGateway::new(&args.server_url, Duration::from_secs(args.timeout_seconds))?;
    let server_url = gateway.server_url().to_string();
    let engine = SyncEngine::new(Arc::new(gateway));
    let me = Registrant {
        uid: SenderId::new(args.uid),
        display_name: args.display_name,
        avatar_ref: args.avatar_ref,
    };

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::Notification(text) => println!("* {text}"),
                ClientEvent::Error(text) => eprintln!("! {text}"),
                ClientEvent::TimelineChanged(_) => {}
            }
        }
    });

    engine.initial_load().await?;
    print_timeline(&engine.snapshot().await);
    let _reader = connect_realtime(Arc::clone(&engine), &server_url, me.clone()).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let outcome = match parse_command(&line) {
            Command::Send(body) => engine.send(&me, &body).await.map(|_| ()),
            Command::Delete(id) => engine.delete(id).await,
            Command::Edit(id, body) => engine.update(id, &body).await,
            Command::History => {
                print_timeline(&engine.snapshot().await);
                Ok(())
            }
            Command::Quit => break,
            Command::Invalid(usage) => {
                println!("{usage}");
                Ok(())
            }
        };
        if let Err(err) = outcome {
            warn!(error = %err, "command failed");
        }
    }

    Ok(())
}
