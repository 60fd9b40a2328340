use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::domain::{MessageId, SenderId};
use storage::{NewMessage, RemoveOutcome, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/messages.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Appends a message stamped with the current time.
    Append {
        sender_id: String,
        display_name: String,
        body: String,
    },
    /// Prints a 1-based inclusive rank window.
    List {
        #[arg(long, default_value_t = 1)]
        start: u64,
        #[arg(long, default_value_t = 50)]
        end: u64,
    },
    Delete {
        message_id: i64,
    },
    Count,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Append {
            sender_id,
            display_name,
            body,
        } => {
            let message_id = storage
                .append(&NewMessage {
                    sender_id: SenderId::new(sender_id),
                    display_name,
                    avatar_ref: None,
                    timestamp: Utc::now(),
                    body,
                    show_avatar: false,
                    show_timestamp: false,
                })
                .await?;
            println!("created message_id={message_id}");
        }
        Command::List { start, end } => {
            for row in storage.read_range(start, end).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    row.message_id, row.created_at_ms, row.sender_id, row.body
                );
            }
        }
        Command::Delete { message_id } => match storage.remove(MessageId(message_id)).await? {
            RemoveOutcome::Removed => println!("deleted message_id={message_id}"),
            RemoveOutcome::AlreadyRemoved => {
                println!("message_id={message_id} was already deleted")
            }
        },
        Command::Count => println!("{}", storage.count().await?),
    }

    Ok(())
}
