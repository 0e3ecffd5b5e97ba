//! docqueue CLI: operator interface to a queue collection.

use clap::{Parser, Subcommand};
use docqueue::config::Config;
use docqueue::store::postgres::PostgresStore;
use docqueue::telemetry::{TelemetryConfig, init_telemetry};
use docqueue::{GetOptions, Message, NewMessage, Queue, Release};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "docqueue", about = "Priority work queue on a document store")]
struct Cli {
    /// Collection to operate on (overrides QUEUE_COLLECTION)
    #[arg(long, global = true)]
    collection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message
    Send {
        /// JSON object payload
        payload: String,
        /// Seconds since the epoch before which the message cannot be claimed
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        earliest_get: i64,
        /// Priority (lower = sooner); defaults to the current time
        #[arg(long, allow_hyphen_values = true)]
        priority: Option<f64>,
    },
    /// Claim a message and print its handle
    Get {
        /// JSON query over payload fields
        #[arg(long, default_value = "{}")]
        query: String,
        /// Seconds the claim lasts before the message is released
        #[arg(long, default_value_t = 60, allow_hyphen_values = true)]
        reset_seconds: i64,
        /// Total milliseconds to wait for a message
        #[arg(long, default_value_t = 0)]
        wait_ms: i64,
        /// Milliseconds between polls (negative = default)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        poll_ms: i64,
    },
    /// Acknowledge (delete) a claimed message
    Ack {
        /// Message handle JSON as printed by `get`
        handle: String,
    },
    /// Replace a claimed message's payload and release it
    AckSend {
        /// Message handle JSON as printed by `get`
        handle: String,
        /// New JSON object payload
        payload: String,
        #[command(flatten)]
        release: ReleaseArgs,
    },
    /// Release a claimed message unchanged
    Requeue {
        /// Message handle JSON as printed by `get`
        handle: String,
        #[command(flatten)]
        release: ReleaseArgs,
    },
    /// Count messages
    Count {
        /// JSON query over payload fields
        #[arg(long, default_value = "{}")]
        query: String,
        /// Only claimed (true) or idle (false) messages
        #[arg(long)]
        running: Option<bool>,
    },
    /// Ensure indexes for a get query shape
    EnsureGetIndex {
        /// Payload keys filtered on, as field=1 or field=-1
        #[arg(long, value_parser = parse_index_key, allow_hyphen_values = true)]
        before: Vec<(String, i32)>,
        /// Payload keys sorted on after priority, as field=1 or field=-1
        #[arg(long, value_parser = parse_index_key, allow_hyphen_values = true)]
        after: Vec<(String, i32)>,
    },
    /// Ensure an index for a count query shape
    EnsureCountIndex {
        /// Payload keys, as field=1 or field=-1
        #[arg(long = "key", value_parser = parse_index_key, allow_hyphen_values = true)]
        keys: Vec<(String, i32)>,
        /// Lead the index with the running flag
        #[arg(long)]
        include_running: bool,
    },
    /// Release every claim whose deadline has passed
    ResetStuck,
}

#[derive(clap::Args)]
struct ReleaseArgs {
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    earliest_get: i64,
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    priority: f64,
    /// Keep the original creation time
    #[arg(long)]
    keep_created: bool,
}

impl From<ReleaseArgs> for Release {
    fn from(args: ReleaseArgs) -> Self {
        Release::default()
            .earliest_get(args.earliest_get)
            .priority(args.priority)
            .refresh_created(!args.keep_created)
    }
}

fn parse_index_key(raw: &str) -> Result<(String, i32), String> {
    let (field, direction) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected field=1 or field=-1, got {raw:?}"))?;
    let direction = direction
        .parse()
        .map_err(|e| format!("bad direction in {raw:?}: {e}"))?;
    Ok((field.to_string(), direction))
}

fn as_key_refs(keys: &[(String, i32)]) -> Vec<(&str, i32)> {
    keys.iter().map(|(k, d)| (k.as_str(), *d)).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "docqueue".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let collection = cli.collection.unwrap_or(config.collection);
    let store = PostgresStore::connect(config.database_url.expose_secret(), &collection).await?;
    let queue = Queue::new(store).with_default_poll_ms(config.poll_ms);

    match cli.command {
        Command::Send {
            payload,
            earliest_get,
            priority,
        } => {
            let mut new = NewMessage::new(serde_json::from_str(&payload)?).earliest_get(earliest_get);
            if let Some(priority) = priority {
                new = new.priority(priority);
            }
            let id = queue.send(new).await?;
            println!("{id}");
        }
        Command::Get {
            query,
            reset_seconds,
            wait_ms,
            poll_ms,
        } => {
            let options = GetOptions::new(reset_seconds)
                .wait_ms(wait_ms)
                .poll_ms(poll_ms);
            match queue.get(&serde_json::from_str(&query)?, options).await? {
                Some(message) => println!("{}", serde_json::to_string(&message)?),
                None => println!("No message."),
            }
        }
        Command::Ack { handle } => {
            let message = Message::from_document(serde_json::from_str(&handle)?)?;
            queue.ack(&message).await?;
            println!("Acked {}", message.id());
        }
        Command::AckSend {
            handle,
            payload,
            release,
        } => {
            let message = Message::from_document(serde_json::from_str(&handle)?)?;
            queue
                .ack_send(&message, serde_json::from_str(&payload)?, release.into())
                .await?;
            println!("Released {} with new payload", message.id());
        }
        Command::Requeue { handle, release } => {
            let message = Message::from_document(serde_json::from_str(&handle)?)?;
            queue.requeue(&message, release.into()).await?;
            println!("Requeued {}", message.id());
        }
        Command::Count { query, running } => {
            let count = queue.count(&serde_json::from_str(&query)?, running).await?;
            println!("{count}");
        }
        Command::EnsureGetIndex { before, after } => {
            queue
                .ensure_get_index(&as_key_refs(&before), &as_key_refs(&after))
                .await?;
            println!("Get indexes ensured on {collection}");
        }
        Command::EnsureCountIndex {
            keys,
            include_running,
        } => {
            queue
                .ensure_count_index(&as_key_refs(&keys), include_running)
                .await?;
            println!("Count index ensured on {collection}");
        }
        Command::ResetStuck => {
            let released = queue.reset_stuck().await?;
            println!("Released {released} expired claim(s)");
        }
    }

    Ok(())
}
