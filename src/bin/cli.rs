use clap::Parser;
use respite::config::{DEFAULT_HOST, DEFAULT_PORT};
use respite::{Config, Context, Error, Request, SubscriptionKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(about = "Send a command to a Redis server and print the reply")]
struct Args {
    /// Server hostname
    #[arg(short = 'H', long, env = "REDIS_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(short, long, env = "REDIS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Command name followed by its arguments
    #[arg(required = true, num_args = 1..)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();
    let mut ctx = Context::new(Config::new(args.host, args.port)?);

    let (name, rest) = args.command.split_at(1);
    let kind = match name[0].to_lowercase().as_str() {
        "subscribe" => Some(SubscriptionKind::Channel),
        "psubscribe" => Some(SubscriptionKind::Pattern),
        _ => None,
    };

    match kind {
        Some(kind) => subscribe(&ctx, kind, rest).await,
        None => {
            let request = Request::new(name[0].as_str()).args(rest);
            let reply = ctx.send(None, request).await;
            ctx.close().await;

            match reply {
                Ok(reply) => println!("{}", reply),
                Err(e) if e.is_server_error() => println!("(error) {}", e.root()),
                Err(e) => return Err(e),
            }
            Ok(())
        }
    }
}

async fn subscribe(ctx: &Context, kind: SubscriptionKind, keys: &[String]) -> Result<(), Error> {
    let connection = ctx.pubsub_connect().await?;
    info!("Connected to {}", connection.peer_addr());

    // Merge every subscription into one stream of (key, payload).
    let (tx, mut rx) = mpsc::unbounded_channel();
    for key in keys {
        let mut subscription = connection.subscribe(key.as_str(), kind).await?;
        let tx = tx.clone();
        tokio::spawn(async move {
            let key = String::from_utf8_lossy(subscription.key()).to_string();
            while let Some(payload) = subscription.recv().await {
                if tx.send((key.clone(), payload)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    while let Some((key, payload)) = rx.recv().await {
        println!("{}: {}", key, payload);
    }

    info!("Subscription stream ended");
    connection.disconnect().await;
    Ok(())
}
