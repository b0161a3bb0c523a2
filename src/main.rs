// ABOUTME: Main entry point for the tether MCP server and its one-shot commands
// ABOUTME: Initializes logging, config and the Matrix engine, then serves MCP or runs a command

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tether::mcp::{self, McpState};
use tether_core::{Config, Engine, Error, HttpHomeserver, LoggingHandler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Matrix rooms as send and wait-for-reply tools over MCP", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the MCP server (stdio unless --http is given)
    Serve {
        /// Serve POST /mcp on this address instead of stdio
        #[arg(long)]
        http: Option<String>,
    },

    /// Verify configuration: log in, sync once, list rooms, log out
    Check,

    /// Send one message
    Send {
        /// Room id or alias (defaults to the configured room)
        #[arg(long)]
        room: Option<String>,

        /// Fail instead of joining a room the account is not in
        #[arg(long)]
        no_join: bool,

        message: String,
    },

    /// Send a message and wait for the first reply
    Wait {
        #[arg(long)]
        room: Option<String>,

        /// Seconds to wait (defaults to wait.default_timeout_secs)
        #[arg(long)]
        timeout: Option<f64>,

        /// Only accept a reply from this user id
        #[arg(long)]
        from: Option<String>,

        message: String,
    },

    /// List joined rooms
    Rooms,
}

fn init_logging(json: bool) {
    // stdout carries MCP frames; logs go to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!(panic = %panic_info, "tether panicked");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();
    init_logging(cli.log_json);

    dotenvy::dotenv().ok();
    let config = Config::load()?;

    tracing::info!(
        homeserver = %config.matrix.homeserver,
        username = %config.matrix.username,
        default_room = ?config.matrix.default_room,
        "Configuration loaded"
    );

    let engine = connect(config).await?;
    let outcome = match cli.command.unwrap_or(Commands::Serve { http: None }) {
        Commands::Serve { http } => serve(&engine, http).await,
        Commands::Check => check(&engine).await,
        Commands::Send {
            room,
            no_join,
            message,
        } => {
            let room = pick_room(&engine, room)?;
            engine
                .send_message(&room, &message, !no_join)
                .await
                .map(|sent| println!("Message sent to {} ({})", room, sent.event_id))
                .with_context(|| format!("Failed to send to {}", room))
        }
        Commands::Wait {
            room,
            timeout,
            from,
            message,
        } => wait(&engine, room, timeout, from, message).await,
        Commands::Rooms => {
            first_sync(&engine).await?;
            println!("{}", mcp::format_room_list(&engine.list_rooms()));
            Ok(())
        }
    };

    engine.stop().await;
    outcome
}

async fn connect(config: Config) -> Result<Arc<Engine>> {
    let transport = HttpHomeserver::new(&config.matrix.homeserver)?;
    let engine = Engine::connect(config, Arc::new(transport))
        .await
        .context("Failed to log in to the homeserver")?;
    engine.add_handler(Arc::new(LoggingHandler));
    engine.start()?;
    tracing::info!(user_id = %engine.user_id(), "Matrix engine running");
    Ok(Arc::new(engine))
}

fn pick_room(engine: &Engine, room: Option<String>) -> Result<String> {
    room.or_else(|| engine.default_room().map(str::to_string))
        .context("No room given and no default room configured (set MATRIX_ROOMID)")
}

/// Wait until the initial sync has populated the room cache
async fn first_sync(engine: &Engine) -> Result<()> {
    while engine.sync_progress().batches < 1 {
        engine.next_sync().await.context("Initial sync failed")?;
    }
    Ok(())
}

async fn serve(engine: &Arc<Engine>, http: Option<String>) -> Result<()> {
    let state = Arc::new(McpState::new(Arc::clone(engine)));
    let shutdown = CancellationToken::new();

    let server_shutdown = shutdown.clone();
    let server = async move {
        match http {
            Some(addr) => mcp::serve_http(state, &addr, server_shutdown).await,
            None => {
                tracing::info!("Serving MCP on stdio");
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                mcp::serve_stdio(state, stdin, tokio::io::stdout(), server_shutdown).await
            }
        }
    };

    let outcome = tokio::select! {
        served = server => served,
        closed = engine.closed() => closed.context("Matrix engine stopped"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    };
    shutdown.cancel();
    outcome
}

async fn check(engine: &Engine) -> Result<()> {
    println!("Logged in as {}", engine.user_id());
    first_sync(engine).await?;
    println!("Initial sync complete");
    println!("{}", mcp::format_room_list(&engine.list_rooms()));
    match engine.default_room() {
        Some(room) => {
            let room_id = engine
                .rooms()
                .resolve(room)
                .await
                .with_context(|| format!("Default room {} does not resolve", room))?;
            println!("Default room {} -> {}", room, room_id);
        }
        None => println!("No default room configured (MATRIX_ROOMID)"),
    }
    Ok(())
}

async fn wait(
    engine: &Engine,
    room: Option<String>,
    timeout: Option<f64>,
    from: Option<String>,
    message: String,
) -> Result<()> {
    let room = pick_room(engine, room)?;
    let timeout = match timeout {
        Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs)
            .map_err(|_| anyhow::anyhow!("--timeout {} is too large", secs))?,
        Some(secs) => anyhow::bail!("--timeout must be a positive number of seconds, got {}", secs),
        None => engine.default_timeout(),
    };

    match engine
        .wait_for_response(&room, &message, timeout, from.as_deref())
        .await
    {
        Ok(reply) => {
            println!("Received response from {}: {}", reply.sender, reply.body);
            Ok(())
        }
        Err(Error::Timeout(_)) => anyhow::bail!(
            "Timeout: No response received within {} seconds",
            timeout.as_secs_f64()
        ),
        Err(e) => Err(e).with_context(|| format!("Waiting in {} failed", room)),
    }
}
