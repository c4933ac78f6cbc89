use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mobile_core::auth::generate_token;
use mobile_core::{AttachPtyFactory, RuntimeConfig, TmuxGateway};
use mobile_server::Broker;

#[derive(Parser)]
#[command(name = "tmux-mobile", about = "Control tmux from a phone browser")]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value = "8484")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Optional password required in addition to the token
    #[arg(long)]
    password: Option<String>,

    /// Session created when no base session exists yet
    #[arg(long, default_value = "main")]
    session: String,

    /// Scrollback lines returned when a capture request omits a count
    #[arg(long, default_value = "2000")]
    scrollback_lines: u32,

    /// State polling interval in milliseconds
    #[arg(long, default_value = "2500")]
    poll_interval_ms: u64,

    /// Access token; a random one is generated when omitted
    #[arg(long)]
    token: Option<String>,

    /// Directory with the built frontend (index.html + assets)
    #[arg(long, default_value = "frontend/dist")]
    frontend_dir: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ServeArgs::parse();
    let token = args.token.clone().unwrap_or_else(generate_token);

    let config = RuntimeConfig {
        port: args.port,
        host: args.host,
        password: args.password,
        default_session: args.session,
        scrollback_lines: args.scrollback_lines,
        poll_interval_ms: args.poll_interval_ms,
        token: token.clone(),
        frontend_dir: args.frontend_dir,
    };

    let broker = Broker::new(
        Arc::new(TmuxGateway::new()),
        Arc::new(AttachPtyFactory::new()),
        config,
    );

    println!("access token: {}", token);

    if let Err(e) = mobile_server::serve(broker).await {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}
