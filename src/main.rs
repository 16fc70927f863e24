use std::sync::Arc;

use outpost::agent::Agent;
use outpost::config::AgentConfig;
use outpost::transport::HttpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; OUTPOST_LOG_DIR adds a daily rolling file writer.
    let _log_guard = init_tracing();

    let config = AgentConfig::from_env()?;

    eprintln!("outpost v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Session: {}", config.session_id);
    eprintln!("   Server: {}", config.server);
    eprintln!(
        "   Check-in: {}s ± {:.0}% jitter, lost limit {}",
        config.delay,
        config.jitter * 100.0,
        config.lost_limit
    );
    if let Some(kill_date) = config.kill_date {
        eprintln!("   Kill date: {kill_date}");
    }
    if let Some(hours) = config.working_hours {
        eprintln!("   Working hours: {}-{}", hours.start, hours.end);
    }
    eprintln!("   Interpreter: {}\n", config.interpreter);

    let transport = Arc::new(HttpTransport::new(&config)?);
    let agent = Agent::new(config, transport);

    let reason = agent.run().await;
    tracing::info!(%reason, "Agent exited");
    Ok(())
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    if let Ok(log_dir) = std::env::var("OUTPOST_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(log_dir, "outpost.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init();
        None
    }
}
