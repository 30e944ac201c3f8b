use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use triage_core::Settings;
use triage_core::egress::render_rules_for_webhook;
use triage_core::exec::ProcessRunner;
use triage_core::exec::TokioProcessRunner;
use triage_core::installer::NsjailPipInstaller;
use triage_core::orchestrator::TriageOrchestrator;
use triage_core::orchestrator::WorkerHandler;
use triage_core::rate_limit::FixedWindowRateLimiter;
use triage_core::sandbox::NsjailSandboxExecutor;
use triage_core::service::SubmissionService;
use triage_core::webhook::DiscordWebhookClient;
use triage_core::worker_pool::WorkerPool;
use triage_server::AppState;
use triage_server::create_router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    // The egress ruleset is applied out-of-band; render and log it so
    // operators can diff what the firewall should be enforcing.
    match render_rules_for_webhook(&settings.discord_webhook_url, &settings.dns_resolvers) {
        Ok(rules) => tracing::info!("egress ruleset:\n{rules}"),
        Err(err) => tracing::warn!("egress ruleset rendering failed: {err}"),
    }

    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
    let installer = Arc::new(NsjailPipInstaller::new(
        Arc::clone(&runner),
        settings.clone(),
    ));
    let sandbox = Arc::new(NsjailSandboxExecutor::new(
        Arc::clone(&runner),
        settings.clone(),
    ));
    let webhook = Arc::new(DiscordWebhookClient::new(
        settings.discord_webhook_url.clone(),
    ));
    let orchestrator = Arc::new(TriageOrchestrator::new(installer, sandbox, webhook));
    let handler = Arc::new(WorkerHandler::new(orchestrator));

    let pool = Arc::new(WorkerPool::new(
        settings.max_concurrency,
        settings.queue_limit,
        handler,
    ));
    pool.start().await;

    let limiter = FixedWindowRateLimiter::new(
        settings.per_ip_rate_limit,
        Duration::from_secs(settings.per_ip_rate_window_sec),
    );
    let service = Arc::new(SubmissionService::new(
        limiter,
        Arc::clone(&pool),
        settings.package_denylist.clone(),
    ));

    tracing::info!(
        "app initialized max_concurrency={} queue_limit={} timeout_sec={}",
        settings.max_concurrency,
        settings.queue_limit,
        settings.run_timeout_sec
    );

    let state = AppState {
        settings: Arc::new(settings),
        service,
    };
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {bind_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain accepted jobs before exiting.
    pool.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install ctrl-c handler: {err}");
    }
    tracing::info!("shutdown requested");
}
