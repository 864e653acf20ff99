//! ctfpool - CTF session manager daemon.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ctfpool::config::Config;
use ctfpool::docker::{ContainerRuntime, DockerRuntime};
use ctfpool::http::{self, AppState, SessionClient, REQUEST_DEADLINE};
use ctfpool::manager::{
    self, session_channels, Creator, Dispatcher, Reaper, ShutdownController,
};
use ctfpool::metrics::{
    NoOpObserver, PoolGauges, PrometheusObserver, SessionObserver, TrackingObserver,
};
use ctfpool::proxy;
use ctfpool::session::SessionFactory;

#[derive(Parser, Debug)]
#[command(name = "ctfpool")]
#[command(about = "Ephemeral SSH-reachable container sessions for CTF events")]
#[command(version)]
struct Args {
    /// Port on which the SSH reverse proxy listens. Clients connect here.
    #[arg(long, default_value = "50000")]
    ssh_port: String,

    /// Address the HTTP service binds to.
    #[arg(long, default_value = ":4000")]
    http_addr: String,

    /// Number of provisioned sessions kept ready in the background.
    #[arg(long, default_value_t = 15)]
    max_warm: usize,

    /// Number of sessions that can be simultaneously in use by clients.
    #[arg(long, default_value_t = 140)]
    max_active: usize,

    /// Lifetime of a session (in minutes) after which it expires.
    #[arg(long, default_value_t = 150)]
    lifetime_minutes: u64,

    /// Frequency (in minutes) with which expired sessions are checked for.
    #[arg(long, default_value_t = 10)]
    reap_interval_minutes: u64,

    /// Minimum time (in minutes) between requests from the same IP.
    #[arg(long, default_value_t = 5)]
    min_request_interval_minutes: u64,

    /// Run with more extensive logging.
    #[arg(long)]
    debug: bool,

    /// Disable the Prometheus instrumentation.
    #[arg(long)]
    no_instrumentation: bool,

    /// Image used for the SSH reverse proxy container.
    #[arg(long, default_value = "sshpiperd")]
    proxy_image: String,

    /// Tag for the entrypoint image built at startup.
    #[arg(long, default_value = "entrypoint")]
    entrypoint_image: String,

    /// Directory with the Dockerfile for the entrypoint image.
    #[arg(long, default_value = "./entrypoint")]
    entrypoint_src: String,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            ssh_port: self.ssh_port,
            http_addr: self.http_addr,
            max_warm: self.max_warm,
            max_active: self.max_active,
            lifetime_minutes: self.lifetime_minutes,
            reap_interval_minutes: self.reap_interval_minutes,
            min_request_interval_minutes: self.min_request_interval_minutes,
            debug: self.debug,
            no_instrumentation: self.no_instrumentation,
            proxy_image: self.proxy_image,
            entrypoint_image: self.entrypoint_image,
            entrypoint_src: self.entrypoint_src,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config();

    let default_filter = if config.debug {
        "ctfpool=debug,tower_http=debug"
    } else {
        "ctfpool=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("ctfpool - CTF session manager daemon - is initializing");

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect().context("connecting to the container runtime")?);

    // Materialize the entrypoint image before anything depends on it.
    runtime
        .build_image(Path::new(&config.entrypoint_src), &config.entrypoint_image)
        .await
        .context("building the entrypoint image")?;
    tracing::info!(tag = %config.entrypoint_image, "entrypoint image ready");

    // Bring up the SSH reverse proxy before the daemons: every session
    // container is attached to its network at creation time.
    let reverse_proxy = proxy::initialize(runtime.as_ref(), &config.proxy_image, &config.ssh_port)
        .await
        .context("initializing the SSH reverse proxy")?;

    let (backend, prometheus): (Arc<dyn SessionObserver>, Option<Arc<PrometheusObserver>>) =
        if config.no_instrumentation {
            tracing::info!("running without instrumentation metrics");
            (Arc::new(NoOpObserver), None)
        } else {
            let prometheus =
                Arc::new(PrometheusObserver::new().context("registering Prometheus metrics")?);
            (prometheus.clone(), Some(prometheus))
        };
    // Pool counters for the healthcheck are kept in front of the backend so
    // they exist in both instrumentation modes.
    let pool_gauges = Arc::new(PoolGauges::new());
    let observer: Arc<dyn SessionObserver> =
        Arc::new(TrackingObserver::new(pool_gauges.clone(), backend));

    let channels = session_channels(config.max_warm, config.max_active);
    let (shutdown_controller, shutdown_signal) = ShutdownController::new();

    let factory = SessionFactory::new(
        runtime.clone(),
        config.entrypoint_image.clone(),
        reverse_proxy.network_id.clone(),
        reverse_proxy.container_id.clone(),
    );

    let creator = Creator::new(
        factory,
        runtime.clone(),
        channels.warm_tx,
        shutdown_signal.clone(),
        observer.clone(),
    );
    let dispatcher = Dispatcher::new(
        channels.request_rx,
        channels.warm_rx,
        channels.active_tx,
        config.min_request_interval(),
        shutdown_signal.clone(),
        observer.clone(),
    );
    let reaper = Reaper::new(
        channels.active_rx,
        runtime.clone(),
        config.lifetime(),
        config.reap_interval(),
        shutdown_signal,
        observer.clone(),
    );

    let creator_task = tokio::spawn(creator.run());
    let dispatcher_task = tokio::spawn(dispatcher.run());
    let reaper_task = tokio::spawn(reaper.run());

    let outbound_ip = match http::outbound_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            tracing::error!(error = %e, "error while retrieving the outbound IP of the host");
            "<IP>".to_string()
        }
    };

    let state = AppState {
        sessions: SessionClient::new(channels.request_tx, REQUEST_DEADLINE),
        page_ctx: http::pages::PageContext {
            ssh_port: config.ssh_port.clone(),
            outbound_ip,
            lifetime_minutes: config.lifetime_minutes,
        },
        observer,
        pool_gauges,
        prometheus,
        started_at: tokio::time::Instant::now(),
    };

    let listen_addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding the HTTP listener to {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "starting the web HTTP server");
    tracing::info!("verify that your firewall permits outside traffic to the HTTP service");

    let (http_stop_tx, http_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let app = http::router(state);
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = http_stop_rx.await;
        })
        .await
    });

    wait_for_signal().await?;
    tracing::info!("shutdown signal received");

    // Close the ingress first so no new requests land in a half-drained
    // pool.
    let _ = http_stop_tx.send(());
    if let Err(e) = server_task.await? {
        tracing::error!(error = %e, "error in HTTP server shutdown");
    }

    // Cancel the daemons and wait for each to acknowledge.
    shutdown_controller.shutdown();
    creator_task.await.context("joining the creator daemon")?;
    let dispatcher = dispatcher_task
        .await
        .context("joining the dispatcher daemon")?;
    let reaper = reaper_task.await.context("joining the reaper daemon")?;
    tracing::info!("all daemons have shut down");

    // Reclaim every remaining session, then tear down the proxy.
    manager::shutdown::drain_sessions(runtime.as_ref(), dispatcher, reaper).await;
    if let Err(e) = proxy::teardown(runtime.as_ref(), &reverse_proxy).await {
        tracing::error!(error = %e, "error tearing down the reverse proxy");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM arrives.
async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing the SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
