//! fastsocket: a multi-protocol socket server
//!
//! Serves on one port:
//! - Fast binary calls, in both directions
//! - HTTP/1.x requests
//! - Flash policy-file requests
//!
//! Features:
//! - Protocol detection from the first bytes of each connection
//! - Tiered action filters (authorization, global, class, method)
//! - Optional TLS on every connection
//! - Configuration via CLI arguments or TOML file

use async_trait::async_trait;
use fastsocket::config::Config;
use fastsocket::dispatch::{
    ActionContext, ActionTable, CallContext, DefaultResolver, Dispatcher, Filter,
};
use fastsocket::error::ActionError;
use fastsocket::protocols::{FastMiddleware, HttpMiddleware, PolicyMiddleware};
use fastsocket::runtime::{load_tls_acceptor, Listener};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Built-in calculator service.
struct Calc;

/// Logs the start and end of every call.
struct CallLog;

#[async_trait]
impl Filter for CallLog {
    fn order(&self) -> i32 {
        i32::MIN
    }

    async fn on_executing(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        debug!(
            session = ctx.call().session().id(),
            api = ctx.call().api(),
            id = ctx.call().id(),
            "Call started"
        );
        Ok(())
    }

    async fn on_executed(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        debug!(
            session = ctx.call().session().id(),
            api = ctx.call().api(),
            id = ctx.call().id(),
            "Call finished"
        );
        Ok(())
    }
}

fn actions() -> Result<ActionTable, Box<dyn std::error::Error>> {
    let table = ActionTable::builder()
        .global_filter(CallLog)
        .service::<Calc, _>(|svc| {
            svc.action("GetSum", |_: Arc<Calc>, _, (a, b, c): (i64, i64, i64)| async move {
                a.checked_add(b)
                    .and_then(|sum| sum.checked_add(c))
                    .ok_or_else(|| ActionError::failed("sum overflows"))
            })
            .action("Ping", |_: Arc<Calc>, _, (): ()| async move { Ok("pong") })
            .action("Elapsed", |_: Arc<Calc>, ctx: CallContext, (): ()| async move {
                // Round-trip a call back to the client to measure its latency
                let started = Instant::now();
                let _: String = ctx
                    .peer()
                    .invoke_api("Ping", ())
                    .await
                    .map_err(|e| ActionError::failed(e.to_string()))?;
                Ok(started.elapsed().as_micros() as u64)
            })
        })
        .build()?;
    Ok(table)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        tls = config.tls.is_some(),
        "Starting fastsocket server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    builder.build()?.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Arc::new(Dispatcher::new(
        actions()?,
        DefaultResolver::new().singleton(Calc),
    ));
    info!(actions = ?dispatcher.actions().names(), "Actions registered");

    let mut listener = Listener::new(config.listener_options());
    listener
        .use_middleware(PolicyMiddleware::flash())
        .use_middleware(HttpMiddleware::new())
        .use_middleware(
            FastMiddleware::new(dispatcher)
                .with_max_frame_len(config.max_frame_size)
                .with_call_timeout(config.call_timeout),
        );

    if let Some(tls) = &config.tls {
        listener = listener.with_tls(load_tls_acceptor(&tls.cert, &tls.key)?);
        info!(cert = %tls.cert.display(), "TLS enabled");
    }

    let server = listener.start(config.listen, config.backlog).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await;
    Ok(())
}
