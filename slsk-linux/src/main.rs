// Soulseek peer daemon: accepts peer connections and feeds them to slsk-core.

mod config;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use slsk_core::{Client, SearchOptions, SearchSession};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut search_text = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("slsk-linux {}", VERSION);
                return Ok(());
            }
            "--search" => search_text = Some(args.next().context("--search needs a query")?),
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    let cfg = config::load()?;
    init_tracing(&cfg.log_filter);

    let client = Arc::new(Client::new());
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
            .await
            .with_context(|| format!("binding peer port {}", cfg.listen_port))?;
        info!(port = cfg.listen_port, username = %cfg.username, "listening for peers");

        let shutdown = CancellationToken::new();
        let transport = tokio::spawn(transport::run_transport(
            client.clone(),
            listener,
            cfg.max_frame_len,
            shutdown.clone(),
        ));

        if let Some(text) = search_text {
            let session = register_search(&client, &text, cfg.search.clone())?;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => session.cancel(),
                    responses = session.wait_for_completion() => {
                        for r in &responses {
                            info!(username = %r.username, files = r.file_count(), "search result");
                        }
                        info!(state = ?session.state(), responses = responses.len(), "search finished");
                    }
                }
            });
        }

        shutdown_signal().await?;
        info!("shutting down");
        shutdown.cancel();
        transport.await??;
        Ok::<(), anyhow::Error>(())
    })
}

/// Register a search that collects responses peers deliver for its token.
/// The daemon has no server connection, so the server request is built and
/// dropped; nothing is sent.
fn register_search(
    client: &Client,
    text: &str,
    options: SearchOptions,
) -> anyhow::Result<SearchSession> {
    let (session, request) = client.create_search(text, None, options, None)?;
    info!(
        token = session.token(),
        request_len = request.len(),
        "search registered locally; request not sent (no server connection)"
    );
    Ok(session)
}

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
