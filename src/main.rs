mod api;
mod chat_template;
mod config;
mod device;
mod error;
mod generation;
mod model;
mod sampling;
mod service;
mod tokenizer;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::{Args, ServiceConfig};
use crate::service::InferenceService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "adapter_inference_server=info,tower_http=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    println!(
        r#"
╔═══════════════════════════════════════════════════════════════╗
║           Adapter Inference Server                            ║
║           base model + LoRA adapter, powered by Candle        ║
╚═══════════════════════════════════════════════════════════════╝
"#
    );

    info!("Loading model: {} with adapter {}", args.model, args.adapter);
    let service_config = ServiceConfig::from(&args);
    let service = InferenceService::init(&service_config).map_err(|e| {
        error!("Startup failed: {}", e);
        e
    })?;

    if let Some(prompt) = &args.prompt {
        run_single_prompt(&service, prompt).await?;
        service.shutdown().await;
    } else {
        run_server(service, &args).await?;
    }

    Ok(())
}

async fn run_single_prompt(service: &InferenceService, prompt: &str) -> anyhow::Result<()> {
    println!("\n📝 Prompt: {}", prompt);
    println!("{}", "─".repeat(60));

    let output = service.generate(prompt).await?;

    println!("\n🤖 Response:\n{}", output.text);
    println!("{}", "─".repeat(60));
    println!(
        "📊 Stats: {} tokens, {:.2} tokens/sec, {}ms total, finish_reason={}",
        output.tokens.len(),
        output.tokens_per_second,
        output.total_time_ms,
        output.finish_reason.as_str()
    );

    Ok(())
}

async fn run_server(service: InferenceService, args: &Args) -> anyhow::Result<()> {
    let state = Arc::new(AppState { service });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = api::create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::new(args.host.parse()?, args.port);

    println!(
        r#"
🚀 Server starting...
   ├─ Address: http://{}
   ├─ Model: {}
   ├─ Adapter: {}
   └─ Endpoints:
      ├─ GET  /health   - Health check
      └─ POST /generate - Text generation

Press Ctrl+C to stop the server.
"#,
        addr, args.model, args.adapter
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining requests");
}
