/*
 * 5D Labs Build Platform - Build Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Build Controller Service - Kubernetes Controller for `Build` CRDs
//!
//! This service:
//! - Watches `Build` resources and runs each one as a pod
//! - Watches build pods and wakes the tasks waiting on them
//! - Fails builds that exceed their timeout
//! - Serves health and readiness endpoints

use anyhow::Context as _;
use axum::{extract::State, response::Json, routing::get, Router};
use build_controller::builder::{ClusterBuilder, CompletionRegistry};
use build_controller::resources::EntrypointResolver;
use build_controller::tasks::{
    config::ControllerConfig, run_build_controller, Context, ErrorBackoff, TimeoutHandler,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    config: Arc<ControllerConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting 5D Labs Build Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_controller_config();
    config.validate().context("invalid controller configuration")?;
    let config = Arc::new(config);

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let resolver = Arc::new(EntrypointResolver::new(
        config.registry.insecure_registries.clone(),
    )?);
    let registry = Arc::new(CompletionRegistry::new());
    let builder = Arc::new(ClusterBuilder::new(
        client.clone(),
        config.images.clone(),
        resolver.clone(),
        registry.clone(),
    ));

    let context = Arc::new(Context {
        client: client.clone(),
        config: config.clone(),
        builder: builder.clone(),
        registry,
        resolver,
        backoff: ErrorBackoff::default(),
    });

    let shutdown = CancellationToken::new();

    let controller_handle = tokio::spawn(async move {
        if let Err(e) = run_build_controller(context).await {
            error!("Controller error: {}", e);
        }
    });

    let watch_handle = {
        let namespace = config.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = builder.watch_pods(namespace).await {
                error!("Pod watch error: {}", e);
            }
        })
    };

    let timeout_handle = {
        let handler = TimeoutHandler::new(
            client.clone(),
            config.namespace.clone(),
            config.timeout.check_interval(),
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move { handler.run(shutdown).await })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            ),
        )
        .with_state(AppState {
            config: config.clone(),
        });

    let address = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Build controller HTTP server listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = timeout_handle.await {
        warn!("Timeout handler task failed: {}", e);
    }
    controller_handle.abort();
    watch_handle.abort();
    info!("Build controller stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,build_controller=debug".into());
    let json_output = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    let (json_layer, text_layer) = if json_output {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "build-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "build-controller",
        "version": env!("CARGO_PKG_VERSION"),
        "namespace": state.config.namespace.as_deref().unwrap_or("*")
    }))
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or("/config/config.yaml");

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
