//! Aggregator binary: HTTP front door for TDQL queries (C9-C11).

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::{Deserialize, Serialize};
use skvoz_core::aggregate::{AggregatorEngine, FileSource, TsFileSource};
use skvoz_core::aggregate::{engine::run_query, GroupKey, Row};
use skvoz_core::config::AggregatorConfig;
use skvoz_core::error::CoreError;
use std::sync::Arc;

#[derive(Clone)]
struct AggregatorState {
    engine: Arc<AggregatorEngine>,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct QueryLine<'a>(&'a Option<GroupKey>, &'a Vec<Row>);

async fn healthz() -> &'static str {
    "ok"
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::LexError(_) | CoreError::SyntaxError(_) | CoreError::InvalidSource(_) => {
            StatusCode::BAD_REQUEST
        }
        CoreError::EvalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `POST /query`, body `query=<TDQL>`. Streams one JSON object per line:
/// `[groupKey | null, [rows]]`, mirroring `AggregatorRequestHandler.tdql_query`.
async fn query(State(state): State<AggregatorState>, Form(request): Form<QueryRequest>) -> Response {
    match run_query(&state.engine, &request.query) {
        Ok(results) => {
            let mut body = String::new();
            for (group, rows) in &results {
                match serde_json::to_string(&QueryLine(group, rows)) {
                    Ok(line) => {
                        body.push_str(&line);
                        body.push('\n');
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "failed to serialize query result row");
                        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
                    }
                }
            }
            body.into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, query = %request.query, "query failed");
            (status_for(&err), err.to_string()).into_response()
        }
    }
}

fn build_engine(config: &AggregatorConfig) -> AggregatorEngine {
    let mut engine = AggregatorEngine::default();
    engine.add_source("file".to_string(), Box::new(FileSource));
    engine.add_source("tsfile".to_string(), Box::new(TsFileSource::new(config.data_dir.clone())));
    engine.add_source("key".to_string(), Box::new(TsFileSource::new(config.data_dir.clone())));
    engine
}

fn router(state: AggregatorState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/query", post(query))
        .with_state(state)
}

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,skvoz_aggregator=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AggregatorConfig::from_env()?;
    init_tracing()?;

    let state = AggregatorState {
        engine: Arc::new(build_engine(&config)),
    };

    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "aggregator HTTP listening");
    let app = router(state);
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {}
    }

    Ok(())
}
