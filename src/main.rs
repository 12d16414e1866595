mod api;
mod config;
mod core;
mod error;
mod infra;
mod models;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::nlq::nlq_query;
use crate::api::query::{raw_query, reset_schema, structured_query, table_schema, template_query};
use crate::config::GateConfig;
use crate::core::external::PayloadProducer;
use crate::core::pipeline::QueryEngine;
use crate::core::profiles::Vocabulary;
use crate::core::schema_cache::SchemaCache;
use crate::infra::llm::OpenAiProducer;
use crate::infra::warehouse::Warehouse;

pub mod ax_state {
    use super::*;
    pub struct AppState {
        pub engine: QueryEngine,
        pub warehouse: Arc<Warehouse>,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GateConfig::from_env()?;

    // 白名单里每张表都必须有策略记录，缺失属于程序缺陷，直接拒绝启动
    let vocab = Vocabulary::standard()?;
    vocab.ensure_covers(&config.allow_list)?;

    let warehouse = Arc::new(Warehouse::connect(&config.warehouse_url, config.query_timeout).await?);
    let cache = SchemaCache::new(
        config.allow_list.clone(),
        config.schema_cache_ttl,
        warehouse.clone(),
    );

    let producer: Option<Arc<dyn PayloadProducer>> = config.llm.clone().map(|llm| {
        info!("LLM 载荷生产方已启用: {} @ {}", llm.model, llm.base_url);
        Arc::new(OpenAiProducer::new(llm)) as Arc<dyn PayloadProducer>
    });

    let engine = QueryEngine::new(vocab, cache, config.limits, config.default_table.clone(), producer);
    let state = Arc::new(ax_state::AppState { engine, warehouse });

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/nlq", post(nlq_query))
        .route("/query_structured", post(structured_query))
        .route("/query", post(raw_query))
        .route("/template/{name}", post(template_query))
        .route("/schema", delete(reset_schema))
        .route("/schema/{table}", get(table_schema))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!(
        "查询网关运行在 http://{} (允许表: {})",
        config.bind_addr,
        config.allow_list.tables().join(", ")
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
