use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use voltio_search::{
    AssistantConfig, CachedCatalog, EscalationSink, HttpCatalogService, HttpSearchService,
    InMemorySessionStore, LLMManager, LogEscalationSink, SearchOrchestrator, SynonymIndex,
    WebhookEscalationSink,
};

mod http_server;

const DEFAULT_BIND: &str = "127.0.0.1:3460";

/// First CLI argument, then `VOLTIO_CONFIG`, then the per-user config file if present.
fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VOLTIO_CONFIG").ok())
        .map(PathBuf::from)
        .or_else(|| {
            let default = AssistantConfig::default_path();
            default.exists().then_some(default)
        })
}

fn load_config() -> Result<AssistantConfig> {
    match config_path() {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            AssistantConfig::from_file(&path).map_err(|e| anyhow!(e))
        }
        None => {
            tracing::info!("No configuration file, using defaults");
            let mut config = AssistantConfig::default();
            config.apply_env_overrides();
            config.validate().map_err(|e| anyhow!(e))?;
            Ok(config)
        }
    }
}

fn build_orchestrator(config: AssistantConfig) -> Result<SearchOrchestrator> {
    let synonyms = match &config.synonyms_path {
        Some(path) => SynonymIndex::from_file(path).map_err(|e| anyhow!(e))?,
        None => SynonymIndex::builtin(),
    };

    let mut llm = LLMManager::new(config.llm.clone());
    if let Err(e) = llm.initialize() {
        tracing::warn!(error = %e, "LLM provider unavailable, running rule-based");
        llm = LLMManager::disabled();
    }

    let search_url = config
        .services
        .search_url
        .as_deref()
        .context("services.search_url is not configured (set VOLTIO_SEARCH_URL)")?;
    let catalog_url = config
        .services
        .catalog_url
        .as_deref()
        .context("services.catalog_url is not configured (set VOLTIO_CATALOG_URL)")?;

    let search = HttpSearchService::new(search_url, config.search.search_timeout())?;
    let catalog = CachedCatalog::new(
        Arc::new(HttpCatalogService::new(catalog_url, config.search.catalog_timeout())?),
        config.catalog_cache_size,
    );
    let sink: Arc<dyn EscalationSink> = match &config.services.escalation_webhook {
        Some(url) => Arc::new(WebhookEscalationSink::new(url, config.search.catalog_timeout())?),
        None => {
            tracing::info!("No escalation webhook configured, hand-offs are only logged");
            Arc::new(LogEscalationSink)
        }
    };

    Ok(SearchOrchestrator::new(
        config,
        Arc::new(llm),
        Arc::new(synonyms),
        Arc::new(search),
        Arc::new(catalog),
        sink,
        Arc::new(InMemorySessionStore::new()),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber so tracing::info!/debug!/warn!/error! produce output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = load_config()?;
    let orchestrator = build_orchestrator(config)?;

    let addr = std::env::var("VOLTIO_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    http_server::start_server(Arc::new(orchestrator), &addr).await
}
