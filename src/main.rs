use std::{str::FromStr, sync::Arc};

use anyhow::{Context, Error};
use axum::{
    Router,
    extract::State,
    middleware::from_fn_with_state,
    routing::{any, get},
};
use clap::Parser;
use http::Method;
use prometheus::{Registry, TextEncoder};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use tollcache::{
    cache::{Cache, CacheBuilder, CacheStore, RedisStore, middleware as cache_middleware},
    cli,
    http::{
        Client, ReqwestClient,
        client::Options as ClientOptions,
        headers::X_API_KEY,
        proxy::{KeyRewrite, UpstreamProxy, handler as proxy_handler},
    },
    store::{DurableStore, PgStore},
    tasks::TaskManager,
    tollgate::{
        self, Gate, KeyValueGate, KvStore, MetaStore, QuotaManager, RedisKv, RedisMetaStore,
        RedisScripts, TenantKeyExtractor, Tollgate, UsageArchiver,
        middleware as tollgate_middleware, quota::ScriptExecutor,
    },
};

#[derive(Parser)]
#[command(name = "tollcache", about = "Caching, key-authenticating reverse proxy")]
struct Cli {
    #[command(flatten)]
    http: cli::HttpServer,

    #[command(flatten)]
    cache: cli::CacheConfig,

    #[command(flatten)]
    redis: cli::RedisConfig,

    #[command(flatten)]
    postgres: cli::PostgresConfig,

    #[command(flatten)]
    tollgate: cli::TollgateConfig,

    #[command(flatten)]
    upstream: cli::UpstreamConfig,

    /// Log level filter, e.g. "info" or "tollcache=debug"
    #[clap(env, long, default_value = "info")]
    log_level: String,
}

struct Deps {
    meta: Arc<dyn MetaStore>,
    scripts: Arc<dyn ScriptExecutor>,
    client: Arc<dyn Client>,
    cache: Arc<Cache>,
    extractor: TenantKeyExtractor,
    tollgate_metrics: tollgate::Metrics,
}

/// One proxied service: its own tollgate (quota is per service) behind the
/// shared cache, in front of its upstream
async fn service_router(
    deps: &Deps,
    cli: &Cli,
    service_name: &str,
    upstream: Url,
    rewrite: Option<KeyRewrite>,
) -> Result<Router, Error> {
    let quota = QuotaManager::new(deps.scripts.clone(), deps.meta.clone(), service_name)
        .await
        .with_context(|| format!("unable to set up quota manager for '{service_name}'"))?;

    let gate: Arc<dyn Gate> = Arc::new(KeyValueGate::new(deps.meta.clone(), quota));
    let tollgate = Arc::new(Tollgate::new(
        gate,
        deps.extractor,
        deps.tollgate_metrics.clone(),
    ));

    let proxy = Arc::new(UpstreamProxy::new(
        upstream,
        &format!("/{service_name}"),
        rewrite,
        deps.client.clone(),
        cli.cache.cache_max_item_size,
        cli.cache.cache_body_timeout,
    ));

    Ok(Router::new()
        .route(&format!("/{service_name}/{{*rest}}"), any(proxy_handler))
        .with_state(proxy)
        .layer(from_fn_with_state(
            tollgate,
            tollgate_middleware::<TenantKeyExtractor>,
        ))
        .layer(from_fn_with_state(deps.cache.clone(), cache_middleware::middleware)))
}

async fn metrics_handler(State(registry): State<Registry>) -> String {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .unwrap_or_default()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("unable to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let registry = Registry::new();

    // Process-wide Redis & PostgreSQL handles
    let redis_client =
        redis::Client::open(cli.redis.redis_url.as_str()).context("invalid Redis URL")?;
    let conn = redis_client
        .get_connection_manager()
        .await
        .context("unable to connect to Redis")?;

    let pg = PgStore::connect(
        &cli.postgres.postgres_url,
        cli.postgres.postgres_max_connections,
    )
    .await
    .context("unable to connect to PostgreSQL")?;
    let db: Arc<dyn DurableStore> = Arc::new(pg);

    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::new(conn.clone()));
    let meta: Arc<dyn MetaStore> = Arc::new(RedisMetaStore::new(kv.clone(), db.clone()));
    let scripts: Arc<dyn ScriptExecutor> = Arc::new(RedisScripts::new(conn.clone()));

    let methods = cli
        .cache
        .cache_methods
        .iter()
        .map(|m| Method::from_str(m))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid cacheable method")?;

    let store: Arc<dyn CacheStore> = Arc::new(RedisStore::new(conn));
    let cache = CacheBuilder::new(store)
        .ttl(cli.cache.cache_ttl)
        .methods(&methods)
        .refresh_param(&cli.cache.cache_refresh_param)
        .expires_header(cli.cache.cache_expires_header)
        .max_item_size(cli.cache.cache_max_item_size)
        .body_timeout(cli.cache.cache_body_timeout)
        .registry(&registry)
        .build()
        .context("unable to build cache")?;
    let cache = Arc::new(cache);

    let client: Arc<dyn Client> =
        Arc::new(ReqwestClient::new(ClientOptions::default()).context("unable to build client")?);

    let deps = Deps {
        meta: meta.clone(),
        scripts,
        client,
        cache,
        extractor: cli.tollgate.tollgate_extractor.into(),
        tollgate_metrics: tollgate::Metrics::new(&registry),
    };

    let reader = service_router(
        &deps,
        &cli,
        &cli.upstream.reader_service,
        cli.upstream.reader_url.clone(),
        Some(KeyRewrite::Bearer(cli.upstream.reader_keys.clone())),
    )
    .await?;

    let search = service_router(
        &deps,
        &cli,
        &cli.upstream.search_service,
        cli.upstream.search_url.clone(),
        Some(KeyRewrite::Header(X_API_KEY, cli.upstream.search_keys.clone())),
    )
    .await?;

    let app = reader
        .merge(search)
        .route("/metrics", get(metrics_handler).with_state(registry.clone()));

    let mut tasks = TaskManager::new();
    tasks.add(
        "usage_archiver",
        Arc::new(UsageArchiver::new(
            kv,
            db,
            meta,
            cli.tollgate.archive_interval,
            &registry,
        )),
    );
    tasks.start();

    let listener = TcpListener::bind(cli.http.listen)
        .await
        .with_context(|| format!("unable to bind to {}", cli.http.listen))?;
    info!("listening on {}", cli.http.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    warn!("shutting down");
    tasks.stop().await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).context("invalid log level")?)
        .init();

    run(cli).await
}
