use std::sync::Arc;

use chrono::TimeDelta;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use persona_turns::agent::{HttpImageGenerator, ModelRegistry};
use persona_turns::cache::memory::InMemoryCache;
use persona_turns::cache::LeafCache;
use persona_turns::config::Config;
use persona_turns::db::conversation_repository::PgConversationRepository;
use persona_turns::db::guard_repository::PgGuardRepository;
use persona_turns::db::job_repository::PgJobRepository;
use persona_turns::db::ledger_repository::PgLedgerRepository;
use persona_turns::db::memory::MemoryStore;
use persona_turns::db::message_repository::PgMessageRepository;
use persona_turns::db::{ConversationStore, GuardStore, JobStore, LedgerStore, MessageStore};
use persona_turns::routes::{router, AppState};
use persona_turns::service::generation::{GenerationOrchestrator, GenerationSettings};
use persona_turns::service::image_jobs::ImageJobRunner;
use persona_turns::service::ledger::Ledger;
use persona_turns::service::message_tree::MessageTree;
use persona_turns::service::rate_guard::{RateGuard, FREE_MODEL_BUCKET, IMAGE_BUCKET};

const IMAGE_WORKERS: usize = 2;

struct Stores {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    ledger: Arc<dyn LedgerStore>,
    guard: Arc<dyn GuardStore>,
    jobs: Arc<dyn JobStore>,
}

async fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    let Some(database_url) = &config.database_url else {
        warn!("DATABASE_URL not set, using in-memory stores (data is lost on restart)");
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            conversations: store.clone(),
            messages: store.clone(),
            ledger: store.clone(),
            guard: store.clone(),
            jobs: store,
        });
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database connection established and migrations applied");

    Ok(Stores {
        conversations: Arc::new(PgConversationRepository::new(pool.clone())),
        messages: Arc::new(PgMessageRepository::new(pool.clone())),
        ledger: Arc::new(PgLedgerRepository::new(pool.clone())),
        guard: Arc::new(PgGuardRepository::new(pool.clone())),
        jobs: Arc::new(PgJobRepository::new(pool)),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persona_turns=debug,turn_outcome=info,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let stores = open_stores(&config).await?;

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let window = TimeDelta::seconds(config.rate_window_secs);
    let guard = RateGuard::new(stores.guard, config.max_concurrent_jobs)
        .with_bucket(FREE_MODEL_BUCKET, config.free_model_requests_per_window, window)
        .with_bucket(IMAGE_BUCKET, config.image_requests_per_window, window);
    let ledger = Ledger::new(stores.ledger, config.daily_free_tokens);
    let leaf_cache = LeafCache::new(Arc::new(InMemoryCache::default()), config.leaf_cache_ttl);
    let tree = MessageTree::new(stores.conversations, stores.messages, leaf_cache);

    let models = ModelRegistry::from_config(&config)?;
    info!("Registered models: {}", models.ids().join(", "));

    let settings = GenerationSettings {
        max_context_messages: config.max_context_messages,
        stream_timeout: config.stream_timeout,
    };
    let mut turns =
        GenerationOrchestrator::new(tree, ledger.clone(), guard.clone(), Arc::new(models), settings);

    if let Some(image_url) = &config.image_api_base_url {
        let generator = HttpImageGenerator::new(image_url, config.openai_api_key.clone());
        let runner = ImageJobRunner::new(
            stores.jobs,
            ledger,
            guard,
            Arc::new(generator),
            config.image_job_cost,
            IMAGE_WORKERS,
        );
        turns = turns.with_image_jobs(runner);
        info!("Image side jobs enabled via {image_url}");
    }

    let app = router(AppState { turns });

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
