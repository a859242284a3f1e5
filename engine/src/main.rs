use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use orra_core::{Engine, EngineConfig};
use orra_providers::{
    DefaultPlanValidator, Embedder, EmbeddingsSettings, FeatureHashEmbedder, HttpEmbedder,
    LlmSettings, OpenAiCompatGenerator,
};
use orra_server::{serve, AppState};
use orra_store::KvStore;

#[derive(Parser, Debug)]
#[command(name = "orra-engine")]
#[command(about = "Orra plan engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8005)]
        port: u16,
        #[arg(long, env = "ORRA_STATE_DIR")]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = orra_observability::default_logs_dir(&state_dir);
            let _log_guard =
                orra_observability::init(&orra_observability::LoggingOptions::new(&logs_dir))?;

            if std::env::var("ANONYMIZED_TELEMETRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
            {
                info!("anonymized telemetry flag is set; no telemetry sink is configured in this build");
            }

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let engine = build_engine(&state_dir).await?;
            log_startup_paths(&state_dir, &addr);

            let shutdown = engine.shutdown_token();
            tokio::spawn({
                let engine = Arc::clone(&engine);
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutdown requested");
                        engine.shutdown();
                    }
                }
            });
            let state = AppState::new(engine);
            serve(addr, state).await?;
            shutdown.cancelled().await;
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".orra")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting orra-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}

async fn build_engine(state_dir: &PathBuf) -> anyhow::Result<Arc<Engine>> {
    let config = EngineConfig::load(Some(&state_dir.join("config.json"))).await?;
    let kv = KvStore::open(&state_dir.join("storage")).await?;

    let llm = LlmSettings::from_env()
        .context("the LLM_MODEL / LLM_API_KEY / LLM_API_BASE_URL environment set is required")?;
    let generator = Arc::new(OpenAiCompatGenerator::new(llm));

    let embedder: Arc<dyn Embedder> = match EmbeddingsSettings::from_env() {
        Some(settings) => Arc::new(HttpEmbedder::new(settings)),
        None => {
            info!("EMBEDDINGS_* not configured; using the offline feature-hash embedder");
            Arc::new(FeatureHashEmbedder::new())
        }
    };

    let engine = Engine::start(
        config,
        kv,
        generator,
        embedder,
        Arc::new(DefaultPlanValidator::new()),
    )
    .await?;
    Ok(engine)
}
