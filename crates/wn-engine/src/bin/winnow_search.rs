use anyhow::Context;
use tracing::{error, info};
use wn_engine::{is_resumable, RunConfig, SearchController, SurrogateTrainer};
use wn_store::{ConfigRegistry, RunStore};
use wn_types::presets::{accdoa_space, seld_space};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let results_dir = env_or("WINNOW_RESULTS_DIR", "result");
    let config_dir = env_or("WINNOW_CONFIG_DIR", "configs");

    let mut config = match std::env::var("WINNOW_RUN_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading run config {path}"))?;
            serde_json::from_str::<RunConfig>(&text)
                .with_context(|| format!("parsing run config {path}"))?
        }
        Err(_) => RunConfig::default(),
    };

    // the registry assigns the versioned run name
    let base = env_or("WINNOW_RUN_NAME", &config.name);
    let registry = ConfigRegistry::open(&config_dir)?;
    config.name = registry.register(&base, &serde_json::to_value(&config)?)?;
    config.fresh = matches!(
        std::env::var("WINNOW_FRESH").as_deref(),
        Ok("1") | Ok("true")
    );

    let space = match env_or("WINNOW_PRESET", "accdoa").as_str() {
        "seld" => seld_space()?,
        "accdoa" => accdoa_space()?,
        other => anyhow::bail!("unknown search space preset {other}"),
    };

    let store = RunStore::open(&results_dir, &config.name)?;
    info!("Run directory {}", store.path().display());
    let mut controller =
        SearchController::new(config, space, store, Box::new(SurrogateTrainer::new()))?;

    match controller.run().await {
        Ok(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Err(e) => {
            if is_resumable(&e) {
                error!("Run stopped; start it again with the same settings to resume");
            }
            Err(e.into())
        }
    }
}
