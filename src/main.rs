use anyhow::Result;
use llm_relay::config::{LogFormat, Settings};
use llm_relay::log_messages::application as messages;
use llm_relay::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    init_tracing(&settings);

    info!(environment = %settings.application.environment, "{}", messages::STARTING);

    let app = Application::new(settings)?;
    app.run().await?;

    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}
