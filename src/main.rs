use tracing::{info, instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nrg_datasense::app::Application;
use nrg_datasense::config::Config;
use nrg_datasense::db;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing with environment filter support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nrg_datasense=debug")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    info!("Starting NRG datasense service with config: {:?}", config);

    // Connect and run migrations
    info!("Connecting to database...");
    let pool = db::connect(&config.database_url).await?;
    info!("Database ready");

    let app = Application::build(config, pool).await?;
    app.run_until_stopped().await
}
