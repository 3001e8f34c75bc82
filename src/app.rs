use axum::http::HeaderValue;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{create_router, AppState};
use crate::config::Config;
use crate::db::{FileRepository, SensorRecordRepository};
use crate::files::{BlobStore, Converter, ExternalConverter, UnconfiguredConverter};
use crate::notifier::LiveNotifier;
use crate::scheduler::InboxMonitor;
use crate::services::{FilenameLocks, IngestService, LibraryService};
use crate::workers::InboxWorker;

/// Fully wired services, shared by the HTTP server and the CLI tools
#[derive(Clone)]
pub struct Services {
    pub ingest_service: IngestService,
    pub library_service: LibraryService,
    pub notifier: LiveNotifier,
    pub monitor: InboxMonitor,
}

impl Services {
    /// Build repositories, blob store, converter, notifier and monitor
    pub fn build(config: &Config, pool: SqlitePool) -> Self {
        let file_repo = FileRepository::new(pool.clone());
        let record_repo = SensorRecordRepository::new(pool);

        let blob_store = BlobStore::new(&config.upload_dir, &config.converted_dir);
        let converter: Arc<dyn Converter> = match config
            .rld_converter_command
            .as_deref()
            .and_then(|cmd| ExternalConverter::from_command_line(cmd, &config.rld_file_filter))
        {
            Some(converter) => Arc::new(converter),
            None => {
                warn!("RLD_CONVERTER_COMMAND not set; .rld uploads will be rejected");
                Arc::new(UnconfiguredConverter)
            }
        };

        let notifier = LiveNotifier::new(
            Arc::new(record_repo.clone()),
            config.notifier_send_timeout(),
            config.notifier_channel_capacity,
        );

        let locks = FilenameLocks::new();
        let ingest_service = IngestService::new(
            blob_store.clone(),
            converter,
            file_repo.clone(),
            notifier.clone(),
            locks.clone(),
        );
        let library_service = LibraryService::new(file_repo, record_repo, blob_store, locks);

        let worker = InboxWorker::new(
            &config.inbox_dir,
            config.monitor_batch_size,
            ingest_service.clone(),
        );
        let monitor = InboxMonitor::new(
            worker,
            config.monitor_interval(),
            config.monitor_stop_timeout(),
        );

        Self {
            ingest_service,
            library_service,
            notifier,
            monitor,
        }
    }
}

/// Application with the spawned server and the inbox monitor
pub struct Application {
    pub server_handle: JoinHandle<Result<(), std::io::Error>>,
    pub monitor: InboxMonitor,
}

impl Application {
    /// Build and initialize the application
    ///
    /// Wires repositories, services, the live notifier and the inbox
    /// monitor, then spawns the HTTP API server (Axum). The monitor is
    /// started here only when `MONITOR_AUTOSTART` is set.
    pub async fn build(config: Config, pool: SqlitePool) -> Result<Self, Box<dyn std::error::Error>> {
        info!("Initializing application components");

        let services = Services::build(&config, pool);
        services.ingest_service.blob_store().ensure_dirs().await?;

        if config.monitor_autostart {
            info!("Autostarting inbox monitor");
            services.monitor.start();
        }

        let monitor = services.monitor.clone();
        let app_state = AppState {
            ingest_service: services.ingest_service,
            library_service: services.library_service,
            notifier: services.notifier,
            monitor: services.monitor,
        };
        let app = create_router(app_state, config.max_upload_bytes)
            .layer(cors_layer(&config))
            .layer(TraceLayer::new_for_http());

        let addr = config.server_addr();
        info!("Starting HTTP server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

        info!("Application initialized successfully");

        Ok(Self {
            server_handle,
            monitor,
        })
    }

    /// Run until the server stops, then stop the monitor
    pub async fn run_until_stopped(self) -> Result<(), Box<dyn std::error::Error>> {
        let result = self.server_handle.await;
        self.monitor.stop().await;
        result??;
        Ok(())
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.allows_any_origin() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
