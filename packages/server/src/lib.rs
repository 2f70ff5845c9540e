#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the parking finder.
//!
//! Serves realtime bay availability from the live sensor feed and
//! occupancy predictions for a future instant.

pub mod config;
mod handlers;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use parking_finder_database::{PostgisSource, db, run_migrations};
use parking_finder_pipeline::Pipeline;
use parking_finder_predict::{ModelHandle, PredictionEngine};
use parking_finder_server_models::ModelInfo;
use parking_finder_source::memory::MemorySource;
use parking_finder_source::open_data::OpenDataClient;
use parking_finder_source::{AttributeSource, CandidateSource, LiveStatusSource};

use crate::config::{ConfigError, ServerConfig, SourceConfig};

/// Shared application state.
pub struct AppState {
    /// Enrichment and prediction flows.
    pub pipeline: Pipeline,
    /// Reported with every prediction.
    pub model_info: ModelInfo,
    /// Threshold used when a request omits one.
    pub default_threshold: f64,
}

type ReferenceSources = (Arc<dyn CandidateSource>, Arc<dyn AttributeSource>);

fn shared<T: CandidateSource + AttributeSource + 'static>(source: T) -> ReferenceSources {
    let source = Arc::new(source);
    let candidates: Arc<dyn CandidateSource> = source.clone();
    (candidates, source)
}

async fn build_reference_sources(config: &SourceConfig) -> Result<ReferenceSources, ConfigError> {
    match config {
        SourceConfig::OpenData(open_data) => {
            log::info!("Using open data API at {}", open_data.base_url);
            Ok(shared(OpenDataClient::new(open_data.clone())?))
        }
        SourceConfig::Memory(memory) => {
            log::info!("Loading bays from {}", memory.bays_path.display());
            Ok(shared(MemorySource::from_files(memory)?))
        }
        SourceConfig::Postgis {
            database_url,
            statement_timeout_secs,
        } => {
            log::info!("Connecting to database...");
            let db = match database_url {
                Some(url) => db::connect(url, *statement_timeout_secs).await?,
                None => db::connect_from_env(*statement_timeout_secs).await?,
            };

            log::info!("Running migrations...");
            run_migrations(db.as_ref()).await?;

            Ok(shared(PostgisSource::new(db)))
        }
    }
}

fn build_live_source(config: &SourceConfig) -> Result<Arc<dyn LiveStatusSource>, ConfigError> {
    match config {
        SourceConfig::OpenData(open_data) => Ok(Arc::new(OpenDataClient::new(open_data.clone())?)),
        SourceConfig::Memory(memory) => Ok(Arc::new(MemorySource::from_files(memory)?)),
        SourceConfig::Postgis { .. } => Err(ConfigError::Invalid {
            message: "live source cannot be postgis".to_string(),
        }),
    }
}

/// Builds the application state described by `config`.
///
/// The model is loaded eagerly so a broken artifact is reported at startup;
/// the server still starts and prediction requests fail until it is fixed.
///
/// # Errors
///
/// Returns [`ConfigError`] if a source cannot be built or the timezone is
/// unknown.
pub async fn build_state(config: &ServerConfig) -> Result<AppState, ConfigError> {
    let settings = config.pipeline_settings()?;
    let (candidates, attributes) = build_reference_sources(&config.source).await?;
    let live = match &config.live {
        Some(live) => Some(build_live_source(live)?),
        None => {
            log::warn!("No live source configured; realtime requests will fail");
            None
        }
    };

    let model = Arc::new(ModelHandle::from_path(&config.model.path));
    match model.get() {
        Ok(_) => log::info!("Loaded model from {}", config.model.path.display()),
        Err(e) => log::error!("Prediction disabled: {e}"),
    }

    Ok(AppState {
        pipeline: Pipeline::new(
            candidates,
            attributes,
            live,
            PredictionEngine::new(model),
            settings,
        ),
        model_info: ModelInfo {
            name: config.model.name.clone(),
            accuracy_estimate: config.model.accuracy_estimate,
        },
        default_threshold: config.model.threshold,
    })
}

/// Starts the API server.
///
/// # Errors
///
/// Returns an I/O error if configuration fails or the server cannot bind.
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let config = ServerConfig::load().map_err(std::io::Error::other)?;
    let state = web::Data::new(build_state(&config).await.map_err(std::io::Error::other)?);

    let bind_addr = config.server.bind_addr.clone();
    let port = config.server.port;

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .service(
                web::scope("/api")
                    .route("/health", web::get().to(handlers::health))
                    .route("/parking/realtime", web::get().to(handlers::realtime))
                    .route("/parking/nearby", web::get().to(handlers::nearby))
                    .route("/predict", web::post().to(handlers::predict)),
            )
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
