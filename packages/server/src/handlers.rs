//! HTTP handler functions for the parking finder API.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, web};
use chrono::Utc;
use parking_finder_parking_models::Point;
use parking_finder_pipeline::PipelineError;
use parking_finder_predict::PredictError;
use parking_finder_server_models::{
    ApiError, ApiHealth, LocationParams, PredictionRequest, PredictionResponse, RealtimeParams,
};

use crate::AppState;

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /api/parking/realtime`
///
/// Nearby bays with live sensor occupancy. Only currently unoccupied bays
/// are returned unless `available_only=false`.
pub async fn realtime(
    state: web::Data<AppState>,
    params: web::Query<RealtimeParams>,
) -> HttpResponse {
    let center = match Point::new(params.lat, params.lon) {
        Ok(center) => center,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };

    match state
        .pipeline
        .realtime_bays(center, params.available_only)
        .await
    {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => pipeline_error(&e),
    }
}

/// `GET /api/parking/nearby`
///
/// Nearest bays with descriptions, zones, and restrictions resolved.
pub async fn nearby(
    state: web::Data<AppState>,
    params: web::Query<LocationParams>,
) -> HttpResponse {
    let center = match Point::new(params.lat, params.lon) {
        Ok(center) => center,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };

    match state.pipeline.nearby_for_prediction(center).await {
        Ok(candidates) => HttpResponse::Ok().json(candidates),
        Err(e) => pipeline_error(&e),
    }
}

/// `POST /api/predict`
///
/// Predicts occupancy of nearby bays at a future instant.
pub async fn predict(
    state: web::Data<AppState>,
    body: web::Json<PredictionRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    let center = match Point::new(request.lat, request.lon) {
        Ok(center) => center,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };
    let threshold = request.threshold.unwrap_or(state.default_threshold);

    match state
        .pipeline
        .predict_at(center, &request.timestamp, threshold, Utc::now())
        .await
    {
        Ok(outcome) => HttpResponse::Ok().json(PredictionResponse {
            timestamp: outcome.timestamp.to_rfc3339(),
            model_info: state.model_info.clone(),
            results: outcome.results,
        }),
        Err(e) => pipeline_error(&e),
    }
}

/// HTTP status for a pipeline failure.
#[must_use]
pub const fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Time(_) | PipelineError::Predict(PredictError::InvalidThreshold { .. }) => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::Predict(PredictError::Inference { .. }) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        PipelineError::UpstreamUnavailable { .. }
        | PipelineError::Predict(
            PredictError::ModelUnavailable { .. }
            | PredictError::InvalidModel { .. }
            | PredictError::Io(_)
            | PredictError::Json(_),
        ) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn pipeline_error(error: &PipelineError) -> HttpResponse {
    let status = status_for(error);
    if status.is_server_error() {
        log::error!("Request failed: {error}");
    } else {
        log::debug!("Rejected request: {error}");
    }
    error_response(status, error)
}

fn error_response(status: StatusCode, error: &impl std::fmt::Display) -> HttpResponse {
    HttpResponse::build(status).json(ApiError {
        error: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use actix_web::{App, test};
    use parking_finder_parking_models::{
        BayId, Candidate, FeatureVector, LiveStatus, OccupancyState,
    };
    use parking_finder_pipeline::{Pipeline, PipelineSettings};
    use parking_finder_predict::time::TimeError;
    use parking_finder_predict::{Classifier, ModelHandle, PredictionEngine};
    use parking_finder_server_models::ModelInfo;
    use parking_finder_source::LiveStatusSource;
    use parking_finder_source::memory::MemorySource;
    use parking_finder_spatial::BayIndex;

    use super::*;

    struct Fixed;

    impl Classifier for Fixed {
        fn predict_probability(&self, rows: &[FeatureVector]) -> Result<Vec<f64>, PredictError> {
            Ok(vec![0.25; rows.len()])
        }
    }

    fn state() -> web::Data<AppState> {
        state_with_live(None)
    }

    fn state_with_live(live: Option<Vec<LiveStatus>>) -> web::Data<AppState> {
        let bays = vec![Candidate {
            bay_id: BayId::new("1001"),
            segment_id: Some(20_001),
            zone_number: Some(7550),
            ..Candidate::at(Point::new(-37.8136, 144.9631).unwrap())
        }];
        let source = Arc::new(MemorySource::new(
            BayIndex::new(bays),
            BTreeMap::new(),
            BTreeMap::new(),
            live.clone().unwrap_or_default(),
        ));
        let live_source: Option<Arc<dyn LiveStatusSource>> = match live {
            Some(_) => Some(source.clone()),
            None => None,
        };
        let engine = PredictionEngine::new(Arc::new(ModelHandle::preloaded(Arc::new(Fixed))));

        web::Data::new(AppState {
            pipeline: Pipeline::new(
                source.clone(),
                source,
                live_source,
                engine,
                PipelineSettings::default(),
            ),
            model_info: ModelInfo {
                name: "fixed".to_string(),
                accuracy_estimate: None,
            },
            default_threshold: 0.5,
        })
    }

    macro_rules! app {
        () => {
            app!(state())
        };
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state)
                    .route("/api/health", web::get().to(health))
                    .route("/api/parking/realtime", web::get().to(realtime))
                    .route("/api/parking/nearby", web::get().to(nearby))
                    .route("/api/predict", web::post().to(predict)),
            )
            .await
        };
    }

    #[test]
    fn maps_errors_to_statuses() {
        let time = PipelineError::Time(TimeError::InvalidTimestamp {
            input: "soon".to_string(),
        });
        assert_eq!(status_for(&time), StatusCode::BAD_REQUEST);

        let threshold = PipelineError::Predict(PredictError::InvalidThreshold { threshold: 2.0 });
        assert_eq!(status_for(&threshold), StatusCode::BAD_REQUEST);

        let upstream = PipelineError::UpstreamUnavailable {
            source_name: "open_data".to_string(),
            message: "timed out".to_string(),
        };
        assert_eq!(status_for(&upstream), StatusCode::SERVICE_UNAVAILABLE);

        let model = PipelineError::Predict(PredictError::ModelUnavailable {
            message: "missing".to_string(),
        });
        assert_eq!(status_for(&model), StatusCode::SERVICE_UNAVAILABLE);

        let inference = PipelineError::Predict(PredictError::Inference {
            message: "bad row".to_string(),
        });
        assert_eq!(status_for(&inference), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn health_reports_version() {
        let app = app!();
        let response: ApiHealth =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/health").to_request())
                .await;
        assert!(response.healthy);
        assert_eq!(response.version, env!("CARGO_PKG_VERSION"));
    }

    #[actix_web::test]
    async fn nearby_returns_enriched_candidates() {
        let app = app!();
        let request = test::TestRequest::get()
            .uri("/api/parking/nearby?lat=-37.8136&lon=144.9631")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[actix_web::test]
    async fn rejects_invalid_coordinates() {
        let app = app!();
        let request = test::TestRequest::get()
            .uri("/api/parking/nearby?lat=95.0&lon=144.9631")
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn realtime_lists_available_bays() {
        let reading = |id: &str, token: &str| LiveStatus {
            bay_id: BayId::new(id).unwrap(),
            state: OccupancyState::from_token(token),
            status_description: token.to_string(),
            last_updated: Utc::now(),
            zone_number: Some(7550),
            location: Some(Point::new(-37.8137, 144.9631).unwrap()),
        };
        let app = app!(state_with_live(Some(vec![
            reading("1001", "Unoccupied"),
            reading("1002", "Present"),
        ])));

        let request = test::TestRequest::get()
            .uri("/api/parking/realtime?lat=-37.8136&lon=144.9631")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["bay_id"], "1001");
        assert_eq!(rows[0]["occupancy"], "Unoccupied");

        let request = test::TestRequest::get()
            .uri("/api/parking/realtime?lat=-37.8136&lon=144.9631&available_only=false")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["occupancy"], "Unoccupied");
    }

    #[actix_web::test]
    async fn realtime_without_live_feed_is_unavailable() {
        let app = app!();
        let request = test::TestRequest::get()
            .uri("/api/parking/realtime?lat=-37.8136&lon=144.9631")
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn predict_validates_and_labels() {
        let app = app!();

        let past = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(serde_json::json!({
                "lat": -37.8136,
                "lon": 144.9631,
                "timestamp": "2000-01-01T09:00:00"
            }))
            .to_request();
        let response = test::call_service(&app, past).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let malformed = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(serde_json::json!({
                "lat": -37.8136,
                "lon": 144.9631,
                "timestamp": "tomorrow morning"
            }))
            .to_request();
        let response = test::call_service(&app, malformed).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let future = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(serde_json::json!({
                "lat": -37.8136,
                "lon": 144.9631,
                "datetime_iso": "2099-06-02T14:00:00"
            }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, future).await;
        assert_eq!(body["model_info"]["name"], "fixed");
        assert_eq!(body["results"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["results"][0]["predicted_status"], "Available");
        assert!(
            body["timestamp"]
                .as_str()
                .is_some_and(|t| t.starts_with("2099-06-02T14:00:00"))
        );
    }
}
