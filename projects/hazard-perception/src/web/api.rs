use crate::config::SystemConfig;
use crate::pipeline::orchestrator::PerceptionSystem;
use crate::pipeline::types::{BehaviorAnalysis, SystemPerformance, SystemState, TrackedObject};
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt};

const EVENT_INTERVAL: Duration = Duration::from_millis(500);

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct StateResponse {
    pub state: SystemState,
    pub vehicle_speed_kmh: f32,
    pub source_finished: bool,
}

#[derive(Deserialize)]
pub struct VehicleSpeedRequest {
    pub speed_kmh: f32,
}

#[derive(Serialize)]
struct StatusEvent {
    state: SystemState,
    performance: SystemPerformance,
    results: Vec<BehaviorAnalysis>,
}

fn state_of(system: &PerceptionSystem) -> StateResponse {
    StateResponse {
        state: system.state(),
        vehicle_speed_kmh: system.vehicle_speed(),
        source_finished: system.source_finished(),
    }
}

/// Control calls block on worker drains and device connects, so they run
/// off the async executor. Rejected transitions map to 409.
async fn control<F>(system: Arc<PerceptionSystem>, op: F) -> ApiResult<StateResponse>
where
    F: FnOnce(&PerceptionSystem) -> anyhow::Result<()> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || op(&system).map(|_| state_of(&system))).await;
    match outcome {
        Ok(Ok(state)) => Ok(Json(state)),
        Ok(Err(e)) => {
            tracing::warn!("Control request rejected: {:#}", e);
            Err((
                StatusCode::CONFLICT,
                Json(ErrorResponse {
                    error: format!("{:#}", e),
                }),
            ))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}

pub async fn get_state(State(system): State<Arc<PerceptionSystem>>) -> Json<StateResponse> {
    Json(state_of(&system))
}

pub async fn get_performance(
    State(system): State<Arc<PerceptionSystem>>,
) -> Json<SystemPerformance> {
    Json(system.performance())
}

pub async fn get_results(
    State(system): State<Arc<PerceptionSystem>>,
) -> Json<Vec<BehaviorAnalysis>> {
    Json(system.last_results())
}

pub async fn get_tracks(State(system): State<Arc<PerceptionSystem>>) -> Json<Vec<TrackedObject>> {
    Json(system.tracks())
}

pub async fn get_config(State(system): State<Arc<PerceptionSystem>>) -> Json<SystemConfig> {
    Json(system.config())
}

pub async fn put_config(
    State(system): State<Arc<PerceptionSystem>>,
    Json(config): Json<SystemConfig>,
) -> ApiResult<StateResponse> {
    control(system, move |s| s.update_config(config)).await
}

pub async fn start(State(system): State<Arc<PerceptionSystem>>) -> ApiResult<StateResponse> {
    control(system, |s| s.start()).await
}

pub async fn stop(State(system): State<Arc<PerceptionSystem>>) -> ApiResult<StateResponse> {
    control(system, |s| s.stop()).await
}

pub async fn pause(State(system): State<Arc<PerceptionSystem>>) -> ApiResult<StateResponse> {
    control(system, |s| s.pause()).await
}

pub async fn resume(State(system): State<Arc<PerceptionSystem>>) -> ApiResult<StateResponse> {
    control(system, |s| s.resume()).await
}

pub async fn reset(State(system): State<Arc<PerceptionSystem>>) -> ApiResult<StateResponse> {
    control(system, |s| s.reset()).await
}

pub async fn set_vehicle_speed(
    State(system): State<Arc<PerceptionSystem>>,
    Json(payload): Json<VehicleSpeedRequest>,
) -> Json<StateResponse> {
    system.set_vehicle_speed(payload.speed_kmh);
    Json(state_of(&system))
}

/// Periodic `status` events carrying state, performance and the latest results
pub async fn events(
    State(system): State<Arc<PerceptionSystem>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let mut ticks = IntervalStream::new(tokio::time::interval(EVENT_INTERVAL));
        while ticks.next().await.is_some() {
            let status = StatusEvent {
                state: system.state(),
                performance: system.performance(),
                results: system.last_results(),
            };
            match Event::default().event("status").json_data(&status) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!("Failed to encode status event: {}", e),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
