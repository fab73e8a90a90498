mod model;

use rocket::{Route, State};
use rocket::http::Status;
use rocket::serde::json::Json;
use tokio::sync::mpsc;
use crate::api::v1::model::Acked;
use crate::emergency::EmergencyReason;
use crate::engine::{EngineEvent, GridStatus, SharedAlerts, SharedStatus};
use crate::pattern::PatternAlert;

pub(crate) fn routes() -> Vec<Route> {
    routes![status, alerts, acknowledge, trigger_emergency, exit_emergency]
}

#[get("/status")]
async fn status(status: &State<SharedStatus>) -> Json<GridStatus> {
    Json(status.read().expect("status lock").clone())
}

#[get("/alerts")]
async fn alerts(alerts: &State<SharedAlerts>) -> Json<Vec<PatternAlert>> {
    Json(alerts.read().expect("alerts lock").clone())
}

#[post("/alerts/<id>/ack")]
async fn acknowledge(engine: &State<mpsc::Sender<EngineEvent>>, id: String) -> Result<Json<Acked>, Status> {
    match engine.send(EngineEvent::Acknowledge(id.clone())).await {
        Ok(()) => Ok(Json(Acked { id, accepted: true })),
        Err(_) => Err(Status::ServiceUnavailable),
    }
}

#[post("/emergency")]
async fn trigger_emergency(engine: &State<mpsc::Sender<EngineEvent>>) -> Status {
    match engine.send(EngineEvent::TriggerEmergency(EmergencyReason::Manual)).await {
        Ok(()) => Status::Accepted,
        Err(_) => Status::ServiceUnavailable,
    }
}

#[delete("/emergency")]
async fn exit_emergency(engine: &State<mpsc::Sender<EngineEvent>>) -> Status {
    match engine.send(EngineEvent::ExitEmergency).await {
        Ok(()) => Status::Accepted,
        Err(_) => Status::ServiceUnavailable,
    }
}
