use rocket::http::Status;
use rocket::{Rocket, Build};
use tokio::sync::mpsc;
use crate::engine::{EngineEvent, SharedAlerts, SharedStatus};

mod v1;

pub fn build(status: SharedStatus, alerts: SharedAlerts, engine_tx: mpsc::Sender<EngineEvent>) -> Rocket<Build> {
  rocket::build()
      .manage(status)
      .manage(alerts)
      .manage(engine_tx)
      .mount("/healthz/-", routes![ready])
      .mount("/grid/api/v1/", v1::routes())
}

#[get("/ready")]
async fn ready() -> Status {
  Status::Ok
}
