pub mod bootstrap;
pub mod fanout;
pub mod poller;
pub mod refresh;
pub mod websub;

pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
