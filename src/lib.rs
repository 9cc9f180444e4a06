mod config;
mod cursor;
mod errors;
pub mod event;
mod flow;
pub mod metrics;
mod mix_event;
mod policy;
mod storage;
mod stream;
mod supervisor;
mod token;
pub mod utils;
mod watch;

pub use config::*;
pub use cursor::*;
pub use errors::*;
pub use event::*;
pub use flow::*;
pub use mix_event::*;
pub use policy::*;
pub use storage::*;
pub use stream::*;
pub use supervisor::*;
pub use token::*;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
//-----------------------------------------------------------
// Autometrics
/// autometrics: https://docs.autometrics.dev/rust/adding-alerts-and-slos
use autometrics::objectives::Objective;
use autometrics::objectives::ObjectiveLatency;
use autometrics::objectives::ObjectivePercentile;
const API_SLO: Objective = Objective::new("watch_api")
    .success_rate(ObjectivePercentile::P99_9)
    .latency(ObjectiveLatency::Ms1000, ObjectivePercentile::P99);
