pub mod alerting;
pub mod db;
pub mod events;
pub mod probes;
pub mod scheduler;
pub mod server;
pub mod version;

mod utils;
