pub mod config;
pub mod event_forwarder;
