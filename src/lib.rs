pub mod analytics;
pub mod circuit_breaker;
pub mod configuration;
pub mod domain;
pub mod error;
pub mod hotstate;
pub mod http_client;
pub mod module;
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;
pub mod routes;
pub mod scheduler;
pub mod startup;
pub mod sync;
pub mod telemetry;
pub mod webhook;
pub mod worker;
