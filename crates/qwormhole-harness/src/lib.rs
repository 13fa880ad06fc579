//! Deterministic test support shared by `qwormhole-core`/`qwormhole-server`/
//! `qwormhole-client`'s own test suites: a manually-advanceable
//! [`Environment`](qwormhole_core::Environment) double and a settable
//! [`SchedulerTelemetry`](qwormhole_core::SchedulerTelemetry) double.
//!
//! The end-to-end scenarios of §8 live under `tests/` in this crate, driving
//! real `qwormhole-server`/`qwormhole-client` instances over a loopback
//! `TcpListener`.

pub mod sim_env;
pub mod sim_telemetry;

pub use sim_env::SimEnv;
pub use sim_telemetry::SimTelemetry;
