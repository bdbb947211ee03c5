//! hass-bridge: polls home devices and republishes their state to Home
//! Assistant over MQTT.
//!
//! Each configured device is a provider with its own poll interval. At
//! startup the bridge announces every provider's entities as retained MQTT
//! discovery messages, then polls each provider on its own task and publishes
//! state and availability. An HTTP listener serves liveness and an aggregate
//! readiness check over the broker and every active provider.
//!
//! ## Modules
//!
//! * `config`: TOML configuration, loading and validation with `validator`.
//! * `core`: broker abstraction, Home Assistant discovery model, providers,
//!   polling executor, readiness aggregation and the [`core::bridge::Bridge`]
//!   orchestrator.
//! * `logger`: `tracing` subscriber setup with console and journald layers.
//! * `server`: the `/live` and `/ready` endpoints.

pub mod config;
pub mod core;
pub mod logger;
pub mod server;
