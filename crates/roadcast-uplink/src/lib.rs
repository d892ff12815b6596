//! Uplink path for the Roadcast edge agent
//!
//! Serializes collected data into sized chunks, compresses when the campaign
//! asks for it, and hands payloads to the wire sender. The wire transport
//! itself (MQTT or otherwise) lives behind the [`sender::Sender`] trait.

pub mod payload;
pub mod sender;
pub mod telemetry;

pub use payload::{PayloadWriter, TelemetryEnvelope};
pub use sender::{ConnectivityError, OnSendCallback, Sender};
pub use telemetry::{PayloadAdaptionConfig, TelemetryDataSender};
