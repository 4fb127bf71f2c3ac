/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Telemetry over MQTT5: a [`producer`] that publishes named telemetry on its sender topic and a
[`consumer`] that subscribes to the telemetry of one or every sender and forwards each message to
the application.
 */

pub mod consumer;
pub mod producer;

pub use consumer::TelemetryConsumerState;
pub use producer::{TelemetryProducerState, TelemetryRequest};
