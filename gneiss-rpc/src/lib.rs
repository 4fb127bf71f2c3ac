/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Transport-agnostic MQTT5 connection management with request/response (RPC) and telemetry on top.

This crate contains no networking.  A [`Connection`] is a set of hierarchical state machines fed
by three kinds of input:

* application requests (open, close, invoke a command, answer a command, send or consume telemetry)
* transport events from an MQTT5 client library binding ([`TransportEvent`])
* timer expirations, serviced through [`Connection::service`]

Outbound MQTT operations are handed to an [`MqttTransport`] implementation; results and incoming
work reach the application through a single [`ConnectionEventListener`].

# Example

```no_run
use gneiss_rpc::*;
use std::sync::Arc;
use std::time::Instant;

fn run(transport: Box<dyn MqttTransport>) -> GneissResult<()> {
    let options = ConnectionOptionsBuilder::new("broker.example.com", "vehicle-1").build()?;
    let listener : ConnectionEventListener = Arc::new(|event| {
        println!("{}", event);
    });

    let mut connection = Connection::new(options, transport, listener, Instant::now());
    let client = connection.add_rpc_client(RpcClientOptionsBuilder::new("vehicle-1", "dtmi:rpc:lock;1").build()?)?;
    connection.open(Instant::now())?;

    // ... once connected
    connection.invoke(client, &InvokeRequest {
        correlation_id: CorrelationId::new_random(),
        command_name: "unlock".to_string(),
        ..Default::default()
    }, Instant::now())?;

    Ok(())
}
```

With the `tokio` feature, [`features::gneiss_tokio`] provides a task that services timers as
they expire.
 */

mod collection;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod features;
mod hfsm;
pub mod logging;
pub mod mqtt;
mod pipeline;
pub mod request;
pub mod retry;
pub mod rpc;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use collection::{RpcClientHandle, RpcServerHandle, SubclientId, TelemetryConsumerHandle, TelemetryProducerHandle};
pub use config::*;
pub use connection::{Connection, ConnectionState};
pub use error::{GneissError, GneissResult};
pub use event::*;
pub use logging::{Component, EventObserver, LogObserver, NullObserver};
pub use mqtt::*;
pub use pipeline::{MqttTransport, TimerId};
pub use request::{CorrelationId, RequestState};
pub use rpc::{RpcStatus, RPC_QOS, RPC_STATUS_MESSAGE_PROPERTY_NAME, RPC_STATUS_PROPERTY_NAME};
pub use rpc::client::{InvokeRequest, RpcClientState};
pub use rpc::pending::{PendingCommand, PendingCommands};
pub use rpc::server::{ExecutionFinishRequest, RpcServerState};
pub use rpc::topic::{TopicFormat, TopicToken, TopicTokens};
pub use telemetry::{TelemetryConsumerState, TelemetryProducerState, TelemetryRequest};
