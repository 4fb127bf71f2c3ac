/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Event types that flow through a connection.

[`TransportEvent`] is what a transport binding delivers inbound.  The request structs
([`PublishRequest`], [`SubscribeRequest`], [`UnsubscribeRequest`], [`ConnectRequest`]) are what
the connection hands to the transport outbound.  [`ConnectionEvent`] is what the application
receives through its listener.  The internal `Event` envelope borrows from all of these for the
duration of one synchronous dispatch.
 */

use crate::collection::*;
use crate::config::ClientCertificate;
use crate::logging::{Component, create_binary_log_string};
use crate::mqtt::*;
use crate::pipeline::TimerId;
use crate::request::CorrelationId;
use crate::rpc::RpcStatus;
use crate::rpc::client::InvokeRequest;
use crate::rpc::server::ExecutionFinishRequest;
use crate::telemetry::producer::TelemetryRequest;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Outbound connect parameters handed to the transport.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {

    /// Endpoint host name
    pub host: String,

    /// Endpoint port
    pub port: u16,

    /// MQTT client id
    pub client_id: String,

    /// Optional username
    pub username: Option<String>,

    /// Optional password
    pub password: Option<Vec<u8>>,

    /// Client certificate currently selected by credential rotation, if any are configured
    pub certificate: Option<ClientCertificate>,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<...redacted>"))
            .field("certificate", &self.certificate)
            .finish()
    }
}

/// Outbound publish handed to the transport.  Borrows from the issuing state machine.
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {

    /// Topic to publish to
    pub topic: &'a str,

    /// Message payload
    pub payload: &'a [u8],

    /// Delivery quality of service
    pub qos: QualityOfService,

    /// MQTT5 properties to attach
    pub properties: &'a PropertyBag,
}

/// Outbound subscribe handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {

    /// Topic filter to subscribe to
    pub topic_filter: String,

    /// Maximum quality of service requested
    pub qos: QualityOfService,
}

/// Outbound unsubscribe handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeRequest {

    /// Topic filter to unsubscribe from
    pub topic_filter: String,
}

/// An incoming publish delivered by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReceived {

    /// Topic the message was published to
    pub topic: String,

    /// Message payload
    pub payload: Vec<u8>,

    /// Quality of service the message was delivered with
    pub qos: QualityOfService,

    /// MQTT5 properties attached to the message
    pub properties: PropertyBag,
}

/// Events a transport binding delivers to [`Connection::handle_transport_event`](crate::connection::Connection::handle_transport_event).
///
/// A transport delivers exactly one acknowledgement per accepted outbound operation, any number
/// of incoming publishes, and exactly one disconnect response per link loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {

    /// Result of a connect attempt (CONNACK or connect failure)
    ConnectResponse {

        /// connect result reported by the server
        reason_code: ConnectReasonCode
    },

    /// The link was closed
    DisconnectResponse {

        /// reason the link was closed
        reason_code: DisconnectReasonCode,

        /// true if the close was the result of a local disconnect request
        disconnect_requested: bool
    },

    /// An incoming publish
    PublishReceived(PublishReceived),

    /// PUBACK for an outbound QoS 1 publish
    Puback {

        /// packet id the transport assigned to the publish
        id: PacketId,

        /// publish result
        reason_code: PubackReasonCode
    },

    /// SUBACK for an outbound subscribe
    Suback {

        /// packet id the transport assigned to the subscribe
        id: PacketId,

        /// subscribe result
        reason_code: SubackReasonCode
    },

    /// UNSUBACK for an outbound unsubscribe
    Unsuback {

        /// packet id the transport assigned to the unsubscribe
        id: PacketId,

        /// unsubscribe result
        reason_code: UnsubackReasonCode
    },
}

/// A diagnostic error surfaced to the application through the connection listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {

    /// component that reported the error
    pub component: Component,

    /// human-readable description
    pub message: String,
}

/// A response (or locally synthesized failure) for an RPC invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {

    /// client that issued the invocation
    pub client: RpcClientHandle,

    /// correlation id of the invocation
    pub correlation_id: CorrelationId,

    /// RPC status carried by the response, or synthesized locally for timeouts and puback failures
    pub status: RpcStatus,

    /// error message when the status is a failure
    pub error_message: Option<String>,

    /// content type of the response payload
    pub content_type: Option<String>,

    /// response payload; empty on failure
    pub payload: Vec<u8>,
}

/// A command execution request forwarded by an RPC server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteCommandRequest {

    /// server that received the request
    pub server: RpcServerHandle,

    /// correlation id to echo in the execution response
    pub correlation_id: CorrelationId,

    /// topic the response is published to
    pub response_topic: String,

    /// content type of the request payload
    pub content_type: String,

    /// command name extracted from the request topic
    pub command_name: String,

    /// request payload
    pub request_payload: Vec<u8>,
}

/// A telemetry publish that was rejected by the broker or timed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryErrorEvent {

    /// producer that issued the publish
    pub producer: TelemetryProducerHandle,

    /// puback reason code, if the broker reported one
    pub reason_code: Option<PubackReasonCode>,

    /// human-readable description
    pub error_message: String,
}

/// A telemetry message received by a telemetry consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {

    /// consumer that received the message
    pub consumer: TelemetryConsumerHandle,

    /// client id of the sender, extracted from the topic
    pub sender_id: String,

    /// telemetry name, extracted from the topic
    pub telemetry_name: String,

    /// content type of the payload, if the sender supplied one
    pub content_type: Option<String>,

    /// telemetry payload
    pub payload: Vec<u8>,
}

/// Events delivered to the application listener registered with a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {

    /// A connect attempt completed
    ConnectResponse {

        /// connect result reported by the server
        reason_code: ConnectReasonCode
    },

    /// The connection was closed
    DisconnectResponse {

        /// reason the link was closed
        reason_code: DisconnectReasonCode,

        /// true if the close was the result of a local disconnect request
        disconnect_requested: bool
    },

    /// A reconnect has been scheduled
    Retry {

        /// number of the upcoming attempt, starting at 1
        attempt: u32,

        /// delay until the attempt
        delay: Duration
    },

    /// The configured maximum number of connect attempts was exceeded; the connection is faulted
    RetryExhausted {

        /// number of failed attempts
        attempts: u32
    },

    /// A state machine reported an error
    Error(ErrorEvent),

    /// An RPC client's response subscription was established
    RpcClientReady {

        /// client that is ready
        client: RpcClientHandle
    },

    /// An RPC response was received
    RpcClientResponse(RpcResponse),

    /// An RPC invocation failed locally (publish timeout, puback failure, execution timeout,
    /// malformed response)
    RpcClientError(RpcResponse),

    /// An RPC server received a command to execute
    ExecuteCommand(ExecuteCommandRequest),

    /// A telemetry publish failed
    TelemetryError(TelemetryErrorEvent),

    /// A telemetry consumer received a message
    TelemetryReceived(TelemetryMessage),
}

/// Callback invoked for every [`ConnectionEvent`]
pub type ConnectionEventListener = Arc<dyn Fn(Arc<ConnectionEvent>) + Send + Sync>;

/// Internal event envelope dispatched through the state machines.
pub(crate) enum Event<'a> {
    Entry,
    Exit,
    Timeout(TimerId),

    OpenRequest,
    CloseRequest,

    Publish(&'a PublishRequest<'a>),
    Subscribe(&'a SubscribeRequest),
    Unsubscribe(&'a UnsubscribeRequest),

    ConnectResponse(ConnectReasonCode),
    DisconnectResponse {
        reason_code: DisconnectReasonCode,
        disconnect_requested: bool,
    },
    PublishReceived(&'a PublishReceived),
    Puback {
        id: PacketId,
        reason_code: PubackReasonCode,
    },
    Suback {
        id: PacketId,
        reason_code: SubackReasonCode,
    },
    Unsuback {
        id: PacketId,
        reason_code: UnsubackReasonCode,
    },

    RequestInit {
        correlation_id: &'a CorrelationId,
        packet_id: PacketId,
    },
    RequestComplete(&'a CorrelationId),
    RequestFaulted {
        correlation_id: &'a CorrelationId,
        status: RpcStatus,
        message: &'a str,
    },

    InvokeRequest(&'a InvokeRequest),
    RpcSubscribeRequest,
    RpcUnsubscribeRequest,
    RegisterRequest,
    ExecutionFinish(&'a ExecutionFinishRequest),
    TelemetrySend(&'a TelemetryRequest),
    TelemetrySubscribeRequest,
    TelemetryUnsubscribeRequest,
}

impl<'a> From<&'a TransportEvent> for Event<'a> {
    fn from(event: &'a TransportEvent) -> Self {
        match event {
            TransportEvent::ConnectResponse { reason_code } => { Event::ConnectResponse(*reason_code) }
            TransportEvent::DisconnectResponse { reason_code, disconnect_requested } => {
                Event::DisconnectResponse { reason_code: *reason_code, disconnect_requested: *disconnect_requested }
            }
            TransportEvent::PublishReceived(publish) => { Event::PublishReceived(publish) }
            TransportEvent::Puback { id, reason_code } => { Event::Puback { id: *id, reason_code: *reason_code } }
            TransportEvent::Suback { id, reason_code } => { Event::Suback { id: *id, reason_code: *reason_code } }
            TransportEvent::Unsuback { id, reason_code } => { Event::Unsuback { id: *id, reason_code: *reason_code } }
        }
    }
}

impl fmt::Display for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Entry => { write!(f, "Entry") }
            Event::Exit => { write!(f, "Exit") }
            Event::Timeout(id) => { write!(f, "Timeout {{ timer:{} }}", id) }
            Event::OpenRequest => { write!(f, "OpenRequest") }
            Event::CloseRequest => { write!(f, "CloseRequest") }
            Event::Publish(publish) => {
                write!(f, "Publish {{ topic:\"{}\" qos:{:?} payload:<{} Bytes> properties:{} }}", publish.topic, publish.qos, publish.payload.len(), publish.properties)
            }
            Event::Subscribe(subscribe) => { write!(f, "Subscribe {{ topic_filter:\"{}\" qos:{:?} }}", subscribe.topic_filter, subscribe.qos) }
            Event::Unsubscribe(unsubscribe) => { write!(f, "Unsubscribe {{ topic_filter:\"{}\" }}", unsubscribe.topic_filter) }
            Event::ConnectResponse(reason_code) => { write!(f, "ConnectResponse {{ reason_code:{:?} }}", reason_code) }
            Event::DisconnectResponse { reason_code, disconnect_requested } => {
                write!(f, "DisconnectResponse {{ reason_code:{:?} disconnect_requested:{} }}", reason_code, disconnect_requested)
            }
            Event::PublishReceived(publish) => {
                write!(f, "PublishReceived {{ topic:\"{}\" qos:{:?} payload:<{} Bytes> properties:{} }}", publish.topic, publish.qos, publish.payload.len(), publish.properties)
            }
            Event::Puback { id, reason_code } => { write!(f, "Puback {{ id:{} reason_code:{:?} }}", id, reason_code) }
            Event::Suback { id, reason_code } => { write!(f, "Suback {{ id:{} reason_code:{:?} }}", id, reason_code) }
            Event::Unsuback { id, reason_code } => { write!(f, "Unsuback {{ id:{} reason_code:{:?} }}", id, reason_code) }
            Event::RequestInit { correlation_id, packet_id } => { write!(f, "RequestInit {{ correlation_id:{} packet_id:{} }}", correlation_id, packet_id) }
            Event::RequestComplete(correlation_id) => { write!(f, "RequestComplete {{ correlation_id:{} }}", correlation_id) }
            Event::RequestFaulted { correlation_id, status, message } => {
                write!(f, "RequestFaulted {{ correlation_id:{} status:{} message:\"{}\" }}", correlation_id, status, message)
            }
            Event::InvokeRequest(request) => {
                write!(f, "InvokeRequest {{ correlation_id:{} command_name:\"{}\" payload:<{} Bytes> }}", request.correlation_id, request.command_name, request.request_payload.len())
            }
            Event::RpcSubscribeRequest => { write!(f, "RpcSubscribeRequest") }
            Event::RpcUnsubscribeRequest => { write!(f, "RpcUnsubscribeRequest") }
            Event::RegisterRequest => { write!(f, "RegisterRequest") }
            Event::ExecutionFinish(response) => {
                write!(f, "ExecutionFinish {{ correlation_id:{} status:{} payload:<{} Bytes> }}", response.correlation_id, response.status, response.response_payload.len())
            }
            Event::TelemetrySend(request) => {
                write!(f, "TelemetrySend {{ telemetry_name:\"{}\" qos:{:?} payload:<{} Bytes> }}", request.telemetry_name, request.qos, request.payload.len())
            }
            Event::TelemetrySubscribeRequest => { write!(f, "TelemetrySubscribeRequest") }
            Event::TelemetryUnsubscribeRequest => { write!(f, "TelemetryUnsubscribeRequest") }
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::ConnectResponse { reason_code } => { write!(f, "ConnectResponse {{ reason_code:{:?} }}", reason_code) }
            ConnectionEvent::DisconnectResponse { reason_code, disconnect_requested } => {
                write!(f, "DisconnectResponse {{ reason_code:{:?} disconnect_requested:{} }}", reason_code, disconnect_requested)
            }
            ConnectionEvent::Retry { attempt, delay } => { write!(f, "Retry {{ attempt:{} delay:{:?} }}", attempt, delay) }
            ConnectionEvent::RetryExhausted { attempts } => { write!(f, "RetryExhausted {{ attempts:{} }}", attempts) }
            ConnectionEvent::Error(error) => { write!(f, "Error {{ component:{} message:\"{}\" }}", error.component, error.message) }
            ConnectionEvent::RpcClientReady { client } => { write!(f, "RpcClientReady {{ client:{:?} }}", client) }
            ConnectionEvent::RpcClientResponse(response) => {
                write!(f, "RpcClientResponse {{ correlation_id:{} status:{} payload:<{} Bytes> }}", response.correlation_id, response.status, response.payload.len())
            }
            ConnectionEvent::RpcClientError(response) => {
                write!(f, "RpcClientError {{ correlation_id:{} status:{} error_message:{:?} }}", response.correlation_id, response.status, response.error_message)
            }
            ConnectionEvent::ExecuteCommand(request) => {
                write!(f, "ExecuteCommand {{ correlation_id:{} command_name:\"{}\" response_topic:\"{}\" }}", request.correlation_id, request.command_name, request.response_topic)
            }
            ConnectionEvent::TelemetryError(error) => {
                write!(f, "TelemetryError {{ reason_code:{:?} error_message:\"{}\" }}", error.reason_code, error.error_message)
            }
            ConnectionEvent::TelemetryReceived(message) => {
                write!(f, "TelemetryReceived {{ sender_id:\"{}\" telemetry_name:\"{}\" payload:<{} Bytes> }}", message.sender_id, message.telemetry_name, message.payload.len())
            }
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", create_binary_log_string(self.as_bytes()))
    }
}
