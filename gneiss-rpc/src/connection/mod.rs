/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The connection: the single entry point an application and a transport binding drive.

A [`Connection`] owns the connection state machine, the event pipeline (transport, timers,
listener, observer) and every attached sub-client.  All calls are synchronous; every state change
triggered by a call has completed when it returns.  Callers must serialize access.

Time is supplied by the caller on every entry point.  A driver calls [`Connection::service`] at
or after [`Connection::next_service_time`] to fire expired timers.
 */

pub(crate) mod hfsm;

pub use hfsm::ConnectionState;

use crate::collection::*;
use crate::config::*;
use crate::error::{fold_gneiss_result, GneissResult};
use crate::event::*;
use crate::logging::*;
use crate::pipeline::{EventPipeline, MqttTransport};
use crate::request::{CorrelationId, RequestState};
use crate::rpc::client::{InvokeRequest, RpcClient, RpcClientState};
use crate::rpc::server::{ExecutionFinishRequest, RpcServer, RpcServerState};
use crate::telemetry::consumer::{TelemetryConsumer, TelemetryConsumerState};
use crate::telemetry::producer::{TelemetryProducer, TelemetryProducerState, TelemetryRequest};

use hfsm::{ConnectionContext, ConnectionPolicy};

use std::time::{Duration, Instant};

/// An MQTT5 connection with attached RPC clients, RPC servers, telemetry producers and telemetry
/// consumers.
pub struct Connection {
    policy: ConnectionPolicy,
    pipeline: EventPipeline,
    subclients: PolicyCollection,
}

impl Connection {

    /// Creates a new connection in the idle state.  Nothing is sent until [`Connection::open`].
    pub fn new(options: ConnectionOptions, transport: Box<dyn MqttTransport>, listener: ConnectionEventListener, now: Instant) -> Self {
        let pipeline = EventPipeline::new(transport, listener, options.observer.clone(), now);
        observe_debug!(pipeline.observer(), Component::Connection, "creating connection with {:?}", options);

        Connection {
            policy: ConnectionPolicy::new(options),
            pipeline,
            subclients: PolicyCollection::new(),
        }
    }

    /// Starts connecting.  Reconnects automatically until closed or retries are exhausted.
    pub fn open(&mut self, now: Instant) -> GneissResult<()> {
        self.pipeline.set_current_time(now);
        self.handle_policy_event(&Event::OpenRequest)
    }

    /// Closes the connection, abandoning any connect attempt or reconnect backoff in progress.
    pub fn close(&mut self, now: Instant) -> GneissResult<()> {
        self.pipeline.set_current_time(now);
        self.handle_policy_event(&Event::CloseRequest)
    }

    /// Inbound entry point for the transport binding.
    pub fn handle_transport_event(&mut self, event: &TransportEvent, now: Instant) -> GneissResult<()> {
        self.pipeline.set_current_time(now);
        self.handle_policy_event(&Event::from(event))
    }

    /// Fires every timer that has expired by `now`.  Connection timers go to the connection state
    /// machine; every other timer goes to the sub-clients.
    pub fn service(&mut self, now: Instant) -> GneissResult<()> {
        self.pipeline.set_current_time(now);

        let mut result = Ok(());
        for timer in self.pipeline.take_expired_timers() {
            let event = Event::Timeout(timer);
            if self.policy.owns_timer(timer) {
                result = fold_gneiss_result(result, self.handle_policy_event(&event));
            } else {
                let mut context = PolicyContext::new(&mut self.policy, &mut self.pipeline);
                result = fold_gneiss_result(result, self.subclients.dispatch_inbound(&event, &mut context));
            }
        }

        result
    }

    /// Earliest point in time at which [`Connection::service`] has work to do
    pub fn next_service_time(&self) -> Option<Instant> {
        self.pipeline.next_deadline()
    }

    /// Current state of the connection state machine
    pub fn state(&self) -> ConnectionState {
        self.policy.state()
    }

    /// Number of failed connect attempts since the connection was last established
    pub fn reconnect_attempts(&self) -> u32 {
        self.policy.reconnect_attempts()
    }

    /// Index of the client certificate the next connect attempt will present
    pub fn client_certificate_index(&self) -> usize {
        self.policy.client_certificate_index()
    }

    /// Time between the most recent connect attempt and its result
    pub fn last_connect_latency(&self) -> Duration {
        self.policy.last_connect_latency()
    }

    /// Number of timers currently allocated across the connection and its sub-clients
    pub fn active_timer_count(&self) -> usize {
        self.pipeline.timer_count()
    }

    /// Attaches an RPC client.  The client subscribes to its response topic on the first invoke.
    pub fn add_rpc_client(&mut self, options: RpcClientOptions) -> GneissResult<RpcClientHandle> {
        let id = self.subclients.allocate_id();
        let handle = RpcClientHandle(id);
        self.subclients.add(id, Box::new(RpcClient::new(handle, options)?));

        Ok(handle)
    }

    /// Subscribes an RPC client to its response topic ahead of the first invoke
    pub fn rpc_client_subscribe(&mut self, client: RpcClientHandle, now: Instant) -> GneissResult<()> {
        self.with_subclient(client.0, now, |rpc_client: &mut RpcClient, context| rpc_client.subscribe(context))
    }

    /// Unsubscribes an RPC client from its response topic
    pub fn rpc_client_unsubscribe(&mut self, client: RpcClientHandle, now: Instant) -> GneissResult<()> {
        self.with_subclient(client.0, now, |rpc_client: &mut RpcClient, context| rpc_client.unsubscribe(context))
    }

    /// Invokes a command.  The response (or failure) arrives later through the listener.
    pub fn invoke(&mut self, client: RpcClientHandle, request: &InvokeRequest, now: Instant) -> GneissResult<()> {
        self.with_subclient(client.0, now, |rpc_client: &mut RpcClient, context| rpc_client.invoke(request, context))
    }

    /// Discards an outstanding or faulted invocation
    pub fn remove_request(&mut self, client: RpcClientHandle, correlation_id: &CorrelationId, now: Instant) -> GneissResult<()> {
        self.with_subclient(client.0, now, |rpc_client: &mut RpcClient, context| rpc_client.remove_request(correlation_id, context))
    }

    /// Current state of an RPC client
    pub fn rpc_client_state(&self, client: RpcClientHandle) -> GneissResult<RpcClientState> {
        Ok(self.subclients.get::<RpcClient>(client.0)?.state())
    }

    /// Topic filter an RPC client subscribes to for its responses
    pub fn rpc_client_response_filter(&self, client: RpcClientHandle) -> GneissResult<String> {
        Ok(self.subclients.get::<RpcClient>(client.0)?.response_filter().to_string())
    }

    /// Current state of an invocation, or `None` once it has completed or been removed
    pub fn request_state(&self, client: RpcClientHandle, correlation_id: &CorrelationId) -> GneissResult<Option<RequestState>> {
        Ok(self.subclients.get::<RpcClient>(client.0)?.request_state(correlation_id))
    }

    /// Detaches an RPC client, abandoning its outstanding invocations
    pub fn remove_rpc_client(&mut self, client: RpcClientHandle) -> GneissResult<()> {
        self.remove_subclient(client.0)
    }

    /// Attaches an RPC server.  It receives nothing until [`Connection::register_rpc_server`].
    pub fn add_rpc_server(&mut self, options: RpcServerOptions) -> GneissResult<RpcServerHandle> {
        let id = self.subclients.allocate_id();
        let handle = RpcServerHandle(id);
        self.subclients.add(id, Box::new(RpcServer::new(handle, options)?));

        Ok(handle)
    }

    /// Subscribes an RPC server to its request topic filter
    pub fn register_rpc_server(&mut self, server: RpcServerHandle, now: Instant) -> GneissResult<()> {
        self.with_subclient(server.0, now, |rpc_server: &mut RpcServer, context| rpc_server.register(context))
    }

    /// Publishes the application's answer to an execute-command event
    pub fn execution_finish(&mut self, server: RpcServerHandle, response: &ExecutionFinishRequest, now: Instant) -> GneissResult<()> {
        self.with_subclient(server.0, now, |rpc_server: &mut RpcServer, context| rpc_server.execution_finish(response, context))
    }

    /// Current state of an RPC server
    pub fn rpc_server_state(&self, server: RpcServerHandle) -> GneissResult<RpcServerState> {
        Ok(self.subclients.get::<RpcServer>(server.0)?.state())
    }

    /// Topic filter an RPC server subscribes to for incoming requests
    pub fn rpc_server_subscription_filter(&self, server: RpcServerHandle) -> GneissResult<String> {
        Ok(self.subclients.get::<RpcServer>(server.0)?.subscription_filter().to_string())
    }

    /// Detaches an RPC server; unanswered requests are dropped without a response
    pub fn remove_rpc_server(&mut self, server: RpcServerHandle) -> GneissResult<()> {
        self.remove_subclient(server.0)
    }

    /// Attaches a telemetry producer
    pub fn add_telemetry_producer(&mut self, options: TelemetryProducerOptions) -> GneissResult<TelemetryProducerHandle> {
        let id = self.subclients.allocate_id();
        let handle = TelemetryProducerHandle(id);
        self.subclients.add(id, Box::new(TelemetryProducer::new(handle, options)?));

        Ok(handle)
    }

    /// Publishes a telemetry message
    pub fn send_telemetry(&mut self, producer: TelemetryProducerHandle, request: &TelemetryRequest, now: Instant) -> GneissResult<()> {
        self.with_subclient(producer.0, now, |telemetry: &mut TelemetryProducer, context| telemetry.send(request, context))
    }

    /// Current state of a telemetry producer
    pub fn telemetry_producer_state(&self, producer: TelemetryProducerHandle) -> GneissResult<TelemetryProducerState> {
        Ok(self.subclients.get::<TelemetryProducer>(producer.0)?.state())
    }

    /// Detaches a telemetry producer
    pub fn remove_telemetry_producer(&mut self, producer: TelemetryProducerHandle) -> GneissResult<()> {
        self.remove_subclient(producer.0)
    }

    /// Attaches a telemetry consumer.  It receives nothing until
    /// [`Connection::telemetry_consumer_subscribe`].
    pub fn add_telemetry_consumer(&mut self, options: TelemetryConsumerOptions) -> GneissResult<TelemetryConsumerHandle> {
        let id = self.subclients.allocate_id();
        let handle = TelemetryConsumerHandle(id);
        self.subclients.add(id, Box::new(TelemetryConsumer::new(handle, options)?));

        Ok(handle)
    }

    /// Subscribes a telemetry consumer to its telemetry topic filter
    pub fn telemetry_consumer_subscribe(&mut self, consumer: TelemetryConsumerHandle, now: Instant) -> GneissResult<()> {
        self.with_subclient(consumer.0, now, |telemetry: &mut TelemetryConsumer, context| telemetry.subscribe(context))
    }

    /// Unsubscribes a telemetry consumer from its telemetry topic filter
    pub fn telemetry_consumer_unsubscribe(&mut self, consumer: TelemetryConsumerHandle, now: Instant) -> GneissResult<()> {
        self.with_subclient(consumer.0, now, |telemetry: &mut TelemetryConsumer, context| telemetry.unsubscribe(context))
    }

    /// Current state of a telemetry consumer
    pub fn telemetry_consumer_state(&self, consumer: TelemetryConsumerHandle) -> GneissResult<TelemetryConsumerState> {
        Ok(self.subclients.get::<TelemetryConsumer>(consumer.0)?.state())
    }

    /// Topic filter a telemetry consumer subscribes to
    pub fn telemetry_consumer_subscription_filter(&self, consumer: TelemetryConsumerHandle) -> GneissResult<String> {
        Ok(self.subclients.get::<TelemetryConsumer>(consumer.0)?.subscription_filter().to_string())
    }

    /// Detaches a telemetry consumer
    pub fn remove_telemetry_consumer(&mut self, consumer: TelemetryConsumerHandle) -> GneissResult<()> {
        self.remove_subclient(consumer.0)
    }

    fn handle_policy_event(&mut self, event: &Event<'_>) -> GneissResult<()> {
        let mut context = ConnectionContext {
            pipeline: &mut self.pipeline,
            subclients: Some(&mut self.subclients),
        };

        self.policy.handle(event, &mut context)
    }

    fn with_subclient<T, R, F>(&mut self, id: SubclientId, now: Instant, operation: F) -> GneissResult<R>
        where T: EventPolicy, F: FnOnce(&mut T, &mut PolicyContext<'_>) -> GneissResult<R> {
        self.pipeline.set_current_time(now);

        let subclient = self.subclients.get_mut::<T>(id)?;
        let mut context = PolicyContext::new(&mut self.policy, &mut self.pipeline);
        operation(subclient, &mut context)
    }

    fn remove_subclient(&mut self, id: SubclientId) -> GneissResult<()> {
        let mut subclient = self.subclients.remove(id)?;
        let mut context = PolicyContext::new(&mut self.policy, &mut self.pipeline);
        subclient.release(&mut context);
        observe_debug!(self.pipeline.observer(), Component::Connection, "detached sub-client {}", id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GneissError;
    use crate::mqtt::*;
    use crate::rpc::RpcStatus;
    use crate::testing::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    struct ConnectionFixture {
        harness: TestHarness,
        connection: Connection,
        now: Instant,
    }

    impl ConnectionFixture {
        fn new(options: ConnectionOptions) -> Self {
            let harness = TestHarness::new();
            let now = Instant::now();
            let connection = Connection::new(options, harness.create_transport(), harness.create_listener(), now);

            ConnectionFixture {
                harness,
                connection,
                now,
            }
        }

        fn new_default() -> Self {
            ConnectionFixture::new(ConnectionOptionsBuilder::new("localhost", "client").build().unwrap())
        }

        fn transport_event(&mut self, event: TransportEvent) -> GneissResult<()> {
            self.connection.handle_transport_event(&event, self.now)
        }

        fn connect(&mut self) {
            self.connection.open(self.now).unwrap();
            self.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::Success }).unwrap();
            assert_eq!(ConnectionState::Connected, self.connection.state());
        }

        fn advance_to_next_service_time(&mut self) {
            self.now = self.connection.next_service_time().unwrap();
            self.connection.service(self.now).unwrap();
        }

        fn last_subscribe_id(&self) -> PacketId {
            self.harness.transport().last_subscribe().1
        }

        fn last_publish_id(&self) -> PacketId {
            self.harness.transport().last_publish().packet_id
        }
    }

    #[test]
    fn request_forwarded_to_server_after_connect_and_subscribe() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.connect();

        let server = fixture.connection.add_rpc_server(RpcServerOptionsBuilder::new("client", "model")
            .with_request_topic_format("topic/{name}")
            .build()
            .unwrap()).unwrap();
        assert_eq!("topic/+", fixture.connection.rpc_server_subscription_filter(server).unwrap());
        fixture.connection.register_rpc_server(server, fixture.now).unwrap();
        assert_eq!("topic/+", fixture.harness.transport().last_subscribe().0.topic_filter);

        let id = fixture.last_subscribe_id();
        fixture.transport_event(TransportEvent::Suback { id, reason_code: SubackReasonCode::GrantedQos1 }).unwrap();
        assert_eq!(RpcServerState::Waiting, fixture.connection.rpc_server_state(server).unwrap());

        let mut properties = PropertyBag::new();
        properties.append_string(PropertyType::ResponseTopic, "topic/foo/response").unwrap();
        properties.append_binary(PropertyType::CorrelationData, &[1, 2, 3, 4]).unwrap();
        properties.append_string(PropertyType::ContentType, "application/cbor").unwrap();
        fixture.transport_event(TransportEvent::PublishReceived(create_publish("topic/foo", b"payload", properties))).unwrap();

        let events = fixture.harness.events();
        assert_matches!(events.last(), Some(ConnectionEvent::ExecuteCommand(request)) => {
            assert_eq!(server, request.server);
            assert_eq!("topic/foo/response", request.response_topic);
            assert_eq!(CorrelationId::new(&[1, 2, 3, 4]), request.correlation_id);
            assert_eq!("application/cbor", request.content_type);
            assert_eq!("foo", request.command_name);
            assert_eq!(b"payload".to_vec(), request.request_payload);
        });
    }

    #[test]
    fn rejected_credentials_rotate_client_certificate() {
        let first = ClientCertificate::new(b"first-cert", b"first-key");
        let second = ClientCertificate::new(b"second-cert", b"second-key");
        let mut fixture = ConnectionFixture::new(ConnectionOptionsBuilder::new("localhost", "client")
            .with_client_certificate(first.clone())
            .with_client_certificate(second.clone())
            .build()
            .unwrap());

        fixture.connection.open(fixture.now).unwrap();
        assert_eq!(Some(first), fixture.harness.transport().connects[0].certificate);

        fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::NotAuthorized }).unwrap();
        assert_eq!(ConnectionState::ReconnectTimeout, fixture.connection.state());
        assert_eq!(1, fixture.connection.client_certificate_index());
        assert_eq!(1, fixture.connection.reconnect_attempts());
        assert_matches!(fixture.harness.events().last(), Some(ConnectionEvent::Retry { attempt: 1, .. }));

        fixture.advance_to_next_service_time();
        assert_eq!(ConnectionState::Connecting, fixture.connection.state());
        assert_eq!(Some(second), fixture.harness.transport().connects[1].certificate);
        assert_eq!(0, fixture.connection.active_timer_count());
    }

    #[test]
    fn non_credential_failure_keeps_certificate() {
        let mut fixture = ConnectionFixture::new(ConnectionOptionsBuilder::new("localhost", "client")
            .with_client_certificate(ClientCertificate::new(b"a", b"a"))
            .with_client_certificate(ClientCertificate::new(b"b", b"b"))
            .build()
            .unwrap());

        fixture.connection.open(fixture.now).unwrap();
        fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::ServerUnavailable }).unwrap();
        assert_eq!(ConnectionState::ReconnectTimeout, fixture.connection.state());
        assert_eq!(0, fixture.connection.client_certificate_index());
    }

    #[test]
    fn retries_are_exhausted() {
        let mut fixture = ConnectionFixture::new(ConnectionOptionsBuilder::new("localhost", "client")
            .with_max_connect_attempts(2)
            .build()
            .unwrap());

        fixture.connection.open(fixture.now).unwrap();
        for _ in 0..2 {
            fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::ServerBusy }).unwrap();
            assert_eq!(ConnectionState::ReconnectTimeout, fixture.connection.state());
            fixture.advance_to_next_service_time();
        }

        fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::ServerBusy }).unwrap();
        assert_eq!(ConnectionState::Faulted, fixture.connection.state());
        assert_eq!(0, fixture.connection.active_timer_count());

        let events = fixture.harness.events();
        assert!(events.contains(&ConnectionEvent::RetryExhausted { attempts: 3 }));
        assert_matches!(events.last(), Some(ConnectionEvent::Error(error)) => {
            assert_eq!(Component::Connection, error.component);
        });

        assert_matches!(fixture.connection.open(fixture.now), Err(GneissError::InvalidState(_)));
    }

    #[test]
    fn lost_connection_reconnects_immediately() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.connect();

        fixture.transport_event(TransportEvent::DisconnectResponse { reason_code: DisconnectReasonCode::ServerBusy, disconnect_requested: false }).unwrap();
        assert_eq!(ConnectionState::Connecting, fixture.connection.state());
        assert_eq!(2, fixture.harness.transport().connects.len());
    }

    #[test]
    fn close_during_backoff_returns_to_idle() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.connection.open(fixture.now).unwrap();
        fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::ServerBusy }).unwrap();
        assert_eq!(1, fixture.connection.active_timer_count());

        fixture.connection.close(fixture.now).unwrap();
        assert_eq!(ConnectionState::Idle, fixture.connection.state());
        assert_eq!(0, fixture.connection.active_timer_count());
        assert_matches!(fixture.harness.events().last(), Some(ConnectionEvent::DisconnectResponse { disconnect_requested: true, .. }));
    }

    #[test]
    fn unacknowledged_disconnect_faults() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.connect();

        fixture.connection.close(fixture.now).unwrap();
        assert_eq!(ConnectionState::Disconnecting, fixture.connection.state());
        assert_eq!(1, fixture.harness.transport().disconnects);

        fixture.advance_to_next_service_time();
        assert_eq!(ConnectionState::Faulted, fixture.connection.state());
        assert_eq!(0, fixture.connection.active_timer_count());
    }

    #[test]
    fn rejected_open_returns_to_idle() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.harness.transport().fail_connect = true;

        assert_matches!(fixture.connection.open(fixture.now), Err(GneissError::TransportError(_)));
        assert_eq!(ConnectionState::Idle, fixture.connection.state());
    }

    #[test]
    fn close_while_connecting_disconnects_again_if_connect_completes() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.connection.open(fixture.now).unwrap();
        assert_eq!(ConnectionState::Connecting, fixture.connection.state());

        fixture.connection.close(fixture.now).unwrap();
        assert_eq!(ConnectionState::Disconnecting, fixture.connection.state());
        assert_eq!(1, fixture.harness.transport().disconnects);
        assert_eq!(1, fixture.connection.active_timer_count());

        // the connect raced the close
        fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::Success }).unwrap();
        assert_eq!(ConnectionState::Disconnecting, fixture.connection.state());
        assert_eq!(2, fixture.harness.transport().disconnects);

        fixture.transport_event(TransportEvent::DisconnectResponse { reason_code: DisconnectReasonCode::NormalDisconnection, disconnect_requested: true }).unwrap();
        assert_eq!(ConnectionState::Idle, fixture.connection.state());
        assert_eq!(0, fixture.connection.active_timer_count());
        assert_matches!(fixture.harness.events().last(), Some(ConnectionEvent::DisconnectResponse { disconnect_requested: true, .. }));
    }

    #[test]
    fn failed_connect_while_disconnecting_is_not_answered() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.connection.open(fixture.now).unwrap();
        fixture.connection.close(fixture.now).unwrap();

        fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::ServerBusy }).unwrap();
        assert_eq!(ConnectionState::Disconnecting, fixture.connection.state());
        assert_eq!(1, fixture.harness.transport().disconnects);
    }

    #[test]
    fn disconnect_while_connecting_counts_as_failed_attempt() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.connection.open(fixture.now).unwrap();

        fixture.transport_event(TransportEvent::DisconnectResponse { reason_code: DisconnectReasonCode::ServerBusy, disconnect_requested: false }).unwrap();
        assert_eq!(ConnectionState::ReconnectTimeout, fixture.connection.state());
        assert_eq!(1, fixture.connection.reconnect_attempts());
        assert_eq!(1, fixture.connection.active_timer_count());

        let events = fixture.harness.events();
        assert_matches!(&events[events.len() - 2], ConnectionEvent::DisconnectResponse { disconnect_requested: false, .. });
        assert_matches!(events.last(), Some(ConnectionEvent::Retry { attempt: 1, .. }));

        fixture.advance_to_next_service_time();
        assert_eq!(ConnectionState::Connecting, fixture.connection.state());
        assert_eq!(2, fixture.harness.transport().connects.len());
    }

    #[test]
    fn timers_do_not_leak_across_state_churn() {
        let mut fixture = ConnectionFixture::new_default();
        let client = fixture.connection.add_rpc_client(RpcClientOptionsBuilder::new("client", "model").build().unwrap()).unwrap();

        for cycle in 0..100 {
            fixture.connection.open(fixture.now).unwrap();
            fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::Success }).unwrap();

            let correlation_id = CorrelationId::from(format!("request-{}", cycle).as_str());
            let request = InvokeRequest {
                correlation_id: correlation_id.clone(),
                command_name: "ping".to_string(),
                ..Default::default()
            };
            if cycle == 0 {
                fixture.connection.invoke(client, &request, fixture.now).unwrap();
                let id = fixture.last_subscribe_id();
                fixture.transport_event(TransportEvent::Suback { id, reason_code: SubackReasonCode::GrantedQos1 }).unwrap();
            } else {
                fixture.connection.invoke(client, &request, fixture.now).unwrap();
            }

            let id = fixture.last_publish_id();
            fixture.transport_event(TransportEvent::Puback { id, reason_code: PubackReasonCode::NotAuthorized }).unwrap();
            assert_eq!(Some(RequestState::Faulted), fixture.connection.request_state(client, &correlation_id).unwrap());
            fixture.connection.remove_request(client, &correlation_id, fixture.now).unwrap();

            fixture.transport_event(TransportEvent::DisconnectResponse { reason_code: DisconnectReasonCode::UnspecifiedError, disconnect_requested: false }).unwrap();
            fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::ServerBusy }).unwrap();
            assert_eq!(ConnectionState::ReconnectTimeout, fixture.connection.state());

            fixture.connection.close(fixture.now).unwrap();
            assert_eq!(ConnectionState::Idle, fixture.connection.state());

            fixture.connection.open(fixture.now).unwrap();
            fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::Success }).unwrap();
            fixture.connection.close(fixture.now).unwrap();
            assert_eq!(ConnectionState::Disconnecting, fixture.connection.state());
            fixture.transport_event(TransportEvent::DisconnectResponse { reason_code: DisconnectReasonCode::NormalDisconnection, disconnect_requested: true }).unwrap();
            assert_eq!(ConnectionState::Idle, fixture.connection.state());

            assert_eq!(0, fixture.connection.active_timer_count(), "cycle {}", cycle);
        }
    }

    #[test]
    fn rpc_round_trip_through_connection() {
        let mut fixture = ConnectionFixture::new_default();
        let client = fixture.connection.add_rpc_client(RpcClientOptionsBuilder::new("client", "model").build().unwrap()).unwrap();

        // not connected: the auto-subscribe is rejected and the client stays idle
        let request = InvokeRequest {
            correlation_id: CorrelationId::from("X"),
            command_name: "unlock".to_string(),
            ..Default::default()
        };
        assert_matches!(fixture.connection.invoke(client, &request, fixture.now), Err(GneissError::NotConnected(_)));
        assert_eq!(RpcClientState::Idle, fixture.connection.rpc_client_state(client).unwrap());

        fixture.connect();
        fixture.connection.invoke(client, &request, fixture.now).unwrap();
        assert_eq!(fixture.connection.rpc_client_response_filter(client).unwrap(), fixture.harness.transport().last_subscribe().0.topic_filter);
        let id = fixture.last_subscribe_id();
        fixture.transport_event(TransportEvent::Suback { id, reason_code: SubackReasonCode::GrantedQos1 }).unwrap();
        assert_eq!(RpcClientState::SubscribedAndWaiting, fixture.connection.rpc_client_state(client).unwrap());

        let (response_topic, id) = {
            let transport = fixture.harness.transport();
            let publish = transport.last_publish();
            assert_eq!("vehicles/model/commands/_any_/unlock", publish.topic);
            (publish.properties.read_string(PropertyType::ResponseTopic).unwrap().to_string(), publish.packet_id)
        };
        fixture.transport_event(TransportEvent::Puback { id, reason_code: PubackReasonCode::Success }).unwrap();
        assert_eq!(Some(RequestState::Waiting), fixture.connection.request_state(client, &request.correlation_id).unwrap());

        let mut properties = PropertyBag::new();
        properties.append_binary(PropertyType::CorrelationData, b"X").unwrap();
        properties.append_string_pair(PropertyType::UserProperty, "status", "200").unwrap();
        fixture.transport_event(TransportEvent::PublishReceived(create_publish(&response_topic, b"done", properties))).unwrap();

        assert_eq!(None, fixture.connection.request_state(client, &request.correlation_id).unwrap());
        assert_matches!(fixture.harness.events().last(), Some(ConnectionEvent::RpcClientResponse(response)) => {
            assert_eq!(client, response.client);
            assert_eq!(RpcStatus::OK, response.status);
            assert_eq!(b"done".to_vec(), response.payload);
        });
        assert_eq!(0, fixture.connection.active_timer_count());
    }

    #[test]
    fn request_timers_fire_through_service() {
        let mut fixture = ConnectionFixture::new_default();
        fixture.connect();
        let client = fixture.connection.add_rpc_client(RpcClientOptionsBuilder::new("client", "model")
            .with_publish_timeout(Duration::from_secs(2))
            .build()
            .unwrap()).unwrap();
        fixture.connection.rpc_client_subscribe(client, fixture.now).unwrap();
        let id = fixture.last_subscribe_id();
        fixture.transport_event(TransportEvent::Suback { id, reason_code: SubackReasonCode::GrantedQos1 }).unwrap();

        let correlation_id = CorrelationId::from("unacknowledged");
        fixture.connection.invoke(client, &InvokeRequest {
            correlation_id: correlation_id.clone(),
            command_name: "unlock".to_string(),
            ..Default::default()
        }, fixture.now).unwrap();

        fixture.advance_to_next_service_time();
        assert_eq!(Some(RequestState::Faulted), fixture.connection.request_state(client, &correlation_id).unwrap());
        assert_matches!(fixture.harness.events().last(), Some(ConnectionEvent::RpcClientError(response)) => {
            assert_eq!(RpcStatus::TIMEOUT, response.status);
        });
    }

    #[test]
    fn telemetry_through_connection() {
        let mut fixture = ConnectionFixture::new_default();
        let producer = fixture.connection.add_telemetry_producer(TelemetryProducerOptionsBuilder::new("client", "model").build().unwrap()).unwrap();
        let request = TelemetryRequest {
            telemetry_name: "speed".to_string(),
            qos: QualityOfService::AtLeastOnce,
            content_type: "application/json".to_string(),
            payload: b"42".to_vec(),
        };

        assert_matches!(fixture.connection.send_telemetry(producer, &request, fixture.now), Err(GneissError::NotConnected(_)));

        fixture.connect();
        fixture.connection.send_telemetry(producer, &request, fixture.now).unwrap();
        assert_eq!(TelemetryProducerState::Publishing, fixture.connection.telemetry_producer_state(producer).unwrap());

        fixture.connection.remove_telemetry_producer(producer).unwrap();
        assert_eq!(0, fixture.connection.active_timer_count());
        assert_matches!(fixture.connection.telemetry_producer_state(producer), Err(GneissError::NotSupported(_)));
        assert_matches!(fixture.connection.remove_telemetry_producer(producer), Err(GneissError::ItemNotFound(_)));
    }

    #[test]
    fn telemetry_consumer_receives_producer_output() {
        let mut fixture = ConnectionFixture::new_default();
        let producer = fixture.connection.add_telemetry_producer(TelemetryProducerOptionsBuilder::new("vehicle-1", "model").build().unwrap()).unwrap();
        let consumer = fixture.connection.add_telemetry_consumer(TelemetryConsumerOptionsBuilder::new("model").build().unwrap()).unwrap();
        assert_eq!("vehicles/model/telemetry/+/+", fixture.connection.telemetry_consumer_subscription_filter(consumer).unwrap());

        assert_matches!(fixture.connection.telemetry_consumer_subscribe(consumer, fixture.now), Err(GneissError::NotConnected(_)));
        assert_eq!(TelemetryConsumerState::Ready, fixture.connection.telemetry_consumer_state(consumer).unwrap());

        fixture.connect();
        fixture.connection.telemetry_consumer_subscribe(consumer, fixture.now).unwrap();
        assert_eq!(TelemetryConsumerState::Subscribing, fixture.connection.telemetry_consumer_state(consumer).unwrap());
        let id = fixture.last_subscribe_id();
        fixture.transport_event(TransportEvent::Suback { id, reason_code: SubackReasonCode::GrantedQos1 }).unwrap();
        assert_eq!(TelemetryConsumerState::Ready, fixture.connection.telemetry_consumer_state(consumer).unwrap());

        fixture.connection.send_telemetry(producer, &TelemetryRequest {
            telemetry_name: "speed".to_string(),
            qos: QualityOfService::AtMostOnce,
            content_type: "text/plain".to_string(),
            payload: b"42".to_vec(),
        }, fixture.now).unwrap();

        // loop the producer's publish back in as if the broker delivered it
        let (topic, payload, properties) = {
            let transport = fixture.harness.transport();
            let publish = transport.last_publish();
            (publish.topic.clone(), publish.payload.clone(), publish.properties.clone())
        };
        fixture.transport_event(TransportEvent::PublishReceived(create_publish(&topic, &payload, properties))).unwrap();

        assert_matches!(fixture.harness.events().last(), Some(ConnectionEvent::TelemetryReceived(message)) => {
            assert_eq!(consumer, message.consumer);
            assert_eq!("vehicle-1", message.sender_id);
            assert_eq!("speed", message.telemetry_name);
            assert_eq!(Some("text/plain".to_string()), message.content_type);
            assert_eq!(b"42".to_vec(), message.payload);
        });

        fixture.connection.telemetry_consumer_unsubscribe(consumer, fixture.now).unwrap();
        assert_eq!("vehicles/model/telemetry/+/+", fixture.harness.transport().unsubscribes[0].0.topic_filter);

        fixture.connection.remove_telemetry_consumer(consumer).unwrap();
        assert_matches!(fixture.connection.telemetry_consumer_state(consumer), Err(GneissError::NotSupported(_)));
    }

    #[test]
    fn injected_observer_sees_state_transitions() {
        let observer = Arc::new(RecordingObserver::new(log::Level::Info));
        let mut fixture = ConnectionFixture::new(ConnectionOptionsBuilder::new("localhost", "client")
            .with_observer(observer.clone())
            .build()
            .unwrap());

        fixture.connect();

        let messages = observer.messages();
        assert!(messages.contains(&"Connection - entered Connecting".to_string()));
        assert!(messages.contains(&"Connection - entered Connected".to_string()));
        assert!(messages.iter().all(|message| !message.starts_with("Pipeline")));
    }

    #[test]
    fn unmanaged_connection_passes_events_through() {
        let mut fixture = ConnectionFixture::new(ConnectionOptionsBuilder::new("localhost", "client")
            .with_connection_management_disabled()
            .build()
            .unwrap());

        fixture.connection.open(fixture.now).unwrap();
        assert_eq!(1, fixture.harness.transport().connects.len());

        fixture.transport_event(TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::NotAuthorized }).unwrap();
        assert_eq!(ConnectionState::Idle, fixture.connection.state());
        assert_eq!(None, fixture.connection.next_service_time());
        assert_matches!(fixture.harness.events().last(), Some(ConnectionEvent::ConnectResponse { reason_code: ConnectReasonCode::NotAuthorized }));

        fixture.connection.close(fixture.now).unwrap();
        assert_eq!(1, fixture.harness.transport().disconnects);
    }
}
