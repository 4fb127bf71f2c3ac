/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The connection state machine: connect/disconnect lifecycle, reconnect with backoff, and client
certificate rotation.

```text
root
 ├── idle
 ├── started
 │    ├── connecting
 │    ├── connected
 │    ├── reconnect_timeout
 │    └── disconnecting
 └── faulted
```
 */

use crate::collection::{PolicyCollection, PolicyContext};
use crate::config::ConnectionOptions;
use crate::error::{GneissError, GneissResult};
use crate::event::*;
use crate::hfsm::*;
use crate::logging::*;
use crate::mqtt::*;
use crate::pipeline::{EventPipeline, TimerId};

use std::fmt;
use std::time::{Duration, Instant};

/// States of the connection state machine.
///
/// `Root` and `Started` are superstates; [`Connection::state`](crate::connection::Connection::state)
/// only ever reports one of the leaf states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {

    /// Superstate of every other state
    Root,

    /// Not connected and not trying to connect
    Idle,

    /// Superstate of the states between an open request and the return to idle
    Started,

    /// A connect attempt is in flight
    Connecting,

    /// The connection is established
    Connected,

    /// Waiting out the backoff delay before the next connect attempt
    ReconnectTimeout,

    /// A disconnect is in flight
    Disconnecting,

    /// Unrecoverable; the connection must be recreated
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Root => { write!(f, "Root") }
            ConnectionState::Idle => { write!(f, "Idle") }
            ConnectionState::Started => { write!(f, "Started") }
            ConnectionState::Connecting => { write!(f, "Connecting") }
            ConnectionState::Connected => { write!(f, "Connected") }
            ConnectionState::ReconnectTimeout => { write!(f, "ReconnectTimeout") }
            ConnectionState::Disconnecting => { write!(f, "Disconnecting") }
            ConnectionState::Faulted => { write!(f, "Faulted") }
        }
    }
}

/// Context threaded through connection state machine handlers.  `subclients` is absent while the
/// machine is being re-entered by a sub-client's own outbound operation.
pub(crate) struct ConnectionContext<'a> {
    pub(crate) pipeline: &'a mut EventPipeline,
    pub(crate) subclients: Option<&'a mut PolicyCollection>,
}

impl ConnectionContext<'_> {

    fn forward_inbound(&mut self, connection: &mut ConnectionPolicy, event: &Event<'_>) -> GneissResult<()> {
        match self.subclients.as_deref_mut() {
            Some(subclients) => {
                let mut context = PolicyContext::new(connection, &mut *self.pipeline);
                subclients.dispatch_inbound(event, &mut context)
            }
            None => { Ok(()) }
        }
    }
}

pub(crate) struct ConnectionPolicy {
    state: ConnectionState,
    options: ConnectionOptions,

    reconnect_attempts: u32,
    client_certificate_index: usize,
    connect_start: Option<Instant>,
    last_connect_latency: Duration,

    reconnect_timer: Option<TimerId>,
    disconnect_timer: Option<TimerId>,
}

impl ConnectionPolicy {

    pub(crate) fn new(options: ConnectionOptions) -> Self {
        ConnectionPolicy {
            state: ConnectionState::Idle,
            options,
            reconnect_attempts: 0,
            client_certificate_index: 0,
            connect_start: None,
            last_connect_latency: Duration::ZERO,
            reconnect_timer: None,
            disconnect_timer: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub(crate) fn client_certificate_index(&self) -> usize {
        self.client_certificate_index
    }

    pub(crate) fn last_connect_latency(&self) -> Duration {
        self.last_connect_latency
    }

    pub(crate) fn owns_timer(&self, id: TimerId) -> bool {
        self.reconnect_timer == Some(id) || self.disconnect_timer == Some(id)
    }

    /// Entry point for application requests, transport events and connection timeouts.
    pub(crate) fn handle(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<()> {
        if self.options.disable_connection_management {
            return self.handle_unmanaged(event, context);
        }

        send_event(self, event, context)
    }

    /// Routes an outbound publish, subscribe or unsubscribe issued by a sub-client and returns
    /// the packet id the transport assigned to it.
    pub(crate) fn submit_outbound(&mut self, event: &Event<'_>, pipeline: &mut EventPipeline) -> GneissResult<PacketId> {
        if self.options.disable_connection_management {
            return submit_to_transport(event, pipeline);
        }

        pipeline.take_assigned_packet_id();

        let mut context = ConnectionContext {
            pipeline: &mut *pipeline,
            subclients: None,
        };
        send_event(self, event, &mut context)?;

        pipeline.take_assigned_packet_id().ok_or_else(|| {
            GneissError::new_internal_state_error(format!("outbound {} was not assigned a packet id", event))
        })
    }

    fn handle_unmanaged(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<()> {
        observe_debug!(context.pipeline.observer(), Component::Connection, "unmanaged - handling {}", event);

        match event {
            Event::OpenRequest => {
                let request = self.create_connect_request();
                context.pipeline.transport().connect(&request)
            }
            Event::CloseRequest => {
                context.pipeline.transport().disconnect()
            }
            Event::ConnectResponse(reason_code) => {
                context.pipeline.notify(ConnectionEvent::ConnectResponse { reason_code: *reason_code });
                context.forward_inbound(self, event)
            }
            Event::DisconnectResponse { reason_code, disconnect_requested } => {
                context.pipeline.notify(ConnectionEvent::DisconnectResponse { reason_code: *reason_code, disconnect_requested: *disconnect_requested });
                context.forward_inbound(self, event)
            }
            Event::Publish(_) | Event::Subscribe(_) | Event::Unsubscribe(_) => {
                submit_to_transport(event, context.pipeline).map(|_| ())
            }
            _ => {
                context.forward_inbound(self, event)
            }
        }
    }

    fn create_connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            host: self.options.host.clone(),
            port: self.options.port,
            client_id: self.options.client_id.clone(),
            username: self.options.username.clone(),
            password: self.options.password.clone(),
            certificate: self.options.client_certificates.get(self.client_certificate_index).cloned(),
        }
    }

    fn issue_connect(&self, pipeline: &mut EventPipeline) -> GneissResult<()> {
        let request = self.create_connect_request();
        observe_debug!(pipeline.observer(), Component::Connection, "issuing connect to {}:{} with certificate index {}", request.host, request.port, self.client_certificate_index);
        pipeline.transport().connect(&request)
    }

    fn rotate_client_certificate(&mut self, reason_code: ConnectReasonCode, pipeline: &EventPipeline) {
        let certificate_count = self.options.client_certificates.len();
        if certificate_count == 0 || !(self.options.credential_swap_fn)(reason_code) {
            return;
        }

        self.client_certificate_index = (self.client_certificate_index + 1) % certificate_count;
        observe_info!(pipeline.observer(), Component::Connection, "connect rejected with {:?} - rotating to client certificate {}", reason_code, self.client_certificate_index);
    }

    fn notify_error(&self, pipeline: &EventPipeline, message: String) {
        pipeline.notify(ConnectionEvent::Error(ErrorEvent {
            component: Component::Connection,
            message,
        }));
    }

    fn root(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Exit => {
                panic!("connection state machine exited its root state");
            }
            Event::Publish(_) | Event::Subscribe(_) | Event::Unsubscribe(_) => {
                Err(GneissError::new_not_connected())
            }
            _ => {
                observe_debug!(context.pipeline.observer(), Component::Connection, "{} - ignoring {}", self.state, event);
                Ok(Disposition::Handled)
            }
        }
    }

    fn idle(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.pipeline.observer(), Component::Connection, "entered Idle");
            }
            Event::Exit => {}
            Event::OpenRequest => {
                transition_peer(self, ConnectionState::Idle, ConnectionState::Started, context)?;
                transition_substate(self, ConnectionState::Started, ConnectionState::Connecting, context)?;

                if let Err(error) = self.issue_connect(context.pipeline) {
                    observe_error!(context.pipeline.observer(), Component::Connection, "transport rejected connect: {}", error);
                    transition_peer(self, ConnectionState::Started, ConnectionState::Idle, context)?;
                    return Err(error);
                }
            }
            Event::CloseRequest | Event::DisconnectResponse { .. } => {
                observe_debug!(context.pipeline.observer(), Component::Connection, "Idle - {} is a no-op", event);
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn started(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                self.reconnect_attempts = 0;
            }
            Event::Exit => {}
            Event::OpenRequest => {
                observe_debug!(context.pipeline.observer(), Component::Connection, "{} - already started", self.state);
            }
            Event::ConnectResponse(reason_code) => {
                observe_error!(context.pipeline.observer(), Component::Connection, "{} - unexpected connect response {:?}", self.state, reason_code);
                transition_peer(self, ConnectionState::Started, ConnectionState::Faulted, context)?;
            }
            Event::DisconnectResponse { reason_code, disconnect_requested } => {
                context.pipeline.notify(ConnectionEvent::DisconnectResponse { reason_code: *reason_code, disconnect_requested: *disconnect_requested });
                transition_peer(self, ConnectionState::Started, ConnectionState::Idle, context)?;
                context.forward_inbound(self, event)?;
            }
            Event::PublishReceived(_) | Event::Puback { .. } | Event::Suback { .. } | Event::Unsuback { .. } => {
                context.forward_inbound(self, event)?;
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn connecting(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.pipeline.observer(), Component::Connection, "entered Connecting");
                self.connect_start = Some(context.pipeline.current_time());
            }
            Event::Exit => {
                if let Some(start) = self.connect_start.take() {
                    self.last_connect_latency = context.pipeline.current_time().saturating_duration_since(start);
                }
            }
            Event::ConnectResponse(reason_code) => {
                context.pipeline.notify(ConnectionEvent::ConnectResponse { reason_code: *reason_code });
                if reason_code.is_success() {
                    transition_peer(self, ConnectionState::Connecting, ConnectionState::Connected, context)?;
                    context.forward_inbound(self, event)?;
                } else {
                    observe_warn!(context.pipeline.observer(), Component::Connection, "connect attempt failed with {:?}", reason_code);
                    self.rotate_client_certificate(*reason_code, context.pipeline);
                    transition_peer(self, ConnectionState::Connecting, ConnectionState::ReconnectTimeout, context)?;
                }
            }
            Event::DisconnectResponse { reason_code, disconnect_requested } => {
                context.pipeline.notify(ConnectionEvent::DisconnectResponse { reason_code: *reason_code, disconnect_requested: *disconnect_requested });
                transition_peer(self, ConnectionState::Connecting, ConnectionState::ReconnectTimeout, context)?;
            }
            Event::CloseRequest => {
                transition_peer(self, ConnectionState::Connecting, ConnectionState::Disconnecting, context)?;
                context.pipeline.transport().disconnect()?;
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn connected(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.pipeline.observer(), Component::Connection, "entered Connected");
                self.reconnect_attempts = 0;
            }
            Event::Exit => {}
            Event::DisconnectResponse { reason_code, disconnect_requested } => {
                observe_warn!(context.pipeline.observer(), Component::Connection, "connection lost with {:?}", reason_code);
                context.pipeline.notify(ConnectionEvent::DisconnectResponse { reason_code: *reason_code, disconnect_requested: *disconnect_requested });
                context.forward_inbound(self, event)?;

                transition_peer(self, ConnectionState::Connected, ConnectionState::Connecting, context)?;
                if let Err(error) = self.issue_connect(context.pipeline) {
                    observe_error!(context.pipeline.observer(), Component::Connection, "transport rejected reconnect: {}", error);
                    transition_peer(self, ConnectionState::Connecting, ConnectionState::ReconnectTimeout, context)?;
                }
            }
            Event::CloseRequest => {
                transition_peer(self, ConnectionState::Connected, ConnectionState::Disconnecting, context)?;
                context.pipeline.transport().disconnect()?;
            }
            Event::Publish(_) | Event::Subscribe(_) | Event::Unsubscribe(_) => {
                let id = submit_to_transport(event, context.pipeline)?;
                context.pipeline.set_assigned_packet_id(id);
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn reconnect_timeout(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                self.reconnect_attempts += 1;

                let retry_options = self.options.retry_options;
                if let Some(max_attempts) = retry_options.max_connect_attempts {
                    if self.reconnect_attempts > max_attempts {
                        observe_error!(context.pipeline.observer(), Component::Connection, "giving up after {} failed connect attempts", self.reconnect_attempts);
                        context.pipeline.notify(ConnectionEvent::RetryExhausted { attempts: self.reconnect_attempts });
                        transition_peer(self, ConnectionState::Started, ConnectionState::Faulted, context)?;
                        return Ok(Disposition::Handled);
                    }
                }

                let delay = (self.options.retry_delay_fn)(
                    self.last_connect_latency,
                    self.reconnect_attempts - 1,
                    retry_options.min_retry_delay,
                    retry_options.max_retry_delay,
                    retry_options.max_random_jitter);

                observe_info!(context.pipeline.observer(), Component::Connection, "entered ReconnectTimeout - attempt {} in {:?}", self.reconnect_attempts, delay);
                self.reconnect_timer = Some(context.pipeline.start_new_timer(delay)?);
                context.pipeline.notify(ConnectionEvent::Retry { attempt: self.reconnect_attempts, delay });
            }
            Event::Exit => {
                if let Some(timer) = self.reconnect_timer.take() {
                    context.pipeline.destroy_timer(timer);
                }
            }
            Event::Timeout(timer) if self.reconnect_timer == Some(*timer) => {
                transition_peer(self, ConnectionState::ReconnectTimeout, ConnectionState::Connecting, context)?;
                if let Err(error) = self.issue_connect(context.pipeline) {
                    observe_error!(context.pipeline.observer(), Component::Connection, "transport rejected reconnect: {}", error);
                    transition_peer(self, ConnectionState::Connecting, ConnectionState::ReconnectTimeout, context)?;
                }
            }
            Event::CloseRequest => {
                let unwind = Event::DisconnectResponse {
                    reason_code: DisconnectReasonCode::NormalDisconnection,
                    disconnect_requested: true,
                };
                send_event(self, &unwind, context)?;
            }
            Event::DisconnectResponse { disconnect_requested: false, .. } => {
                observe_debug!(context.pipeline.observer(), Component::Connection, "ReconnectTimeout - ignoring stray {}", event);
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn disconnecting(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.pipeline.observer(), Component::Connection, "entered Disconnecting");
                self.disconnect_timer = Some(context.pipeline.start_new_timer(self.options.disconnect_timeout)?);
            }
            Event::Exit => {
                if let Some(timer) = self.disconnect_timer.take() {
                    context.pipeline.destroy_timer(timer);
                }
            }
            Event::ConnectResponse(reason_code) => {
                // a reconnect raced the disconnect
                if reason_code.is_success() {
                    observe_debug!(context.pipeline.observer(), Component::Connection, "Disconnecting - connect completed, disconnecting again");
                    context.pipeline.transport().disconnect()?;
                }
            }
            Event::CloseRequest => {}
            Event::Timeout(timer) if self.disconnect_timer == Some(*timer) => {
                observe_error!(context.pipeline.observer(), Component::Connection, "disconnect timed out after {:?}", self.options.disconnect_timeout);
                let error = GneissError::new_timeout("disconnect");
                self.notify_error(context.pipeline, format!("{}: disconnect was not acknowledged within {:?}", error, self.options.disconnect_timeout));
                transition_peer(self, ConnectionState::Started, ConnectionState::Faulted, context)?;
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn faulted(&mut self, event: &Event<'_>, context: &mut ConnectionContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_error!(context.pipeline.observer(), Component::Connection, "entered Faulted");
                self.notify_error(context.pipeline, "connection faulted; it must be recreated".to_string());
                Ok(Disposition::Handled)
            }
            Event::Timeout(_) => {
                Ok(Disposition::Handled)
            }
            _ => {
                Err(GneissError::new_invalid_state(ConnectionState::Faulted, format!("{} rejected", event)))
            }
        }
    }
}

fn submit_to_transport(event: &Event<'_>, pipeline: &mut EventPipeline) -> GneissResult<PacketId> {
    match event {
        Event::Publish(request) => { pipeline.transport().publish(request) }
        Event::Subscribe(request) => { pipeline.transport().subscribe(request) }
        Event::Unsubscribe(request) => { pipeline.transport().unsubscribe(request) }
        _ => {
            Err(GneissError::new_internal_state_error(format!("{} is not an outbound operation", event)))
        }
    }
}

impl<'a> StateMachine<ConnectionContext<'a>> for ConnectionPolicy {
    type State = ConnectionState;

    fn current_state(&self) -> ConnectionState {
        self.state
    }

    fn set_current_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    fn parent_of(state: ConnectionState) -> Option<ConnectionState> {
        match state {
            ConnectionState::Root => { None }
            ConnectionState::Idle | ConnectionState::Started | ConnectionState::Faulted => { Some(ConnectionState::Root) }
            _ => { Some(ConnectionState::Started) }
        }
    }

    fn handle_event(&mut self, state: ConnectionState, event: &Event<'_>, context: &mut ConnectionContext<'a>) -> GneissResult<Disposition> {
        match state {
            ConnectionState::Root => { self.root(event, context) }
            ConnectionState::Idle => { self.idle(event, context) }
            ConnectionState::Started => { self.started(event, context) }
            ConnectionState::Connecting => { self.connecting(event, context) }
            ConnectionState::Connected => { self.connected(event, context) }
            ConnectionState::ReconnectTimeout => { self.reconnect_timeout(event, context) }
            ConnectionState::Disconnecting => { self.disconnecting(event, context) }
            ConnectionState::Faulted => { self.faulted(event, context) }
        }
    }
}
