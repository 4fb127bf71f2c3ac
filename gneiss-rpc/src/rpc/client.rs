/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
RPC client state machine.

```text
root
 ├── idle
 ├── subscribing
 ├── subscribed_and_waiting
 └── faulted
```

The client subscribes to its response topic filter on the first invoke (or an explicit
subscribe), publishes requests once the subscription is acknowledged, and matches responses to
its outstanding requests by correlation id.
 */

use crate::collection::{EventPolicy, PolicyContext, RpcClientHandle};
use crate::config::RpcClientOptions;
use crate::error::{GneissError, GneissResult};
use crate::event::*;
use crate::hfsm::*;
use crate::logging::*;
use crate::mqtt::*;
use crate::pipeline::TimerId;
use crate::request::{CorrelationId, Request, RequestArena, RequestState};
use crate::rpc::*;
use crate::rpc::topic::*;

use std::any::Any;
use std::fmt;
use std::time::Duration;

const MISSING_CORRELATION_MESSAGE : &str = "Cannot process response message without CorrelationData";
const MISSING_STATUS_MESSAGE : &str = "Response does not have the 'status' property.";
const INVALID_STATUS_MESSAGE : &str = "Status property contains invalid value.";

/// A command invocation submitted through an RPC client
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvokeRequest {

    /// Correlation id echoed on the response.  Must be non-empty and unique among the client's
    /// outstanding requests.
    pub correlation_id: CorrelationId,

    /// Name of the command; fills the `{name}` topic token
    pub command_name: String,

    /// Client id of the server that should execute the command.  Defaults to any server.
    pub executor_id: Option<String>,

    /// Content type of the request payload
    pub content_type: Option<String>,

    /// Request payload
    pub request_payload: Vec<u8>,

    /// Time allowed for the command to complete.  Defaults to the client's execution timeout.
    pub timeout: Option<Duration>,
}

/// States of an RPC client
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RpcClientState {

    /// Superstate of every other state
    Root,

    /// Not subscribed to the response topic
    Idle,

    /// Waiting for the response subscription to be acknowledged
    Subscribing,

    /// Subscribed; requests are published immediately
    SubscribedAndWaiting,

    /// The response subscription failed; the client must be recreated
    Faulted,
}

impl fmt::Display for RpcClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcClientState::Root => { write!(f, "Root") }
            RpcClientState::Idle => { write!(f, "Idle") }
            RpcClientState::Subscribing => { write!(f, "Subscribing") }
            RpcClientState::SubscribedAndWaiting => { write!(f, "SubscribedAndWaiting") }
            RpcClientState::Faulted => { write!(f, "Faulted") }
        }
    }
}

pub(crate) struct RpcClient {
    state: RpcClientState,
    handle: RpcClientHandle,
    options: RpcClientOptions,

    request_format: TopicFormat,
    response_format: TopicFormat,
    response_filter: String,
    response_expected: TopicTokens,

    property_bag: PropertyBag,
    requests: RequestArena,

    subscribe_packet_id: Option<PacketId>,
    subscribe_timer: Option<TimerId>,
    deferred_invoke: Option<InvokeRequest>,
    fault_reason: Option<String>,
}

impl RpcClient {

    pub(crate) fn new(handle: RpcClientHandle, options: RpcClientOptions) -> GneissResult<Self> {
        let request_format = TopicFormat::new(&options.request_topic_format)?;
        let response_format = TopicFormat::new(&options.response_topic_format)?;

        let filter_tokens = TopicTokens::new()
            .with(TopicToken::ServiceId, &options.model_id)
            .with(TopicToken::InvokerClientId, &options.client_id)
            .with(TopicToken::ExecutorId, SINGLE_LEVEL_WILDCARD)
            .with(TopicToken::Name, SINGLE_LEVEL_WILDCARD);
        let response_filter = response_format.build_filter(&filter_tokens, None)?;

        let response_expected = TopicTokens::new()
            .with(TopicToken::ServiceId, &options.model_id)
            .with(TopicToken::InvokerClientId, &options.client_id);

        Ok(RpcClient {
            state: RpcClientState::Idle,
            handle,
            options,
            request_format,
            response_format,
            response_filter,
            response_expected,
            property_bag: PropertyBag::new(),
            requests: RequestArena::new(),
            subscribe_packet_id: None,
            subscribe_timer: None,
            deferred_invoke: None,
            fault_reason: None,
        })
    }

    pub(crate) fn state(&self) -> RpcClientState {
        self.state
    }

    pub(crate) fn response_filter(&self) -> &str {
        &self.response_filter
    }

    pub(crate) fn request_state(&self, correlation_id: &CorrelationId) -> Option<RequestState> {
        self.requests.state_of(correlation_id)
    }

    pub(crate) fn subscribe(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, &Event::RpcSubscribeRequest, context)
    }

    pub(crate) fn unsubscribe(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, &Event::RpcUnsubscribeRequest, context)
    }

    pub(crate) fn invoke(&mut self, request: &InvokeRequest, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        self.validate_invoke(request)?;
        send_event(self, &Event::InvokeRequest(request), context)
    }

    pub(crate) fn remove_request(&mut self, correlation_id: &CorrelationId, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        self.requests.remove(correlation_id, context)
    }

    fn validate_invoke(&self, request: &InvokeRequest) -> GneissResult<()> {
        if request.correlation_id.is_empty() {
            return Err(GneissError::new_invalid_argument("invoke requires a non-empty correlation id"));
        }

        if request.command_name.is_empty() {
            return Err(GneissError::new_invalid_argument("invoke requires a non-empty command name"));
        }

        let deferred = self.deferred_invoke.as_ref();
        if self.requests.contains(&request.correlation_id) || deferred.is_some_and(|invoke| invoke.correlation_id == request.correlation_id) {
            return Err(GneissError::new_duplicate_correlation_id());
        }

        let outstanding = self.requests.len() + usize::from(deferred.is_some());
        if outstanding >= self.options.max_pending_requests {
            return Err(GneissError::new_capacity_exceeded(self.options.max_pending_requests));
        }

        Ok(())
    }

    fn is_response(&self, publish: &PublishReceived) -> bool {
        topic_matches_filter(&publish.topic, &self.response_filter)
            && self.response_format.extract(&publish.topic, &self.response_expected).is_ok()
    }

    fn issue_subscribe(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let subscribe = SubscribeRequest {
            topic_filter: self.response_filter.clone(),
            qos: RPC_QOS,
        };

        self.subscribe_packet_id = Some(context.subscribe(&subscribe)?);
        Ok(())
    }

    fn issue_unsubscribe(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let unsubscribe = UnsubscribeRequest {
            topic_filter: self.response_filter.clone(),
        };

        context.unsubscribe(&unsubscribe)?;
        Ok(())
    }

    fn enter_ready(&mut self, source: RpcClientState, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        transition_peer(self, source, RpcClientState::SubscribedAndWaiting, context)?;
        context.notify(ConnectionEvent::RpcClientReady { client: self.handle });

        if let Some(invoke) = self.deferred_invoke.take() {
            if let Err(error) = self.publish_invoke(&invoke, context) {
                observe_error!(context.observer(), Component::RpcClient, "failed to publish deferred invoke {}: {}", invoke.correlation_id, error);
                self.notify_invoke_failure(&invoke.correlation_id, RpcStatus::UNKNOWN, error.to_string(), context);
            }
        }

        Ok(())
    }

    fn fail_deferred_invoke(&mut self, status: RpcStatus, message: &str, context: &mut PolicyContext<'_>) {
        if let Some(invoke) = self.deferred_invoke.take() {
            self.notify_invoke_failure(&invoke.correlation_id, status, message.to_string(), context);
        }
    }

    fn notify_invoke_failure(&self, correlation_id: &CorrelationId, status: RpcStatus, message: String, context: &PolicyContext<'_>) {
        context.notify(ConnectionEvent::RpcClientError(RpcResponse {
            client: self.handle,
            correlation_id: correlation_id.clone(),
            status,
            error_message: Some(message),
            content_type: None,
            payload: Vec::new(),
        }));
    }

    fn fault(&mut self, message: &str, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        self.fault_reason = Some(message.to_string());
        transition_peer(self, RpcClientState::Subscribing, RpcClientState::Faulted, context)
    }

    fn append_request_properties(&mut self, request: &InvokeRequest, response_topic: &str) -> GneissResult<()> {
        self.property_bag.append_binary(PropertyType::CorrelationData, request.correlation_id.as_bytes())?;
        self.property_bag.append_string(PropertyType::ResponseTopic, response_topic)?;
        if let Some(content_type) = &request.content_type {
            self.property_bag.append_string(PropertyType::ContentType, content_type)?;
        }

        Ok(())
    }

    fn publish_invoke(&mut self, request: &InvokeRequest, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let executor_id = request.executor_id.as_deref().unwrap_or(ANY_EXECUTOR_ID);
        let tokens = TopicTokens::new()
            .with(TopicToken::ServiceId, &self.options.model_id)
            .with(TopicToken::InvokerClientId, &self.options.client_id)
            .with(TopicToken::ExecutorId, executor_id)
            .with(TopicToken::Name, &request.command_name);

        let request_topic = self.request_format.build(&tokens, None, MAXIMUM_TOPIC_LENGTH)?;
        let response_topic = self.response_format.build(&tokens, None, MAXIMUM_TOPIC_LENGTH)?;

        let publish_result = self.append_request_properties(request, &response_topic).and_then(|_| {
            let publish = PublishRequest {
                topic: &request_topic,
                payload: &request.request_payload,
                qos: RPC_QOS,
                properties: &self.property_bag,
            };

            context.publish(&publish)
        });
        self.property_bag.clear();
        let packet_id = publish_result?;

        observe_debug!(context.observer(), Component::RpcClient, "published invoke {} for \"{}\" to \"{}\" with packet id {}", request.correlation_id, request.command_name, request_topic, packet_id);

        let execution_timeout = request.timeout.unwrap_or(self.options.execution_timeout);
        let pending = Request::new(self.handle, request.correlation_id.clone(), self.options.publish_timeout, execution_timeout);
        self.requests.insert(pending, context)?;
        self.requests.dispatch(&Event::RequestInit { correlation_id: &request.correlation_id, packet_id }, context)
    }

    fn handle_response(&mut self, publish: &PublishReceived, context: &mut PolicyContext<'_>) {
        let correlation_id = match publish.properties.read_binary(PropertyType::CorrelationData) {
            Ok(data) => { CorrelationId::new(data) }
            Err(_) => {
                observe_warn!(context.observer(), Component::RpcClient, "{} on \"{}\"", MISSING_CORRELATION_MESSAGE, publish.topic);
                return;
            }
        };

        if !self.requests.contains(&correlation_id) {
            observe_warn!(context.observer(), Component::RpcClient, "response {} does not match an outstanding request", correlation_id);
        }

        match read_status(&publish.properties) {
            Ok(status) => {
                let error_message =
                    if status.is_failure() {
                        publish.properties.read_string_pair(PropertyType::UserProperty, RPC_STATUS_MESSAGE_PROPERTY_NAME).ok().map(str::to_string)
                    } else {
                        None
                    };

                if let Err(error) = self.requests.dispatch(&Event::RequestComplete(&correlation_id), context) {
                    observe_error!(context.observer(), Component::RpcClient, "completing request {} failed: {}", correlation_id, error);
                }

                context.notify(ConnectionEvent::RpcClientResponse(RpcResponse {
                    client: self.handle,
                    correlation_id,
                    status,
                    error_message,
                    content_type: publish.properties.read_string(PropertyType::ContentType).ok().map(str::to_string),
                    payload: publish.payload.clone(),
                }));
            }
            Err(error) => {
                let message =
                    if let GneissError::ItemNotFound(_) = error {
                        MISSING_STATUS_MESSAGE
                    } else {
                        INVALID_STATUS_MESSAGE
                    };

                observe_warn!(context.observer(), Component::RpcClient, "response {}: {}", correlation_id, message);
                let faulted = Event::RequestFaulted { correlation_id: &correlation_id, status: RpcStatus::UNKNOWN, message };
                if let Err(error) = self.requests.dispatch(&faulted, context) {
                    observe_error!(context.observer(), Component::RpcClient, "faulting request {} failed: {}", correlation_id, error);
                }

                self.notify_invoke_failure(&correlation_id, RpcStatus::UNKNOWN, message.to_string(), context);
            }
        }
    }

    fn root(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Exit => {
                panic!("RPC client state machine exited its root state");
            }
            Event::Puback { .. } | Event::Timeout(_) => {
                self.requests.dispatch(event, context)?;
            }
            _ => {
                observe_debug!(context.observer(), Component::RpcClient, "{} - ignoring {}", self.state, event);
            }
        }

        Ok(Disposition::Handled)
    }

    fn idle(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.observer(), Component::RpcClient, "entered Idle");
            }
            Event::Exit => {}
            Event::RpcSubscribeRequest => {
                self.issue_subscribe(context)?;
                transition_peer(self, RpcClientState::Idle, RpcClientState::Subscribing, context)?;
            }
            Event::InvokeRequest(request) => {
                self.issue_subscribe(context)?;
                self.deferred_invoke = Some((*request).clone());
                transition_peer(self, RpcClientState::Idle, RpcClientState::Subscribing, context)?;
            }
            Event::RpcUnsubscribeRequest => {
                observe_debug!(context.observer(), Component::RpcClient, "Idle - not subscribed");
            }
            Event::PublishReceived(publish) if self.is_response(publish) => {
                observe_info!(context.observer(), Component::RpcClient, "Idle - response received before subscribing");
                self.enter_ready(RpcClientState::Idle, context)?;
                self.handle_response(publish, context);
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn subscribing(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.observer(), Component::RpcClient, "entered Subscribing to \"{}\"", self.response_filter);
                self.subscribe_timer = Some(context.start_timer(self.options.subscribe_timeout)?);
            }
            Event::Exit => {
                if let Some(timer) = self.subscribe_timer.take() {
                    context.destroy_timer(timer);
                }
                self.subscribe_packet_id = None;
            }
            Event::Suback { id, reason_code } if self.subscribe_packet_id == Some(*id) => {
                if reason_code.is_success() {
                    self.enter_ready(RpcClientState::Subscribing, context)?;
                } else {
                    observe_error!(context.observer(), Component::RpcClient, "response subscription rejected with {:?}", reason_code);
                    self.fail_deferred_invoke(RpcStatus::UNKNOWN, "Response subscription failed.", context);
                    self.fault("Response subscription failed.", context)?;
                }
            }
            Event::Timeout(timer) if self.subscribe_timer == Some(*timer) => {
                observe_error!(context.observer(), Component::RpcClient, "response subscription timed out after {:?}", self.options.subscribe_timeout);
                self.fail_deferred_invoke(RpcStatus::TIMEOUT, "Subscribe timed out.", context);
                self.fault("Subscribe timed out.", context)?;
            }
            Event::InvokeRequest(_) => {
                return Err(GneissError::new_try_again_later());
            }
            Event::RpcSubscribeRequest => {
                observe_debug!(context.observer(), Component::RpcClient, "Subscribing - already subscribing");
            }
            Event::RpcUnsubscribeRequest => {
                self.issue_unsubscribe(context)?;
                self.fail_deferred_invoke(RpcStatus::CLIENT_CLOSED, "Unsubscribed before the response subscription completed.", context);
                transition_peer(self, RpcClientState::Subscribing, RpcClientState::Idle, context)?;
            }
            Event::PublishReceived(publish) if self.is_response(publish) => {
                self.enter_ready(RpcClientState::Subscribing, context)?;
                self.handle_response(publish, context);
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn subscribed_and_waiting(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.observer(), Component::RpcClient, "entered SubscribedAndWaiting");
            }
            Event::Exit => {}
            Event::InvokeRequest(request) => {
                self.publish_invoke(request, context)?;
            }
            Event::PublishReceived(publish) if self.is_response(publish) => {
                self.handle_response(publish, context);
            }
            Event::RpcSubscribeRequest => {
                observe_debug!(context.observer(), Component::RpcClient, "SubscribedAndWaiting - already subscribed");
            }
            Event::RpcUnsubscribeRequest => {
                self.issue_unsubscribe(context)?;
                transition_peer(self, RpcClientState::SubscribedAndWaiting, RpcClientState::Idle, context)?;
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn faulted(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                let message = self.fault_reason.take().unwrap_or_else(|| "RPC client faulted".to_string());
                observe_error!(context.observer(), Component::RpcClient, "entered Faulted: {}", message);
                context.notify(ConnectionEvent::Error(ErrorEvent {
                    component: Component::RpcClient,
                    message,
                }));
            }
            Event::InvokeRequest(_) | Event::RpcSubscribeRequest | Event::RpcUnsubscribeRequest => {
                return Err(GneissError::new_invalid_state(RpcClientState::Faulted, format!("{} rejected", event)));
            }
            // requests published before the fault still run to completion or timeout
            Event::Puback { .. } | Event::Timeout(_) => { return Ok(Disposition::Superstate); }
            _ => {
                observe_debug!(context.observer(), Component::RpcClient, "Faulted - ignoring {}", event);
            }
        }

        Ok(Disposition::Handled)
    }
}

fn read_status(properties: &PropertyBag) -> GneissResult<RpcStatus> {
    let value = properties.read_string_pair(PropertyType::UserProperty, RPC_STATUS_PROPERTY_NAME)?;
    value.trim().parse::<i32>().map(RpcStatus).map_err(|error| {
        GneissError::new_unexpected_character(format!("status property \"{}\" is not an integer: {}", value, error))
    })
}

impl<'a> StateMachine<PolicyContext<'a>> for RpcClient {
    type State = RpcClientState;

    fn current_state(&self) -> RpcClientState {
        self.state
    }

    fn set_current_state(&mut self, state: RpcClientState) {
        self.state = state;
    }

    fn parent_of(state: RpcClientState) -> Option<RpcClientState> {
        match state {
            RpcClientState::Root => { None }
            _ => { Some(RpcClientState::Root) }
        }
    }

    fn handle_event(&mut self, state: RpcClientState, event: &Event<'_>, context: &mut PolicyContext<'a>) -> GneissResult<Disposition> {
        match state {
            RpcClientState::Root => { self.root(event, context) }
            RpcClientState::Idle => { self.idle(event, context) }
            RpcClientState::Subscribing => { self.subscribing(event, context) }
            RpcClientState::SubscribedAndWaiting => { self.subscribed_and_waiting(event, context) }
            RpcClientState::Faulted => { self.faulted(event, context) }
        }
    }
}

impl EventPolicy for RpcClient {
    fn handle_inbound(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, event, context)
    }

    fn release(&mut self, context: &mut PolicyContext<'_>) {
        if let Some(timer) = self.subscribe_timer.take() {
            context.destroy_timer(timer);
        }

        self.requests.release_all(context);
    }

    fn as_any(&self) -> &dyn Any { self }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
