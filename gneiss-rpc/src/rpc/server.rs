/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
RPC server state machine.

```text
root
 ├── waiting
 └── faulted
```

A server subscribes to its request topic filter when registered, forwards every well-formed
request to the application as an execute-command event, and publishes the application's
execution response to the response topic the invoker asked for.  A request the application does
not answer within the execution timeout is answered by the server with a server-error status.
 */

use crate::collection::{EventPolicy, PolicyContext, RpcServerHandle};
use crate::config::RpcServerOptions;
use crate::error::{GneissError, GneissResult};
use crate::event::*;
use crate::hfsm::*;
use crate::logging::*;
use crate::mqtt::*;
use crate::pipeline::TimerId;
use crate::request::CorrelationId;
use crate::rpc::*;
use crate::rpc::topic::*;

use std::any::Any;
use std::fmt;

const EXECUTION_TIMEOUT_MESSAGE : &str = "Command Server timeout";

/// The application's answer to an execute-command event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionFinishRequest {

    /// Correlation id of the execute-command event being answered
    pub correlation_id: CorrelationId,

    /// Result of the execution
    pub status: RpcStatus,

    /// Content type of the response payload; ignored for failure statuses
    pub content_type: Option<String>,

    /// Response payload; ignored for failure statuses
    pub response_payload: Vec<u8>,

    /// Error message published with failure statuses
    pub error_message: Option<String>,
}

/// States of an RPC server
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RpcServerState {

    /// Superstate of every other state
    Root,

    /// Forwarding requests and publishing responses
    Waiting,

    /// The request subscription was rejected; the server must be recreated
    Faulted,
}

impl fmt::Display for RpcServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcServerState::Root => { write!(f, "Root") }
            RpcServerState::Waiting => { write!(f, "Waiting") }
            RpcServerState::Faulted => { write!(f, "Faulted") }
        }
    }
}

struct PendingExecution {
    correlation_id: CorrelationId,
    response_topic: String,
    timer: TimerId,
}

struct RequestProperties {
    correlation_id: CorrelationId,
    response_topic: String,
    content_type: String,
}

pub(crate) struct RpcServer {
    state: RpcServerState,
    handle: RpcServerHandle,
    options: RpcServerOptions,

    request_format: TopicFormat,
    subscription_filter: String,
    request_expected: TopicTokens,

    property_bag: PropertyBag,
    register_packet_id: Option<PacketId>,
    executions: Vec<PendingExecution>,
    fault_reason: Option<String>,
}

impl RpcServer {

    pub(crate) fn new(handle: RpcServerHandle, options: RpcServerOptions) -> GneissResult<Self> {
        let request_format = TopicFormat::new(&options.request_topic_format)?;

        let executor_id =
            if options.service_group_id.is_some() {
                ANY_EXECUTOR_ID
            } else {
                options.client_id.as_str()
            };

        let request_expected = TopicTokens::new()
            .with(TopicToken::ServiceId, &options.model_id)
            .with(TopicToken::ExecutorId, executor_id);
        let filter_tokens = request_expected.clone().with(TopicToken::Name, SINGLE_LEVEL_WILDCARD);
        let subscription_filter = request_format.build_filter(&filter_tokens, options.service_group_id.as_deref())?;

        Ok(RpcServer {
            state: RpcServerState::Waiting,
            handle,
            options,
            request_format,
            subscription_filter,
            request_expected,
            property_bag: PropertyBag::new(),
            register_packet_id: None,
            executions: Vec::new(),
            fault_reason: None,
        })
    }

    pub(crate) fn state(&self) -> RpcServerState {
        self.state
    }

    pub(crate) fn subscription_filter(&self) -> &str {
        &self.subscription_filter
    }

    pub(crate) fn register(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, &Event::RegisterRequest, context)
    }

    pub(crate) fn execution_finish(&mut self, response: &ExecutionFinishRequest, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, &Event::ExecutionFinish(response), context)
    }

    fn find_execution(&self, correlation_id: &CorrelationId) -> Option<usize> {
        self.executions.iter().position(|execution| execution.correlation_id == *correlation_id)
    }

    fn release_executions(&mut self, context: &mut PolicyContext<'_>) {
        for execution in self.executions.drain(..) {
            context.destroy_timer(execution.timer);
        }
    }

    fn handle_request(&mut self, publish: &PublishReceived, tokens: TopicTokens, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let properties = match read_request_properties(&publish.properties) {
            Ok(properties) => { properties }
            Err(error) => {
                observe_warn!(context.observer(), Component::RpcServer, "dropping request on \"{}\": {}", publish.topic, error);
                return Ok(());
            }
        };

        if self.find_execution(&properties.correlation_id).is_some() {
            observe_warn!(context.observer(), Component::RpcServer, "dropping redelivered request {} that is already executing", properties.correlation_id);
            return Ok(());
        }

        let timer = context.start_timer(self.options.execution_timeout)?;
        self.executions.push(PendingExecution {
            correlation_id: properties.correlation_id.clone(),
            response_topic: properties.response_topic.clone(),
            timer,
        });

        let command_name = tokens.name.unwrap_or_default();
        observe_debug!(context.observer(), Component::RpcServer, "forwarding request {} for \"{}\"", properties.correlation_id, command_name);

        context.notify(ConnectionEvent::ExecuteCommand(ExecuteCommandRequest {
            server: self.handle,
            correlation_id: properties.correlation_id,
            response_topic: properties.response_topic,
            content_type: properties.content_type,
            command_name,
            request_payload: publish.payload.clone(),
        }));

        Ok(())
    }

    fn append_response_properties(&mut self, response: &ExecutionFinishRequest) -> GneissResult<()> {
        self.property_bag.append_binary(PropertyType::CorrelationData, response.correlation_id.as_bytes())?;
        self.property_bag.append_string_pair(PropertyType::UserProperty, RPC_STATUS_PROPERTY_NAME, &response.status.to_string())?;

        if response.status.is_failure() {
            let message = response.error_message.as_deref().unwrap_or_default();
            self.property_bag.append_string_pair(PropertyType::UserProperty, RPC_STATUS_MESSAGE_PROPERTY_NAME, message)?;
        } else if let Some(content_type) = &response.content_type {
            self.property_bag.append_string(PropertyType::ContentType, content_type)?;
        }

        Ok(())
    }

    fn publish_response(&mut self, response_topic: &str, response: &ExecutionFinishRequest, context: &mut PolicyContext<'_>) -> GneissResult<PacketId> {
        let payload : &[u8] =
            if response.status.is_failure() {
                &[]
            } else {
                &response.response_payload
            };

        let result = self.append_response_properties(response).and_then(|_| {
            let publish = PublishRequest {
                topic: response_topic,
                payload,
                qos: RPC_QOS,
                properties: &self.property_bag,
            };

            context.publish(&publish)
        });
        self.property_bag.clear();

        result
    }

    fn finish_execution(&mut self, response: &ExecutionFinishRequest, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let index = self.find_execution(&response.correlation_id).ok_or_else(|| {
            GneissError::new_item_not_found(format!("no executing request with correlation id {}", response.correlation_id))
        })?;

        let response_topic = self.executions[index].response_topic.clone();
        let packet_id = self.publish_response(&response_topic, response, context)?;
        observe_debug!(context.observer(), Component::RpcServer, "published response {} with status {} to \"{}\" using packet id {}", response.correlation_id, response.status, response_topic, packet_id);

        let execution = self.executions.remove(index);
        context.destroy_timer(execution.timer);

        Ok(())
    }

    fn expire_execution(&mut self, index: usize, context: &mut PolicyContext<'_>) {
        let execution = self.executions.remove(index);
        context.destroy_timer(execution.timer);
        observe_warn!(context.observer(), Component::RpcServer, "request {} was not answered within {:?}", execution.correlation_id, self.options.execution_timeout);

        let response = ExecutionFinishRequest {
            correlation_id: execution.correlation_id,
            status: RpcStatus::SERVER_ERROR,
            content_type: None,
            response_payload: Vec::new(),
            error_message: Some(EXECUTION_TIMEOUT_MESSAGE.to_string()),
        };

        if let Err(error) = self.publish_response(&execution.response_topic, &response, context) {
            observe_error!(context.observer(), Component::RpcServer, "failed to publish timeout response {}: {}", response.correlation_id, error);
        }
    }

    fn root(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Exit => {
                panic!("RPC server state machine exited its root state");
            }
            Event::Timeout(timer) => {
                if let Some(index) = self.executions.iter().position(|execution| execution.timer == *timer) {
                    self.expire_execution(index, context);
                }
            }
            _ => {
                observe_debug!(context.observer(), Component::RpcServer, "{} - ignoring {}", self.state, event);
            }
        }

        Ok(Disposition::Handled)
    }

    fn waiting(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry | Event::Exit => {}
            Event::RegisterRequest => {
                let subscribe = SubscribeRequest {
                    topic_filter: self.subscription_filter.clone(),
                    qos: RPC_QOS,
                };

                self.register_packet_id = Some(context.subscribe(&subscribe)?);
                observe_info!(context.observer(), Component::RpcServer, "subscribing to \"{}\"", self.subscription_filter);
            }
            Event::Suback { id, reason_code } if self.register_packet_id == Some(*id) => {
                self.register_packet_id = None;
                if reason_code.is_success() {
                    observe_info!(context.observer(), Component::RpcServer, "subscribed to \"{}\"", self.subscription_filter);
                } else {
                    self.fault_reason = Some(format!("request subscription rejected with {:?}", reason_code));
                    transition_peer(self, RpcServerState::Waiting, RpcServerState::Faulted, context)?;
                }
            }
            Event::PublishReceived(publish) if topic_matches_filter(&publish.topic, &self.subscription_filter) => {
                match self.request_format.extract(&publish.topic, &self.request_expected) {
                    Ok(tokens) => { self.handle_request(publish, tokens, context)?; }
                    Err(_) => { return Ok(Disposition::Superstate); }
                }
            }
            Event::ExecutionFinish(response) => {
                self.finish_execution(response, context)?;
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn faulted(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                let message = self.fault_reason.take().unwrap_or_else(|| "RPC server faulted".to_string());
                observe_error!(context.observer(), Component::RpcServer, "entered Faulted: {}", message);
                self.release_executions(context);
                context.notify(ConnectionEvent::Error(ErrorEvent {
                    component: Component::RpcServer,
                    message,
                }));
            }
            Event::RegisterRequest | Event::ExecutionFinish(_) => {
                return Err(GneissError::new_invalid_state(RpcServerState::Faulted, format!("{} rejected", event)));
            }
            _ => {
                observe_debug!(context.observer(), Component::RpcServer, "Faulted - ignoring {}", event);
            }
        }

        Ok(Disposition::Handled)
    }
}

fn read_request_properties(properties: &PropertyBag) -> GneissResult<RequestProperties> {
    Ok(RequestProperties {
        response_topic: properties.read_string(PropertyType::ResponseTopic)?.to_string(),
        correlation_id: CorrelationId::new(properties.read_binary(PropertyType::CorrelationData)?),
        content_type: properties.read_string(PropertyType::ContentType)?.to_string(),
    })
}

impl<'a> StateMachine<PolicyContext<'a>> for RpcServer {
    type State = RpcServerState;

    fn current_state(&self) -> RpcServerState {
        self.state
    }

    fn set_current_state(&mut self, state: RpcServerState) {
        self.state = state;
    }

    fn parent_of(state: RpcServerState) -> Option<RpcServerState> {
        match state {
            RpcServerState::Root => { None }
            _ => { Some(RpcServerState::Root) }
        }
    }

    fn handle_event(&mut self, state: RpcServerState, event: &Event<'_>, context: &mut PolicyContext<'a>) -> GneissResult<Disposition> {
        match state {
            RpcServerState::Root => { self.root(event, context) }
            RpcServerState::Waiting => { self.waiting(event, context) }
            RpcServerState::Faulted => { self.faulted(event, context) }
        }
    }
}

impl EventPolicy for RpcServer {
    fn handle_inbound(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, event, context)
    }

    fn release(&mut self, context: &mut PolicyContext<'_>) {
        self.release_executions(context);
    }

    fn as_any(&self) -> &dyn Any { self }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
