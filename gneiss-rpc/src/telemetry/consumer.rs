/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Telemetry consumer state machine.

```text
root
 ├── ready
 │    └── subscribing
 └── faulted
```

The consumer subscribes to the telemetry topic of a single sender, or of every sender when no
sender id is configured.  Telemetry matching the subscription is forwarded to the application
from `ready` and from `subscribing`; a message arriving before the suback proves the subscription
is live.  A rejected or unacknowledged subscribe faults the consumer.
 */

use crate::collection::{EventPolicy, PolicyContext, TelemetryConsumerHandle};
use crate::config::TelemetryConsumerOptions;
use crate::error::{GneissError, GneissResult};
use crate::event::*;
use crate::hfsm::*;
use crate::logging::*;
use crate::mqtt::*;
use crate::pipeline::TimerId;
use crate::rpc::topic::*;

use std::any::Any;
use std::fmt;

const TELEMETRY_SUBSCRIBE_QOS: QualityOfService = QualityOfService::AtLeastOnce;

/// States of a telemetry consumer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TelemetryConsumerState {

    /// Superstate of every other state
    Root,

    /// Telemetry on the subscription filter is forwarded to the application
    Ready,

    /// Waiting for the telemetry subscription to be acknowledged
    Subscribing,

    /// The subscription failed; the consumer must be recreated
    Faulted,
}

impl fmt::Display for TelemetryConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryConsumerState::Root => { write!(f, "Root") }
            TelemetryConsumerState::Ready => { write!(f, "Ready") }
            TelemetryConsumerState::Subscribing => { write!(f, "Subscribing") }
            TelemetryConsumerState::Faulted => { write!(f, "Faulted") }
        }
    }
}

pub(crate) struct TelemetryConsumer {
    state: TelemetryConsumerState,
    handle: TelemetryConsumerHandle,
    options: TelemetryConsumerOptions,
    topic_format: TopicFormat,
    subscription_filter: String,
    expected: TopicTokens,

    subscribe_packet_id: Option<PacketId>,
    subscribe_timer: Option<TimerId>,
    fault_reason: Option<String>,
}

impl TelemetryConsumer {

    pub(crate) fn new(handle: TelemetryConsumerHandle, options: TelemetryConsumerOptions) -> GneissResult<Self> {
        let topic_format = TopicFormat::new(&options.topic_format)?;

        let filter_tokens = TopicTokens::new()
            .with(TopicToken::ServiceId, &options.model_id)
            .with(TopicToken::SenderId, options.sender_id.as_deref().unwrap_or(SINGLE_LEVEL_WILDCARD))
            .with(TopicToken::TelemetryName, SINGLE_LEVEL_WILDCARD);
        let subscription_filter = topic_format.build_filter(&filter_tokens, options.service_group_id.as_deref())?;

        let mut expected = TopicTokens::new().with(TopicToken::ServiceId, &options.model_id);
        if let Some(sender_id) = &options.sender_id {
            expected = expected.with(TopicToken::SenderId, sender_id);
        }

        Ok(TelemetryConsumer {
            state: TelemetryConsumerState::Ready,
            handle,
            options,
            topic_format,
            subscription_filter,
            expected,
            subscribe_packet_id: None,
            subscribe_timer: None,
            fault_reason: None,
        })
    }

    pub(crate) fn state(&self) -> TelemetryConsumerState {
        self.state
    }

    pub(crate) fn subscription_filter(&self) -> &str {
        &self.subscription_filter
    }

    pub(crate) fn subscribe(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, &Event::TelemetrySubscribeRequest, context)
    }

    pub(crate) fn unsubscribe(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, &Event::TelemetryUnsubscribeRequest, context)
    }

    fn parse_topic(&self, topic: &str) -> Option<TopicTokens> {
        if !topic_matches_filter(topic, &self.subscription_filter) {
            return None;
        }

        self.topic_format.extract(topic, &self.expected).ok()
    }

    fn is_telemetry(&self, publish: &PublishReceived) -> bool {
        self.parse_topic(&publish.topic).is_some()
    }

    fn forward_telemetry(&self, publish: &PublishReceived, context: &mut PolicyContext<'_>) {
        let Some(tokens) = self.parse_topic(&publish.topic) else {
            return;
        };

        let sender_id = tokens.get(TopicToken::SenderId)
            .or(self.options.sender_id.as_deref())
            .unwrap_or_default()
            .to_string();
        let telemetry_name = tokens.get(TopicToken::TelemetryName).unwrap_or_default().to_string();

        observe_debug!(context.observer(), Component::TelemetryConsumer, "received \"{}\" from \"{}\"", telemetry_name, sender_id);
        context.notify(ConnectionEvent::TelemetryReceived(TelemetryMessage {
            consumer: self.handle,
            sender_id,
            telemetry_name,
            content_type: publish.properties.read_string(PropertyType::ContentType).ok().map(str::to_string),
            payload: publish.payload.clone(),
        }));
    }

    fn issue_subscribe(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let subscribe = SubscribeRequest {
            topic_filter: self.subscription_filter.clone(),
            qos: TELEMETRY_SUBSCRIBE_QOS,
        };

        self.subscribe_packet_id = Some(context.subscribe(&subscribe)?);
        Ok(())
    }

    fn issue_unsubscribe(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let unsubscribe = UnsubscribeRequest {
            topic_filter: self.subscription_filter.clone(),
        };

        context.unsubscribe(&unsubscribe)?;
        Ok(())
    }

    fn fault(&mut self, reason: &str, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        self.fault_reason = Some(reason.to_string());
        transition_peer(self, TelemetryConsumerState::Ready, TelemetryConsumerState::Faulted, context)
    }

    fn root(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Exit => {
                panic!("telemetry consumer state machine exited its root state");
            }
            _ => {
                observe_debug!(context.observer(), Component::TelemetryConsumer, "{} - ignoring {}", self.state, event);
            }
        }

        Ok(Disposition::Handled)
    }

    fn ready(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry | Event::Exit => {}
            Event::TelemetrySubscribeRequest => {
                self.issue_subscribe(context)?;
                transition_substate(self, TelemetryConsumerState::Ready, TelemetryConsumerState::Subscribing, context)?;
            }
            Event::TelemetryUnsubscribeRequest => {
                self.issue_unsubscribe(context)?;
            }
            Event::PublishReceived(publish) if self.is_telemetry(publish) => {
                self.forward_telemetry(publish, context);
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn subscribing(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.observer(), Component::TelemetryConsumer, "entered Subscribing to \"{}\"", self.subscription_filter);
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
                    transition_superstate(self, TelemetryConsumerState::Subscribing, context)?;
                } else {
                    observe_error!(context.observer(), Component::TelemetryConsumer, "telemetry subscription rejected with {:?}", reason_code);
                    self.fault("Telemetry subscription failed.", context)?;
                }
            }
            Event::Timeout(timer) if self.subscribe_timer == Some(*timer) => {
                observe_error!(context.observer(), Component::TelemetryConsumer, "telemetry subscription timed out after {:?}", self.options.subscribe_timeout);
                self.fault("Subscribe timed out.", context)?;
            }
            Event::TelemetrySubscribeRequest => {
                observe_debug!(context.observer(), Component::TelemetryConsumer, "Subscribing - already subscribing");
            }
            Event::TelemetryUnsubscribeRequest => {
                self.issue_unsubscribe(context)?;
                transition_superstate(self, TelemetryConsumerState::Subscribing, context)?;
            }
            Event::PublishReceived(publish) if self.is_telemetry(publish) => {
                transition_superstate(self, TelemetryConsumerState::Subscribing, context)?;
                self.forward_telemetry(publish, context);
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn faulted(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                let message = self.fault_reason.take().unwrap_or_else(|| "telemetry consumer faulted".to_string());
                observe_error!(context.observer(), Component::TelemetryConsumer, "entered Faulted: {}", message);
                context.notify(ConnectionEvent::Error(ErrorEvent {
                    component: Component::TelemetryConsumer,
                    message,
                }));
            }
            Event::TelemetrySubscribeRequest | Event::TelemetryUnsubscribeRequest => {
                return Err(GneissError::new_invalid_state(TelemetryConsumerState::Faulted, format!("{} rejected", event)));
            }
            _ => {
                observe_debug!(context.observer(), Component::TelemetryConsumer, "Faulted - ignoring {}", event);
            }
        }

        Ok(Disposition::Handled)
    }
}

impl<'a> StateMachine<PolicyContext<'a>> for TelemetryConsumer {
    type State = TelemetryConsumerState;

    fn current_state(&self) -> TelemetryConsumerState {
        self.state
    }

    fn set_current_state(&mut self, state: TelemetryConsumerState) {
        self.state = state;
    }

    fn parent_of(state: TelemetryConsumerState) -> Option<TelemetryConsumerState> {
        match state {
            TelemetryConsumerState::Root => { None }
            TelemetryConsumerState::Ready | TelemetryConsumerState::Faulted => { Some(TelemetryConsumerState::Root) }
            TelemetryConsumerState::Subscribing => { Some(TelemetryConsumerState::Ready) }
        }
    }

    fn handle_event(&mut self, state: TelemetryConsumerState, event: &Event<'_>, context: &mut PolicyContext<'a>) -> GneissResult<Disposition> {
        match state {
            TelemetryConsumerState::Root => { self.root(event, context) }
            TelemetryConsumerState::Ready => { self.ready(event, context) }
            TelemetryConsumerState::Subscribing => { self.subscribing(event, context) }
            TelemetryConsumerState::Faulted => { self.faulted(event, context) }
        }
    }
}

impl EventPolicy for TelemetryConsumer {
    fn handle_inbound(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, event, context)
    }

    fn release(&mut self, context: &mut PolicyContext<'_>) {
        if let Some(timer) = self.subscribe_timer.take() {
            context.destroy_timer(timer);
        }
    }

    fn as_any(&self) -> &dyn Any { self }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
