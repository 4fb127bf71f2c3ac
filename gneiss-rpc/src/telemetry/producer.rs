/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Telemetry producer state machine.

```text
root
 ├── ready
 │    └── publishing
 └── faulted
```

QoS 0 telemetry is published from `ready` without a state change.  QoS 1 and 2 telemetry moves
the producer into `publishing` until the acknowledgement arrives; only one such publish may be in
flight at a time.
 */

use crate::collection::{EventPolicy, PolicyContext, TelemetryProducerHandle};
use crate::config::TelemetryProducerOptions;
use crate::error::{GneissError, GneissResult};
use crate::event::*;
use crate::hfsm::*;
use crate::logging::*;
use crate::mqtt::*;
use crate::pipeline::TimerId;
use crate::rpc::topic::*;

use std::any::Any;
use std::fmt;

/// A single telemetry message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetryRequest {

    /// Name of the telemetry; fills the `{telemetryName}` topic token
    pub telemetry_name: String,

    /// Delivery quality of service
    pub qos: QualityOfService,

    /// Content type of the payload.  Must be non-empty.
    pub content_type: String,

    /// Telemetry payload
    pub payload: Vec<u8>,
}

/// States of a telemetry producer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TelemetryProducerState {

    /// Superstate of every other state
    Root,

    /// Able to publish
    Ready,

    /// A QoS 1+ publish is waiting for its acknowledgement
    Publishing,

    /// A publish timed out; the producer must be recreated
    Faulted,
}

impl fmt::Display for TelemetryProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryProducerState::Root => { write!(f, "Root") }
            TelemetryProducerState::Ready => { write!(f, "Ready") }
            TelemetryProducerState::Publishing => { write!(f, "Publishing") }
            TelemetryProducerState::Faulted => { write!(f, "Faulted") }
        }
    }
}

pub(crate) struct TelemetryProducer {
    state: TelemetryProducerState,
    handle: TelemetryProducerHandle,
    options: TelemetryProducerOptions,
    topic_format: TopicFormat,
    property_bag: PropertyBag,

    pending_packet_id: Option<PacketId>,
    publish_timer: Option<TimerId>,
}

impl TelemetryProducer {

    pub(crate) fn new(handle: TelemetryProducerHandle, options: TelemetryProducerOptions) -> GneissResult<Self> {
        Ok(TelemetryProducer {
            state: TelemetryProducerState::Ready,
            handle,
            topic_format: TopicFormat::new(&options.topic_format)?,
            options,
            property_bag: PropertyBag::new(),
            pending_packet_id: None,
            publish_timer: None,
        })
    }

    pub(crate) fn state(&self) -> TelemetryProducerState {
        self.state
    }

    pub(crate) fn send(&mut self, request: &TelemetryRequest, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        if request.telemetry_name.is_empty() {
            return Err(GneissError::new_invalid_argument("telemetry requires a non-empty name"));
        }

        if request.content_type.is_empty() {
            return Err(GneissError::new_invalid_argument("telemetry requires a non-empty content type"));
        }

        send_event(self, &Event::TelemetrySend(request), context)
    }

    fn publish_telemetry(&mut self, request: &TelemetryRequest, context: &mut PolicyContext<'_>) -> GneissResult<PacketId> {
        let tokens = TopicTokens::new()
            .with(TopicToken::ServiceId, &self.options.model_id)
            .with(TopicToken::SenderId, &self.options.client_id)
            .with(TopicToken::TelemetryName, &request.telemetry_name);
        let topic = self.topic_format.build(&tokens, None, MAXIMUM_TOPIC_LENGTH)?;

        let result = self.property_bag.append_string(PropertyType::ContentType, &request.content_type).and_then(|_| {
            let publish = PublishRequest {
                topic: &topic,
                payload: &request.payload,
                qos: request.qos,
                properties: &self.property_bag,
            };

            context.publish(&publish)
        });
        self.property_bag.clear();

        let packet_id = result?;
        observe_debug!(context.observer(), Component::TelemetryProducer, "published \"{}\" at {:?} to \"{}\"", request.telemetry_name, request.qos, topic);

        Ok(packet_id)
    }

    fn notify_failure(&self, reason_code: Option<PubackReasonCode>, message: &str, context: &PolicyContext<'_>) {
        context.notify(ConnectionEvent::TelemetryError(TelemetryErrorEvent {
            producer: self.handle,
            reason_code,
            error_message: message.to_string(),
        }));
    }

    fn root(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Exit => {
                panic!("telemetry producer state machine exited its root state");
            }
            _ => {
                observe_debug!(context.observer(), Component::TelemetryProducer, "{} - ignoring {}", self.state, event);
            }
        }

        Ok(Disposition::Handled)
    }

    fn ready(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry | Event::Exit => {}
            Event::TelemetrySend(request) => {
                let packet_id = self.publish_telemetry(request, context)?;
                if request.qos != QualityOfService::AtMostOnce {
                    self.pending_packet_id = Some(packet_id);
                    transition_substate(self, TelemetryProducerState::Ready, TelemetryProducerState::Publishing, context)?;
                }
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn publishing(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                self.publish_timer = Some(context.start_timer(self.options.publish_timeout)?);
            }
            Event::Exit => {
                if let Some(timer) = self.publish_timer.take() {
                    context.destroy_timer(timer);
                }
                self.pending_packet_id = None;
            }
            Event::TelemetrySend(request) => {
                if request.qos == QualityOfService::AtMostOnce {
                    return Ok(Disposition::Superstate);
                }

                return Err(GneissError::new_publish_in_progress());
            }
            Event::Puback { id, reason_code } if self.pending_packet_id == Some(*id) => {
                if !reason_code.is_success() {
                    observe_warn!(context.observer(), Component::TelemetryProducer, "telemetry puback failed with {:?}", reason_code);
                    self.notify_failure(Some(*reason_code), "Puback has failure code.", context);
                }

                transition_superstate(self, TelemetryProducerState::Publishing, context)?;
            }
            Event::Timeout(timer) if self.publish_timer == Some(*timer) => {
                observe_error!(context.observer(), Component::TelemetryProducer, "telemetry publish timed out after {:?}", self.options.publish_timeout);
                self.notify_failure(None, "Publish timed out.", context);
                transition_peer(self, TelemetryProducerState::Ready, TelemetryProducerState::Faulted, context)?;
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn faulted(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_error!(context.observer(), Component::TelemetryProducer, "entered Faulted");
                context.notify(ConnectionEvent::Error(ErrorEvent {
                    component: Component::TelemetryProducer,
                    message: "telemetry publish was not acknowledged".to_string(),
                }));
            }
            Event::TelemetrySend(_) => {
                return Err(GneissError::new_invalid_state(TelemetryProducerState::Faulted, format!("{} rejected", event)));
            }
            _ => {
                observe_debug!(context.observer(), Component::TelemetryProducer, "Faulted - ignoring {}", event);
            }
        }

        Ok(Disposition::Handled)
    }
}

impl<'a> StateMachine<PolicyContext<'a>> for TelemetryProducer {
    type State = TelemetryProducerState;

    fn current_state(&self) -> TelemetryProducerState {
        self.state
    }

    fn set_current_state(&mut self, state: TelemetryProducerState) {
        self.state = state;
    }

    fn parent_of(state: TelemetryProducerState) -> Option<TelemetryProducerState> {
        match state {
            TelemetryProducerState::Root => { None }
            TelemetryProducerState::Ready | TelemetryProducerState::Faulted => { Some(TelemetryProducerState::Root) }
            TelemetryProducerState::Publishing => { Some(TelemetryProducerState::Ready) }
        }
    }

    fn handle_event(&mut self, state: TelemetryProducerState, event: &Event<'_>, context: &mut PolicyContext<'a>) -> GneissResult<Disposition> {
        match state {
            TelemetryProducerState::Root => { self.root(event, context) }
            TelemetryProducerState::Ready => { self.ready(event, context) }
            TelemetryProducerState::Publishing => { self.publishing(event, context) }
            TelemetryProducerState::Faulted => { self.faulted(event, context) }
        }
    }
}

impl EventPolicy for TelemetryProducer {
    fn handle_inbound(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        send_event(self, event, context)
    }

    fn release(&mut self, context: &mut PolicyContext<'_>) {
        if let Some(timer) = self.publish_timer.take() {
            context.destroy_timer(timer);
        }
    }

    fn as_any(&self) -> &dyn Any { self }

    fn as_any_mut(&mut self) -> &mut dyn Any { self }
}
