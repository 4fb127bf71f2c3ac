/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Shared test fixtures: a recording transport that assigns packet ids, and a listener that captures
every application event.
 */

use crate::error::{GneissError, GneissResult};
use crate::event::*;
use crate::logging::{Component, EventObserver, NullObserver};
use crate::mqtt::*;
use crate::pipeline::{EventPipeline, MqttTransport};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Clone, Debug)]
pub(crate) struct PublishRecord {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QualityOfService,
    pub(crate) properties: PropertyBag,
    pub(crate) packet_id: PacketId,
}

#[derive(Default)]
pub(crate) struct MockTransportState {
    pub(crate) connects: Vec<ConnectRequest>,
    pub(crate) publishes: Vec<PublishRecord>,
    pub(crate) subscribes: Vec<(SubscribeRequest, PacketId)>,
    pub(crate) unsubscribes: Vec<(UnsubscribeRequest, PacketId)>,
    pub(crate) disconnects: usize,

    pub(crate) fail_connect: bool,
    pub(crate) fail_publish: bool,
    pub(crate) fail_subscribe: bool,

    next_packet_id: PacketId,
}

impl MockTransportState {
    fn allocate_packet_id(&mut self) -> PacketId {
        self.next_packet_id += 1;
        self.next_packet_id
    }

    pub(crate) fn last_publish(&self) -> &PublishRecord {
        match self.publishes.last() {
            Some(publish) => { publish }
            None => { panic!("no publish was issued") }
        }
    }

    pub(crate) fn last_subscribe(&self) -> &(SubscribeRequest, PacketId) {
        match self.subscribes.last() {
            Some(subscribe) => { subscribe }
            None => { panic!("no subscribe was issued") }
        }
    }
}

pub(crate) struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MqttTransport for MockTransport {
    fn connect(&mut self, request: &ConnectRequest) -> GneissResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(GneissError::new_transport_error("connect rejected"));
        }

        state.connects.push(request.clone());
        Ok(())
    }

    fn publish(&mut self, request: &PublishRequest<'_>) -> GneissResult<PacketId> {
        let mut state = self.state.lock().unwrap();
        if state.fail_publish {
            return Err(GneissError::new_transport_error("publish rejected"));
        }

        let packet_id = state.allocate_packet_id();
        state.publishes.push(PublishRecord {
            topic: request.topic.to_string(),
            payload: request.payload.to_vec(),
            qos: request.qos,
            properties: request.properties.clone(),
            packet_id,
        });

        Ok(packet_id)
    }

    fn subscribe(&mut self, request: &SubscribeRequest) -> GneissResult<PacketId> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(GneissError::new_transport_error("subscribe rejected"));
        }

        let packet_id = state.allocate_packet_id();
        state.subscribes.push((request.clone(), packet_id));
        Ok(packet_id)
    }

    fn unsubscribe(&mut self, request: &UnsubscribeRequest) -> GneissResult<PacketId> {
        let mut state = self.state.lock().unwrap();
        let packet_id = state.allocate_packet_id();
        state.unsubscribes.push((request.clone(), packet_id));
        Ok(packet_id)
    }

    fn disconnect(&mut self) -> GneissResult<()> {
        self.state.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

pub(crate) struct TestHarness {
    transport: Arc<Mutex<MockTransportState>>,
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
}

impl TestHarness {
    pub(crate) fn new() -> Self {
        TestHarness {
            transport: Arc::new(Mutex::new(MockTransportState::default())),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn create_transport(&self) -> Box<dyn MqttTransport> {
        Box::new(MockTransport {
            state: self.transport.clone(),
        })
    }

    pub(crate) fn create_listener(&self) -> ConnectionEventListener {
        let events = self.events.clone();
        Arc::new(move |event| {
            events.lock().unwrap().push((*event).clone());
        })
    }

    pub(crate) fn create_pipeline(&self) -> EventPipeline {
        EventPipeline::new(self.create_transport(), self.create_listener(), Arc::new(NullObserver::default()), Instant::now())
    }

    pub(crate) fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub(crate) fn transport(&self) -> MutexGuard<'_, MockTransportState> {
        self.transport.lock().unwrap()
    }
}

/// Observer that keeps every message at or above a level, formatted as `"<component> - <message>"`
pub(crate) struct RecordingObserver {
    level: log::Level,
    messages: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub(crate) fn new(level: log::Level) -> Self {
        RecordingObserver {
            level,
            messages: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl EventObserver for RecordingObserver {
    fn enabled(&self, level: log::Level, _: Component) -> bool {
        level <= self.level
    }

    fn observe(&self, _: log::Level, component: Component, message: fmt::Arguments<'_>) {
        self.messages.lock().unwrap().push(format!("{} - {}", component, message));
    }
}

/// Builds an incoming publish carrying the given properties
pub(crate) fn create_publish(topic: &str, payload: &[u8], properties: PropertyBag) -> PublishReceived {
    PublishReceived {
        topic: topic.to_string(),
        payload: payload.to_vec(),
        qos: QualityOfService::AtLeastOnce,
        properties,
    }
}
