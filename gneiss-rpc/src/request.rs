/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Correlation-tracked request state machine and the arena that owns every outstanding request of
an RPC client.

```text
root
 ├── started
 │    ├── idle
 │    ├── publishing
 │    └── waiting
 ├── completed
 └── faulted
```

Every request sees every acknowledgement, timeout and correlation event dispatched to the arena
and reacts only to the packet id, timers and correlation id it owns.  A request that reaches
`completed` is freed from the arena by the dispatch that completed it; a `faulted` request stays
until its owner removes it.
 */

use crate::collection::{PolicyContext, RpcClientHandle};
use crate::error::{fold_gneiss_result, GneissError, GneissResult};
use crate::event::*;
use crate::hfsm::*;
use crate::logging::*;
use crate::mqtt::PacketId;
use crate::pipeline::TimerId;
use crate::rpc::RpcStatus;

use std::fmt;
use std::time::Duration;

/// Opaque identifier carried on a request and echoed on its response.  Equality compares
/// contents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Vec<u8>);

impl CorrelationId {

    /// Creates a correlation id from raw bytes
    pub fn new(bytes: &[u8]) -> Self {
        CorrelationId(bytes.to_vec())
    }

    /// Creates a random 16-byte correlation id
    pub fn new_random() -> Self {
        CorrelationId(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    /// Returns the raw bytes of the id
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if the id has no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for CorrelationId {
    fn from(bytes: &[u8]) -> Self {
        CorrelationId::new(bytes)
    }
}

impl From<Vec<u8>> for CorrelationId {
    fn from(bytes: Vec<u8>) -> Self {
        CorrelationId(bytes)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        CorrelationId::new(value.as_bytes())
    }
}

/// States of a request state machine
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestState {

    /// Superstate of every other state
    Root,

    /// Superstate of the states in which the request is still live
    Started,

    /// Created, waiting for the packet id of its publish
    Idle,

    /// Publish sent, waiting for its acknowledgement
    Publishing,

    /// Publish acknowledged, waiting for the correlated response
    Waiting,

    /// Response received
    Completed,

    /// Publish rejected, publish or execution timed out, or response malformed
    Faulted,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Root => { write!(f, "Root") }
            RequestState::Started => { write!(f, "Started") }
            RequestState::Idle => { write!(f, "Idle") }
            RequestState::Publishing => { write!(f, "Publishing") }
            RequestState::Waiting => { write!(f, "Waiting") }
            RequestState::Completed => { write!(f, "Completed") }
            RequestState::Faulted => { write!(f, "Faulted") }
        }
    }
}

pub(crate) struct Request {
    state: RequestState,
    client: RpcClientHandle,
    correlation_id: CorrelationId,

    publish_timeout: Duration,
    execution_timeout: Duration,

    pending_packet_id: Option<PacketId>,
    publish_timer: Option<TimerId>,
    execution_timer: Option<TimerId>,

    // error response to report when entering faulted
    fault: Option<(RpcStatus, String)>,
}

impl Request {

    pub(crate) fn new(client: RpcClientHandle, correlation_id: CorrelationId, publish_timeout: Duration, execution_timeout: Duration) -> Self {
        Request {
            state: RequestState::Root,
            client,
            correlation_id,
            publish_timeout,
            execution_timeout,
            pending_packet_id: None,
            publish_timer: None,
            execution_timer: None,
            fault: None,
        }
    }

    pub(crate) fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    fn start(&mut self, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        transition_substate(self, RequestState::Root, RequestState::Started, context)?;
        transition_substate(self, RequestState::Started, RequestState::Idle, context)
    }

    // destroys any timer still held; used when the request is removed while live
    fn release(&mut self, context: &mut PolicyContext<'_>) {
        if let Some(timer) = self.publish_timer.take() {
            context.destroy_timer(timer);
        }

        if let Some(timer) = self.execution_timer.take() {
            context.destroy_timer(timer);
        }
    }

    fn is_mine(&self, correlation_id: &CorrelationId) -> bool {
        self.correlation_id == *correlation_id
    }

    fn fault(&mut self, status: RpcStatus, message: &str, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        self.fault = Some((status, message.to_string()));
        transition_peer(self, RequestState::Started, RequestState::Faulted, context)
    }

    fn root(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Exit => {
                panic!("request state machine exited its root state");
            }
            _ => {
                observe_debug!(context.observer(), Component::Request, "request {} {} - ignoring {}", self.correlation_id, self.state, event);
            }
        }

        Ok(Disposition::Handled)
    }

    fn started(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                self.execution_timer = Some(context.start_timer(self.execution_timeout)?);
            }
            Event::Exit => {
                if let Some(timer) = self.execution_timer.take() {
                    context.destroy_timer(timer);
                }
            }
            Event::Timeout(timer) if self.execution_timer == Some(*timer) => {
                observe_warn!(context.observer(), Component::Request, "request {} - execution timed out after {:?}", self.correlation_id, self.execution_timeout);
                self.fault(RpcStatus::TIMEOUT, "Execution timed out.", context)?;
            }
            Event::RequestComplete(correlation_id) if self.is_mine(correlation_id) => {
                transition_peer(self, RequestState::Started, RequestState::Completed, context)?;
            }
            Event::RequestFaulted { correlation_id, status, message } if self.is_mine(correlation_id) => {
                // the owning client reports malformed responses itself
                observe_warn!(context.observer(), Component::Request, "request {} - faulted with {}: {}", self.correlation_id, status, message);
                self.fault = None;
                transition_peer(self, RequestState::Started, RequestState::Faulted, context)?;
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn idle(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry | Event::Exit => {}
            Event::RequestInit { correlation_id, packet_id } if self.is_mine(correlation_id) => {
                self.pending_packet_id = Some(*packet_id);
                transition_peer(self, RequestState::Idle, RequestState::Publishing, context)?;
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn publishing(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_debug!(context.observer(), Component::Request, "request {} - publishing with packet id {:?}", self.correlation_id, self.pending_packet_id);
                self.publish_timer = Some(context.start_timer(self.publish_timeout)?);
            }
            Event::Exit => {
                if let Some(timer) = self.publish_timer.take() {
                    context.destroy_timer(timer);
                }
                self.pending_packet_id = None;
            }
            Event::Timeout(timer) if self.publish_timer == Some(*timer) => {
                observe_warn!(context.observer(), Component::Request, "request {} - publish timed out after {:?}", self.correlation_id, self.publish_timeout);
                self.fault(RpcStatus::TIMEOUT, "Publish timed out.", context)?;
            }
            Event::Puback { id, reason_code } if self.pending_packet_id == Some(*id) => {
                if reason_code.is_success() {
                    transition_peer(self, RequestState::Publishing, RequestState::Waiting, context)?;
                } else {
                    observe_warn!(context.observer(), Component::Request, "request {} - puback failed with {:?}", self.correlation_id, reason_code);
                    self.fault(RpcStatus(*reason_code as i32), "Puback has failure code.", context)?;
                }
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn waiting(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_debug!(context.observer(), Component::Request, "request {} - waiting for response", self.correlation_id);
            }
            Event::Exit => {}
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }

    fn completed(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        if let Event::Entry = event {
            observe_debug!(context.observer(), Component::Request, "request {} - completed", self.correlation_id);
            return Ok(Disposition::Handled);
        }

        Ok(Disposition::Superstate)
    }

    fn faulted(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<Disposition> {
        match event {
            Event::Entry => {
                observe_info!(context.observer(), Component::Request, "request {} - entered Faulted", self.correlation_id);
                if let Some((status, message)) = self.fault.take() {
                    context.notify(ConnectionEvent::RpcClientError(RpcResponse {
                        client: self.client,
                        correlation_id: self.correlation_id.clone(),
                        status,
                        error_message: Some(message),
                        content_type: None,
                        payload: Vec::new(),
                    }));
                }
            }
            Event::RequestInit { correlation_id, .. } | Event::RequestComplete(correlation_id) if self.is_mine(correlation_id) => {
                return Err(GneissError::new_invalid_state(RequestState::Faulted, format!("{} rejected by faulted request", event)));
            }
            _ => { return Ok(Disposition::Superstate); }
        }

        Ok(Disposition::Handled)
    }
}

impl<'a> StateMachine<PolicyContext<'a>> for Request {
    type State = RequestState;

    fn current_state(&self) -> RequestState {
        self.state
    }

    fn set_current_state(&mut self, state: RequestState) {
        self.state = state;
    }

    fn parent_of(state: RequestState) -> Option<RequestState> {
        match state {
            RequestState::Root => { None }
            RequestState::Started | RequestState::Completed | RequestState::Faulted => { Some(RequestState::Root) }
            RequestState::Idle | RequestState::Publishing | RequestState::Waiting => { Some(RequestState::Started) }
        }
    }

    fn handle_event(&mut self, state: RequestState, event: &Event<'_>, context: &mut PolicyContext<'a>) -> GneissResult<Disposition> {
        match state {
            RequestState::Root => { self.root(event, context) }
            RequestState::Started => { self.started(event, context) }
            RequestState::Idle => { self.idle(event, context) }
            RequestState::Publishing => { self.publishing(event, context) }
            RequestState::Waiting => { self.waiting(event, context) }
            RequestState::Completed => { self.completed(event, context) }
            RequestState::Faulted => { self.faulted(event, context) }
        }
    }
}

/// Slots of live requests.  Freed slots are reused by later requests.
#[derive(Default)]
pub(crate) struct RequestArena {
    slots: Vec<Option<Request>>,
}

impl RequestArena {

    pub(crate) fn new() -> Self {
        RequestArena {
            slots: Vec::new(),
        }
    }

    /// Starts a request (arming its execution timer) and stores it, returning its slot index
    pub(crate) fn insert(&mut self, mut request: Request, context: &mut PolicyContext<'_>) -> GneissResult<usize> {
        if self.contains(request.correlation_id()) {
            return Err(GneissError::new_duplicate_correlation_id());
        }

        if let Err(error) = request.start(context) {
            request.release(context);
            return Err(error);
        }

        match self.slots.iter().position(|slot| slot.is_none()) {
            Some(index) => {
                self.slots[index] = Some(request);
                Ok(index)
            }
            None => {
                self.slots.push(Some(request));
                Ok(self.slots.len() - 1)
            }
        }
    }

    /// Delivers an event to every live request, then frees the slot of any request the event
    /// completed.
    pub(crate) fn dispatch(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let mut result = Ok(());
        for slot in self.slots.iter_mut() {
            if let Some(request) = slot {
                result = fold_gneiss_result(result, send_event(request, event, context));
                if request.state() == RequestState::Completed {
                    *slot = None;
                }
            }
        }

        result
    }

    /// Removes a request regardless of its state, releasing its timers
    pub(crate) fn remove(&mut self, correlation_id: &CorrelationId, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let index = self.find(correlation_id).ok_or_else(|| {
            GneissError::new_item_not_found(format!("no request with correlation id {}", correlation_id))
        })?;

        if let Some(mut request) = self.slots[index].take() {
            observe_debug!(context.observer(), Component::Request, "request {} - removed in state {}", correlation_id, request.state());
            request.release(context);
        }

        Ok(())
    }

    pub(crate) fn release_all(&mut self, context: &mut PolicyContext<'_>) {
        for slot in self.slots.iter_mut() {
            if let Some(mut request) = slot.take() {
                request.release(context);
            }
        }
    }

    pub(crate) fn find(&self, correlation_id: &CorrelationId) -> Option<usize> {
        self.slots.iter().position(|slot| {
            matches!(slot, Some(request) if request.correlation_id() == correlation_id)
        })
    }

    pub(crate) fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.find(correlation_id).is_some()
    }

    pub(crate) fn state_of(&self, correlation_id: &CorrelationId) -> Option<RequestState> {
        self.find(correlation_id)
            .and_then(|index| self.slots[index].as_ref())
            .map(|request| request.state())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SubclientId;
    use crate::config::ConnectionOptionsBuilder;
    use crate::connection::hfsm::ConnectionPolicy;
    use crate::mqtt::PubackReasonCode;
    use crate::pipeline::EventPipeline;
    use crate::testing::*;
    use assert_matches::assert_matches;
    use std::time::Instant;

    const PUBLISH_TIMEOUT : Duration = Duration::from_secs(5);
    const EXECUTION_TIMEOUT : Duration = Duration::from_secs(30);

    struct RequestFixture {
        harness: TestHarness,
        connection: ConnectionPolicy,
        pipeline: EventPipeline,
        arena: RequestArena,
        start: Instant,
    }

    impl RequestFixture {
        fn new() -> Self {
            let harness = TestHarness::new();
            let pipeline = harness.create_pipeline();
            let start = pipeline.current_time();
            RequestFixture {
                connection: ConnectionPolicy::new(ConnectionOptionsBuilder::new("localhost", "client").build().unwrap()),
                pipeline,
                harness,
                arena: RequestArena::new(),
                start,
            }
        }

        fn add(&mut self, correlation_id: &CorrelationId, packet_id: PacketId) {
            let mut context = PolicyContext::new(&mut self.connection, &mut self.pipeline);
            let request = Request::new(RpcClientHandle(SubclientId::test_id(1)), correlation_id.clone(), PUBLISH_TIMEOUT, EXECUTION_TIMEOUT);
            self.arena.insert(request, &mut context).unwrap();
            self.arena.dispatch(&Event::RequestInit { correlation_id, packet_id }, &mut context).unwrap();
        }

        fn dispatch(&mut self, event: &Event<'_>) -> GneissResult<()> {
            let mut context = PolicyContext::new(&mut self.connection, &mut self.pipeline);
            self.arena.dispatch(event, &mut context)
        }

        fn fire_timers(&mut self, elapsed: Duration) {
            self.pipeline.set_current_time(self.start + elapsed);
            for timer in self.pipeline.take_expired_timers() {
                self.dispatch(&Event::Timeout(timer)).unwrap();
            }
        }

        fn remove(&mut self, correlation_id: &CorrelationId) -> GneissResult<()> {
            let mut context = PolicyContext::new(&mut self.connection, &mut self.pipeline);
            self.arena.remove(correlation_id, &mut context)
        }
    }

    #[test]
    fn request_lifecycle_to_completion() {
        let mut fixture = RequestFixture::new();
        let id = CorrelationId::from("request-1");
        fixture.add(&id, 7);
        assert_eq!(Some(RequestState::Publishing), fixture.arena.state_of(&id));
        assert_eq!(2, fixture.pipeline.timer_count());

        fixture.dispatch(&Event::Puback { id: 7, reason_code: PubackReasonCode::Success }).unwrap();
        assert_eq!(Some(RequestState::Waiting), fixture.arena.state_of(&id));
        assert_eq!(1, fixture.pipeline.timer_count());

        fixture.dispatch(&Event::RequestComplete(&id)).unwrap();
        assert_eq!(None, fixture.arena.state_of(&id));
        assert_eq!(0, fixture.arena.len());
        assert_eq!(0, fixture.pipeline.timer_count());
        assert!(fixture.harness.events().is_empty());
    }

    #[test]
    fn events_only_advance_the_owning_request() {
        let mut fixture = RequestFixture::new();
        let ids : Vec<CorrelationId> = (0..8u8).map(|i| CorrelationId::new(&[i])).collect();
        for (index, id) in ids.iter().enumerate() {
            fixture.add(id, index as PacketId + 1);
        }

        fixture.dispatch(&Event::Puback { id: 4, reason_code: PubackReasonCode::Success }).unwrap();
        for (index, id) in ids.iter().enumerate() {
            let expected = if index == 3 { RequestState::Waiting } else { RequestState::Publishing };
            assert_eq!(Some(expected), fixture.arena.state_of(id));
        }

        fixture.dispatch(&Event::RequestComplete(&ids[3])).unwrap();
        assert_eq!(None, fixture.arena.state_of(&ids[3]));
        for (index, id) in ids.iter().enumerate().filter(|(index, _)| *index != 3) {
            assert_eq!(Some(RequestState::Publishing), fixture.arena.state_of(id), "request {}", index);
        }

        assert_eq!(7, fixture.arena.len());
    }

    #[test]
    fn completed_request_is_gone() {
        let mut fixture = RequestFixture::new();
        let id = CorrelationId::from("done");
        fixture.add(&id, 1);
        fixture.dispatch(&Event::Puback { id: 1, reason_code: PubackReasonCode::Success }).unwrap();
        fixture.dispatch(&Event::RequestComplete(&id)).unwrap();

        // a duplicate response is not processed again
        fixture.dispatch(&Event::RequestComplete(&id)).unwrap();
        assert_matches!(fixture.remove(&id), Err(GneissError::ItemNotFound(_)));
        assert!(fixture.harness.events().is_empty());

        // the slot is reused
        let next = CorrelationId::from("next");
        fixture.add(&next, 2);
        assert_eq!(Some(0), fixture.arena.find(&next));
    }

    #[test]
    fn publish_timeout_faults_and_ignores_late_puback() {
        let mut fixture = RequestFixture::new();
        let id = CorrelationId::from("slow");
        fixture.add(&id, 3);

        fixture.fire_timers(PUBLISH_TIMEOUT);
        assert_eq!(Some(RequestState::Faulted), fixture.arena.state_of(&id));
        assert_eq!(0, fixture.pipeline.timer_count());

        let events = fixture.harness.events();
        assert_eq!(1, events.len());
        assert_matches!(&events[0], ConnectionEvent::RpcClientError(response) => {
            assert_eq!(id, response.correlation_id);
            assert_eq!(RpcStatus::TIMEOUT, response.status);
            assert_eq!(Some("Publish timed out.".to_string()), response.error_message);
        });

        fixture.dispatch(&Event::Puback { id: 3, reason_code: PubackReasonCode::Success }).unwrap();
        assert_eq!(Some(RequestState::Faulted), fixture.arena.state_of(&id));
        assert_eq!(1, fixture.harness.events().len());

        assert_matches!(fixture.dispatch(&Event::RequestComplete(&id)), Err(GneissError::InvalidState(_)));

        fixture.remove(&id).unwrap();
        assert_eq!(0, fixture.arena.len());
    }

    #[test]
    fn puback_failure_reports_reason_code_as_status() {
        let mut fixture = RequestFixture::new();
        let id = CorrelationId::from("rejected");
        fixture.add(&id, 9);

        fixture.dispatch(&Event::Puback { id: 9, reason_code: PubackReasonCode::NotAuthorized }).unwrap();
        assert_eq!(Some(RequestState::Faulted), fixture.arena.state_of(&id));
        assert_eq!(0, fixture.pipeline.timer_count());

        let events = fixture.harness.events();
        assert_matches!(&events[0], ConnectionEvent::RpcClientError(response) => {
            assert_eq!(RpcStatus(135), response.status);
            assert_eq!(Some("Puback has failure code.".to_string()), response.error_message);
        });
    }

    #[test]
    fn execution_timeout_while_waiting() {
        let mut fixture = RequestFixture::new();
        let id = CorrelationId::from("unanswered");
        fixture.add(&id, 1);
        fixture.dispatch(&Event::Puback { id: 1, reason_code: PubackReasonCode::Success }).unwrap();

        fixture.fire_timers(EXECUTION_TIMEOUT);
        assert_eq!(Some(RequestState::Faulted), fixture.arena.state_of(&id));
        assert_eq!(0, fixture.pipeline.timer_count());
        assert_matches!(&fixture.harness.events()[0], ConnectionEvent::RpcClientError(response) => {
            assert_eq!(RpcStatus::TIMEOUT, response.status);
            assert_eq!(Some("Execution timed out.".to_string()), response.error_message);
        });
    }

    #[test]
    fn malformed_response_faults_silently() {
        let mut fixture = RequestFixture::new();
        let id = CorrelationId::from("malformed");
        fixture.add(&id, 1);

        fixture.dispatch(&Event::RequestFaulted { correlation_id: &id, status: RpcStatus::UNKNOWN, message: "bad" }).unwrap();
        assert_eq!(Some(RequestState::Faulted), fixture.arena.state_of(&id));
        assert!(fixture.harness.events().is_empty());
        assert_eq!(0, fixture.pipeline.timer_count());
    }

    #[test]
    fn removing_live_request_releases_timers() {
        let mut fixture = RequestFixture::new();
        let id = CorrelationId::from("abandoned");
        fixture.add(&id, 1);
        assert_eq!(2, fixture.pipeline.timer_count());

        fixture.remove(&id).unwrap();
        assert_eq!(0, fixture.pipeline.timer_count());
        assert_eq!(0, fixture.arena.len());
    }

    #[test]
    fn correlation_ids_compare_by_content() {
        assert_eq!(CorrelationId::from("abc"), CorrelationId::new(b"abc"));
        assert_ne!(CorrelationId::from("abc"), CorrelationId::from("abd"));
        assert_eq!(16, CorrelationId::new_random().as_bytes().len());
        assert_ne!(CorrelationId::new_random(), CorrelationId::new_random());
        assert_eq!("616263", CorrelationId::from("abc").to_string());
    }
}
