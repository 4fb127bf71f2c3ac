/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Registry of sub-clients (RPC clients and servers, telemetry producers and consumers) attached to a
connection.

Inbound events are fanned out to every registered sub-client; each one filters on the packet ids,
correlation ids, topics and timers it owns.  Outbound operations issued by a sub-client go back
through the connection state machine via [`PolicyContext`].
 */

use crate::connection::hfsm::ConnectionPolicy;
use crate::error::{fold_gneiss_result, GneissError, GneissResult};
use crate::event::*;
use crate::logging::EventObserver;
use crate::mqtt::PacketId;
use crate::pipeline::{EventPipeline, TimerId};

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Identifies a sub-client within its connection
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubclientId(u64);

impl SubclientId {
    #[cfg(test)]
    pub(crate) fn test_id(id: u64) -> Self {
        SubclientId(id)
    }
}

impl fmt::Display for SubclientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an RPC client attached to a connection
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RpcClientHandle(pub(crate) SubclientId);

/// Handle to an RPC server attached to a connection
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RpcServerHandle(pub(crate) SubclientId);

/// Handle to a telemetry producer attached to a connection
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TelemetryProducerHandle(pub(crate) SubclientId);

/// Handle to a telemetry consumer attached to a connection
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TelemetryConsumerHandle(pub(crate) SubclientId);

/// Everything a sub-client may touch while handling an event: the connection state machine (for
/// outbound operations) and the shared pipeline (timers, listener, observer).
pub(crate) struct PolicyContext<'a> {
    connection: &'a mut ConnectionPolicy,
    pipeline: &'a mut EventPipeline,
}

impl<'a> PolicyContext<'a> {

    pub(crate) fn new(connection: &'a mut ConnectionPolicy, pipeline: &'a mut EventPipeline) -> Self {
        PolicyContext {
            connection,
            pipeline,
        }
    }

    pub(crate) fn publish(&mut self, request: &PublishRequest<'_>) -> GneissResult<PacketId> {
        self.connection.submit_outbound(&Event::Publish(request), self.pipeline)
    }

    pub(crate) fn subscribe(&mut self, request: &SubscribeRequest) -> GneissResult<PacketId> {
        self.connection.submit_outbound(&Event::Subscribe(request), self.pipeline)
    }

    pub(crate) fn unsubscribe(&mut self, request: &UnsubscribeRequest) -> GneissResult<PacketId> {
        self.connection.submit_outbound(&Event::Unsubscribe(request), self.pipeline)
    }

    pub(crate) fn notify(&self, event: ConnectionEvent) {
        self.pipeline.notify(event);
    }

    pub(crate) fn start_timer(&mut self, duration: Duration) -> GneissResult<TimerId> {
        self.pipeline.start_new_timer(duration)
    }

    pub(crate) fn destroy_timer(&mut self, id: TimerId) {
        self.pipeline.destroy_timer(id);
    }

    pub(crate) fn observer(&self) -> &dyn EventObserver {
        self.pipeline.observer()
    }

    pub(crate) fn current_time(&self) -> Instant {
        self.pipeline.current_time()
    }
}

/// Inbound half of the handler contract every sub-client state machine implements.
pub(crate) trait EventPolicy : Any + Send {

    /// Handles a transport event or timeout.  Events the sub-client does not own are ignored.
    fn handle_inbound(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<()>;

    /// Releases every timer the sub-client holds; called when it is detached from the connection
    fn release(&mut self, context: &mut PolicyContext<'_>);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Sub-clients attached to one connection, in registration order.
#[derive(Default)]
pub(crate) struct PolicyCollection {
    next_id: u64,
    subclients: BTreeMap<SubclientId, Box<dyn EventPolicy>>,
}

impl PolicyCollection {

    pub(crate) fn new() -> Self {
        PolicyCollection {
            next_id: 1,
            subclients: BTreeMap::new(),
        }
    }

    /// Reserves an id so a sub-client can be constructed knowing its own handle
    pub(crate) fn allocate_id(&mut self) -> SubclientId {
        let id = SubclientId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn add(&mut self, id: SubclientId, subclient: Box<dyn EventPolicy>) {
        self.subclients.insert(id, subclient);
    }

    pub(crate) fn remove(&mut self, id: SubclientId) -> GneissResult<Box<dyn EventPolicy>> {
        self.subclients.remove(&id).ok_or_else(|| {
            GneissError::new_item_not_found(format!("sub-client {} is not attached", id))
        })
    }

    pub(crate) fn get<T: EventPolicy>(&self, id: SubclientId) -> GneissResult<&T> {
        self.subclients.get(&id)
            .and_then(|subclient| subclient.as_any().downcast_ref::<T>())
            .ok_or_else(|| GneissError::new_not_supported(format!("sub-client {} is not attached or has a different kind", id)))
    }

    pub(crate) fn get_mut<T: EventPolicy>(&mut self, id: SubclientId) -> GneissResult<&mut T> {
        self.subclients.get_mut(&id)
            .and_then(|subclient| subclient.as_any_mut().downcast_mut::<T>())
            .ok_or_else(|| GneissError::new_not_supported(format!("sub-client {} is not attached or has a different kind", id)))
    }

    /// Delivers an event to every sub-client.  A failure in one sub-client does not stop delivery
    /// to the others; the last failure is returned.
    pub(crate) fn dispatch_inbound(&mut self, event: &Event<'_>, context: &mut PolicyContext<'_>) -> GneissResult<()> {
        let mut result = Ok(());
        for subclient in self.subclients.values_mut() {
            result = fold_gneiss_result(result, subclient.handle_inbound(event, context));
        }

        result
    }

    pub(crate) fn len(&self) -> usize {
        self.subclients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptionsBuilder;
    use crate::testing::*;
    use assert_matches::assert_matches;

    struct CountingPolicy {
        received: usize,
        fail: bool,
    }

    impl EventPolicy for CountingPolicy {
        fn handle_inbound(&mut self, _: &Event<'_>, _: &mut PolicyContext<'_>) -> GneissResult<()> {
            self.received += 1;
            if self.fail {
                return Err(GneissError::new_try_again_later());
            }

            Ok(())
        }

        fn release(&mut self, _: &mut PolicyContext<'_>) {}

        fn as_any(&self) -> &dyn Any { self }

        fn as_any_mut(&mut self) -> &mut dyn Any { self }
    }

    struct OtherPolicy {}

    impl EventPolicy for OtherPolicy {
        fn handle_inbound(&mut self, _: &Event<'_>, _: &mut PolicyContext<'_>) -> GneissResult<()> { Ok(()) }

        fn release(&mut self, _: &mut PolicyContext<'_>) {}

        fn as_any(&self) -> &dyn Any { self }

        fn as_any_mut(&mut self) -> &mut dyn Any { self }
    }

    #[test]
    fn dispatch_reaches_every_subclient_despite_failures() {
        let options = ConnectionOptionsBuilder::new("localhost", "client").build().unwrap();
        let harness = TestHarness::new();
        let mut connection = ConnectionPolicy::new(options);
        let mut pipeline = harness.create_pipeline();

        let mut collection = PolicyCollection::new();
        let failing = collection.allocate_id();
        let healthy = collection.allocate_id();
        collection.add(failing, Box::new(CountingPolicy { received: 0, fail: true }));
        collection.add(healthy, Box::new(CountingPolicy { received: 0, fail: false }));

        let mut context = PolicyContext::new(&mut connection, &mut pipeline);
        assert_matches!(collection.dispatch_inbound(&Event::RpcSubscribeRequest, &mut context), Err(GneissError::TryAgainLater(_)));

        assert_eq!(1, collection.get::<CountingPolicy>(failing).unwrap().received);
        assert_eq!(1, collection.get::<CountingPolicy>(healthy).unwrap().received);
    }

    #[test]
    fn typed_lookup_and_removal() {
        let mut collection = PolicyCollection::new();
        let id = collection.allocate_id();
        collection.add(id, Box::new(OtherPolicy {}));
        assert_eq!(1, collection.len());

        assert!(collection.get_mut::<OtherPolicy>(id).is_ok());
        assert!(matches!(collection.get::<CountingPolicy>(id), Err(GneissError::NotSupported(_))));

        assert!(collection.remove(id).is_ok());
        assert!(matches!(collection.remove(id), Err(GneissError::ItemNotFound(_))));
        assert!(matches!(collection.get::<OtherPolicy>(id), Err(GneissError::NotSupported(_))));
        assert_eq!(0, collection.len());
    }
}
