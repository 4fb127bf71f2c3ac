/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The event pipeline: the transport binding at one end, the application listener at the other,
and a deadline-based timer facility that re-enters the state machines as timeout events.
 */

use crate::error::{GneissError, GneissResult};
use crate::event::*;
use crate::logging::*;
use crate::mqtt::PacketId;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifies a single pipeline timer.  Timeout events carry the id of the timer that fired so a
/// state machine can ignore timers it does not own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound half of an MQTT5 client library binding.
///
/// Each call reports acceptance for delivery, not completion; completion arrives later as a
/// [`TransportEvent`] passed to the connection.  Calls must not block.
pub trait MqttTransport : Send {

    /// Starts a connection attempt
    fn connect(&mut self, request: &ConnectRequest) -> GneissResult<()>;

    /// Enqueues a publish and returns the packet id its acknowledgement will carry
    fn publish(&mut self, request: &PublishRequest<'_>) -> GneissResult<PacketId>;

    /// Enqueues a subscribe and returns the packet id its acknowledgement will carry
    fn subscribe(&mut self, request: &SubscribeRequest) -> GneissResult<PacketId>;

    /// Enqueues an unsubscribe and returns the packet id its acknowledgement will carry
    fn unsubscribe(&mut self, request: &UnsubscribeRequest) -> GneissResult<PacketId>;

    /// Starts closing the connection
    fn disconnect(&mut self) -> GneissResult<()>;
}

/// Single-shot timers keyed by id.  A created timer exists until destroyed; starting it sets a
/// deadline, and firing or stopping it clears the deadline.
#[derive(Default)]
pub(crate) struct PipelineTimers {
    next_id: u64,
    timers: HashMap<TimerId, Option<Instant>>,
}

impl PipelineTimers {

    pub(crate) fn new() -> Self {
        PipelineTimers {
            next_id: 1,
            timers: HashMap::new(),
        }
    }

    pub(crate) fn create_timer(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.insert(id, None);
        id
    }

    pub(crate) fn start_timer(&mut self, id: TimerId, now: Instant, duration: Duration) -> GneissResult<()> {
        match self.timers.get_mut(&id) {
            Some(deadline) => {
                *deadline = Some(now + duration);
                Ok(())
            }
            None => {
                Err(GneissError::new_item_not_found(format!("timer {} does not exist", id)))
            }
        }
    }

    pub(crate) fn stop_timer(&mut self, id: TimerId) {
        if let Some(deadline) = self.timers.get_mut(&id) {
            *deadline = None;
        }
    }

    pub(crate) fn destroy_timer(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().flatten().min().copied()
    }

    /// Removes the deadline of every timer that has expired at `now` and returns their ids,
    /// earliest deadline first.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut expired : Vec<(Instant, TimerId)> = self.timers.iter()
            .filter_map(|(id, deadline)| {
                match deadline {
                    Some(deadline) if *deadline <= now => { Some((*deadline, *id)) }
                    _ => { None }
                }
            })
            .collect();
        expired.sort();

        for (_, id) in expired.iter() {
            self.stop_timer(*id);
        }

        expired.into_iter().map(|(_, id)| id).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}

/// Shared plumbing every state machine of a connection reaches through its context.
pub(crate) struct EventPipeline {
    transport: Box<dyn MqttTransport>,
    timers: PipelineTimers,
    listener: ConnectionEventListener,
    observer: Arc<dyn EventObserver>,
    current_time: Instant,
    assigned_packet_id: Option<PacketId>,
}

impl EventPipeline {

    pub(crate) fn new(transport: Box<dyn MqttTransport>, listener: ConnectionEventListener, observer: Arc<dyn EventObserver>, now: Instant) -> Self {
        EventPipeline {
            transport,
            timers: PipelineTimers::new(),
            listener,
            observer,
            current_time: now,
            assigned_packet_id: None,
        }
    }

    pub(crate) fn set_current_time(&mut self, now: Instant) {
        self.current_time = now;
    }

    pub(crate) fn current_time(&self) -> Instant {
        self.current_time
    }

    pub(crate) fn observer(&self) -> &dyn EventObserver {
        self.observer.as_ref()
    }

    pub(crate) fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub(crate) fn take_expired_timers(&mut self) -> Vec<TimerId> {
        let now = self.current_time;
        self.timers.take_expired(now)
    }

    /// Creates a timer and starts it relative to the pipeline's current time.
    pub(crate) fn start_new_timer(&mut self, duration: Duration) -> GneissResult<TimerId> {
        let id = self.timers.create_timer();
        let now = self.current_time;
        self.timers.start_timer(id, now, duration)?;
        observe_debug!(self.observer, Component::Pipeline, "timer {} started for {:?}", id, duration);
        Ok(id)
    }

    pub(crate) fn destroy_timer(&mut self, id: TimerId) {
        observe_debug!(self.observer, Component::Pipeline, "timer {} destroyed", id);
        self.timers.destroy_timer(id);
    }

    pub(crate) fn transport(&mut self) -> &mut dyn MqttTransport {
        self.transport.as_mut()
    }

    /// Records the packet id assigned to the outbound operation currently being dispatched
    pub(crate) fn set_assigned_packet_id(&mut self, id: PacketId) {
        self.assigned_packet_id = Some(id);
    }

    pub(crate) fn take_assigned_packet_id(&mut self) -> Option<PacketId> {
        self.assigned_packet_id.take()
    }

    pub(crate) fn notify(&self, event: ConnectionEvent) {
        observe_debug!(self.observer, Component::Pipeline, "notifying application of {}", event);
        (self.listener)(Arc::new(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn timers_expire_in_deadline_order() {
        let mut timers = PipelineTimers::new();
        let now = Instant::now();

        let late = timers.create_timer();
        let early = timers.create_timer();
        let unstarted = timers.create_timer();
        timers.start_timer(late, now, Duration::from_secs(10)).unwrap();
        timers.start_timer(early, now, Duration::from_secs(5)).unwrap();

        assert_eq!(Some(now + Duration::from_secs(5)), timers.next_deadline());
        assert!(timers.take_expired(now + Duration::from_secs(4)).is_empty());
        assert_eq!(vec![early, late], timers.take_expired(now + Duration::from_secs(10)));

        // fired timers stay allocated until destroyed
        assert!(timers.take_expired(now + Duration::from_secs(20)).is_empty());
        assert_eq!(None, timers.next_deadline());
        assert_eq!(3, timers.len());

        timers.destroy_timer(late);
        timers.destroy_timer(early);
        timers.destroy_timer(unstarted);
        assert_eq!(0, timers.len());
    }

    #[test]
    fn stopped_and_destroyed_timers_never_fire() {
        let mut timers = PipelineTimers::new();
        let now = Instant::now();

        let stopped = timers.create_timer();
        let destroyed = timers.create_timer();
        timers.start_timer(stopped, now, Duration::from_secs(1)).unwrap();
        timers.start_timer(destroyed, now, Duration::from_secs(1)).unwrap();
        timers.stop_timer(stopped);
        timers.destroy_timer(destroyed);

        assert!(timers.take_expired(now + Duration::from_secs(2)).is_empty());
        assert_matches!(timers.start_timer(destroyed, now, Duration::from_secs(1)), Err(GneissError::ItemNotFound(_)));
    }
}
