/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Functionality for driving a [`Connection`] from a [`tokio`](https://crates.io/crates/tokio)
runtime.

The connection itself never waits on anything; a service task sleeps until the connection's next
timer deadline and then services it.  Any code that changes the connection (opening it, invoking a
command, delivering a transport event) must notify the task's wake handle afterwards so it can
pick up a new, possibly earlier, deadline.
 */

use crate::connection::Connection;
use crate::event::{ConnectionEvent, ConnectionEventListener};

use log::*;
use std::sync::{Arc, Mutex};
use tokio::runtime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Shared handle to a connection serviced by a tokio task
pub type SharedConnection = Arc<Mutex<Connection>>;

fn next_service_time(connection: &SharedConnection) -> Option<Option<std::time::Instant>> {
    match connection.lock() {
        Ok(guard) => { Some(guard.next_service_time()) }
        Err(_) => {
            error!("tokio - connection lock poisoned, stopping service task");
            None
        }
    }
}

fn service_connection(connection: &SharedConnection) -> bool {
    match connection.lock() {
        Ok(mut guard) => {
            if let Err(error) = guard.service(std::time::Instant::now()) {
                warn!("tokio - servicing connection timers failed: {}", error);
            }
            true
        }
        Err(_) => {
            error!("tokio - connection lock poisoned, stopping service task");
            false
        }
    }
}

async fn service_loop(connection: SharedConnection, wake: Arc<Notify>) {
    loop {
        let Some(next_service_time) = next_service_time(&connection) else {
            return;
        };

        match next_service_time {
            Some(deadline) => {
                trace!("tokio - service task sleeping until next deadline");
                tokio::select! {
                    _ = sleep_until(Instant::from_std(deadline)) => {
                        if !service_connection(&connection) {
                            return;
                        }
                    }
                    _ = wake.notified() => {
                        debug!("tokio - service task woken");
                    }
                }
            }
            None => {
                trace!("tokio - service task waiting for work");
                wake.notified().await;
            }
        }
    }
}

/// Spawns a task that services the connection's timers as they expire.
///
/// The task runs until aborted through the returned handle or until the connection's lock is
/// poisoned.
pub fn spawn_timer_service(connection: SharedConnection, wake: Arc<Notify>, runtime_handle: &runtime::Handle) -> JoinHandle<()> {
    runtime_handle.spawn(service_loop(connection, wake))
}

/// Wraps a listener so each event is delivered from its own tokio task instead of from inside the
/// connection call that produced it.  Delivery order across events is not preserved.
pub fn spawn_event_listener(listener: ConnectionEventListener, runtime_handle: runtime::Handle) -> ConnectionEventListener {
    Arc::new(move |event: Arc<ConnectionEvent>| {
        let listener = listener.clone();
        runtime_handle.spawn(async move {
            (listener)(event)
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptionsBuilder;
    use crate::connection::ConnectionState;
    use crate::mqtt::ConnectReasonCode;
    use crate::event::TransportEvent;
    use crate::testing::*;
    use std::time::Duration;

    #[tokio::test]
    async fn service_task_drives_reconnect() {
        let harness = TestHarness::new();
        let options = ConnectionOptionsBuilder::new("localhost", "client")
            .with_min_retry_delay(Duration::from_millis(10))
            .with_max_retry_delay(Duration::from_millis(10))
            .with_max_random_jitter(Duration::ZERO)
            .build()
            .unwrap();

        let connection : SharedConnection = Arc::new(Mutex::new(Connection::new(options, harness.create_transport(), harness.create_listener(), std::time::Instant::now())));
        let wake = Arc::new(Notify::new());
        let task = spawn_timer_service(connection.clone(), wake.clone(), &runtime::Handle::current());

        {
            let mut guard = connection.lock().unwrap();
            let now = std::time::Instant::now();
            guard.open(now).unwrap();
            guard.handle_transport_event(&TransportEvent::ConnectResponse { reason_code: ConnectReasonCode::ServerBusy }, now).unwrap();
            assert_eq!(ConnectionState::ReconnectTimeout, guard.state());
        }
        wake.notify_one();

        let mut reconnected = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if harness.transport().connects.len() == 2 {
                reconnected = true;
                break;
            }
        }

        assert!(reconnected);
        assert_eq!(ConnectionState::Connecting, connection.lock().unwrap().state());

        task.abort();
    }

    #[tokio::test]
    async fn spawned_listener_receives_events() {
        let harness = TestHarness::new();
        let listener = spawn_event_listener(harness.create_listener(), runtime::Handle::current());

        (listener)(Arc::new(ConnectionEvent::RetryExhausted { attempts: 3 }));

        let mut delivered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if !harness.events().is_empty() {
                delivered = true;
                break;
            }
        }

        assert!(delivered);
        assert_eq!(vec![ConnectionEvent::RetryExhausted { attempts: 3 }], harness.events());
    }
}
