/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Application-side table of outstanding RPC invocations with per-entry expiry.

The RPC client state machine does not consult this table.  An application records each invoke
here, removes the entry when the response arrives, and polls [`PendingCommands::first_expired`]
to time out invocations it no longer wants to wait for.  A late response for an entry that has
already been expired fails the [`PendingCommands::is_pending`] check.
 */

use crate::error::{GneissError, GneissResult};
use crate::request::CorrelationId;

use std::time::{Duration, Instant};

/// A single outstanding invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCommand {

    /// correlation id of the invocation
    pub correlation_id: CorrelationId,

    /// application label, typically the command name
    pub label: String,

    /// point in time after which the invocation is considered expired
    pub expiration: Instant,
}

/// Fixed-capacity table of outstanding invocations keyed by correlation id
#[derive(Debug)]
pub struct PendingCommands {
    capacity: usize,
    commands: Vec<PendingCommand>,
}

impl PendingCommands {

    /// Creates an empty table holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        PendingCommands {
            capacity,
            commands: Vec::with_capacity(capacity),
        }
    }

    /// Records an invocation that expires `timeout` after `now`
    pub fn add(&mut self, correlation_id: CorrelationId, label: &str, timeout: Duration, now: Instant) -> GneissResult<()> {
        if self.is_pending(&correlation_id) {
            return Err(GneissError::new_duplicate_correlation_id());
        }

        if self.commands.len() >= self.capacity {
            return Err(GneissError::new_capacity_exceeded(self.capacity));
        }

        self.commands.push(PendingCommand {
            correlation_id,
            label: label.to_string(),
            expiration: now + timeout,
        });

        Ok(())
    }

    /// Removes an invocation, returning it
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> GneissResult<PendingCommand> {
        match self.commands.iter().position(|command| command.correlation_id == *correlation_id) {
            Some(index) => { Ok(self.commands.remove(index)) }
            None => { Err(GneissError::new_item_not_found(format!("correlation id {} is not pending", correlation_id))) }
        }
    }

    /// Returns true if an invocation with this correlation id is outstanding
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.commands.iter().any(|command| command.correlation_id == *correlation_id)
    }

    /// Returns the invocation with the earliest expiration that has expired at `now`, if any
    pub fn first_expired(&self, now: Instant) -> Option<&PendingCommand> {
        self.commands.iter()
            .filter(|command| command.expiration <= now)
            .min_by_key(|command| command.expiration)
    }

    /// Number of outstanding invocations
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
