/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Hierarchical state machine plumbing shared by every state machine in the crate.

A state machine is an explicit state enum plus a `parent_of` function.  Events are handed to the
handler of the current leaf state; a handler that returns [`Disposition::Superstate`] passes the
event to the parent state's handler, and so on up to the root.  The root must handle everything.

Transitions run exit handlers from the current leaf up to the transition's source, then the entry
handler of the destination.  The current state is updated before the destination's entry handler
runs, so entry handlers may themselves transition.
 */

use crate::error::GneissResult;
use crate::event::Event;

use std::fmt;

/// Result of handling an event in a single state
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Handled,
    Superstate,
}

pub(crate) trait StateMachine<C> {
    type State : Copy + Eq + fmt::Debug;

    fn current_state(&self) -> Self::State;

    fn set_current_state(&mut self, state: Self::State);

    fn parent_of(state: Self::State) -> Option<Self::State>;

    fn handle_event(&mut self, state: Self::State, event: &Event<'_>, context: &mut C) -> GneissResult<Disposition>;
}

fn parent_or_panic<C, M: StateMachine<C>>(state: M::State) -> M::State {
    match M::parent_of(state) {
        Some(parent) => { parent }
        None => {
            panic!("state machine walked past its root from state {:?}", state);
        }
    }
}

/// Delivers an event to the current state, escalating to superstates until it is handled.
pub(crate) fn send_event<C, M: StateMachine<C>>(machine: &mut M, event: &Event<'_>, context: &mut C) -> GneissResult<()> {
    let mut state = machine.current_state();
    loop {
        match machine.handle_event(state, event, context)? {
            Disposition::Handled => { return Ok(()); }
            Disposition::Superstate => {
                state = parent_or_panic::<C, M>(state);
            }
        }
    }
}

// exits every state from the current leaf up to, but not including, `source`
fn exit_to<C, M: StateMachine<C>>(machine: &mut M, source: M::State, context: &mut C) -> GneissResult<()> {
    let mut current = machine.current_state();
    while current != source {
        machine.handle_event(current, &Event::Exit, context)?;
        current = parent_or_panic::<C, M>(current);
        machine.set_current_state(current);
    }

    Ok(())
}

/// Transitions between two states that share a parent: exits up to and including `source`,
/// then enters `destination`.
pub(crate) fn transition_peer<C, M: StateMachine<C>>(machine: &mut M, source: M::State, destination: M::State, context: &mut C) -> GneissResult<()> {
    exit_to(machine, source, context)?;
    machine.handle_event(source, &Event::Exit, context)?;
    machine.set_current_state(destination);
    machine.handle_event(destination, &Event::Entry, context)?;

    Ok(())
}

/// Transitions from a state into one of its children: exits up to `source` without exiting it,
/// then enters `destination`.
pub(crate) fn transition_substate<C, M: StateMachine<C>>(machine: &mut M, source: M::State, destination: M::State, context: &mut C) -> GneissResult<()> {
    exit_to(machine, source, context)?;
    machine.set_current_state(destination);
    machine.handle_event(destination, &Event::Entry, context)?;

    Ok(())
}

/// Transitions from a state back to its parent: exits up to and including `source` without
/// re-entering the parent.
pub(crate) fn transition_superstate<C, M: StateMachine<C>>(machine: &mut M, source: M::State, context: &mut C) -> GneissResult<()> {
    exit_to(machine, source, context)?;
    machine.handle_event(source, &Event::Exit, context)?;
    machine.set_current_state(parent_or_panic::<C, M>(source));

    Ok(())
}
