/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use std::error::Error;
use std::fmt;

/// Additional details about an InvalidArgument error variant
#[derive(Debug)]
pub struct InvalidArgumentContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InvalidState error variant
#[derive(Debug)]
pub struct InvalidStateContext {

    /// name of the state that rejected the event
    pub state: String,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a NotSupported error variant
#[derive(Debug)]
pub struct NotSupportedContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a NotConnected error variant
#[derive(Debug)]
pub struct NotConnectedContext {
}

/// Additional details about a TransportError error variant
#[derive(Debug)]
pub struct TransportErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InsufficientBuffer error variant
#[derive(Debug)]
pub struct InsufficientBufferContext {

    /// number of bytes the operation needed
    pub required_length: usize,

    /// number of bytes the operation was allowed to use
    pub available_length: usize,
}

/// Additional details about an ItemNotFound error variant
#[derive(Debug)]
pub struct ItemNotFoundContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an UnexpectedCharacter error variant
#[derive(Debug)]
pub struct UnexpectedCharacterContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a TopicNoMatch error variant
#[derive(Debug)]
pub struct TopicNoMatchContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a PublishInProgress error variant
#[derive(Debug)]
pub struct PublishInProgressContext {
}

/// Additional details about a TryAgainLater error variant
#[derive(Debug)]
pub struct TryAgainLaterContext {
}

/// Additional details about a CapacityExceeded error variant
#[derive(Debug)]
pub struct CapacityExceededContext {

    /// the limit that was reached
    pub capacity: usize,
}

/// Additional details about a DuplicateCorrelationId error variant
#[derive(Debug)]
pub struct DuplicateCorrelationIdContext {
}

/// Additional details about a Timeout error variant
#[derive(Debug)]
pub struct TimeoutContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InternalStateError error variant
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an OtherError error variant
#[derive(Debug)]
pub struct OtherErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Basic error type for the entire gneiss-rpc crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum GneissError {

    /// A caller-supplied value was rejected before any event was posted.
    InvalidArgument(InvalidArgumentContext),

    /// A state machine received an event that its current state does not accept.  Faulted
    /// state machines report this for every application request.
    InvalidState(InvalidStateContext),

    /// The operation targets a sub-client that is not attached to the connection, or a handle
    /// of the wrong kind.
    NotSupported(NotSupportedContext),

    /// An outbound MQTT operation was attempted while the connection is not established.
    NotConnected(NotConnectedContext),

    /// The transport collaborator refused to accept an outbound operation.
    TransportError(TransportErrorContext),

    /// A topic or property would exceed its length bound.
    InsufficientBuffer(InsufficientBufferContext),

    /// A lookup (correlation id, mandatory MQTT5 property, registered sub-client) found nothing.
    ItemNotFound(ItemNotFoundContext),

    /// A textual value (for example an RPC status property) could not be parsed.
    UnexpectedCharacter(UnexpectedCharacterContext),

    /// A topic does not match the format or filter it was checked against.
    TopicNoMatch(TopicNoMatchContext),

    /// A QoS 1+ telemetry publish is already waiting for its acknowledgement.
    PublishInProgress(PublishInProgressContext),

    /// The RPC client is still establishing its response subscription.
    TryAgainLater(TryAgainLaterContext),

    /// A fixed-size table (pending requests, pending commands) is full.
    CapacityExceeded(CapacityExceededContext),

    /// A correlation id was reused while its request is still outstanding.
    DuplicateCorrelationId(DuplicateCorrelationIdContext),

    /// A protocol timer expired before the awaited acknowledgement or response.
    Timeout(TimeoutContext),

    /// A state machine reached an inconsistent internal state; almost certainly a bug.
    InternalStateError(InternalStateErrorContext),

    /// Generic error wrapper for errors from transport bindings and other auxiliary crates.
    OtherError(OtherErrorContext),
}

impl GneissError {

    pub(crate) fn new_invalid_argument(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::InvalidArgument(
            InvalidArgumentContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_invalid_state(state: impl fmt::Display, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::InvalidState(
            InvalidStateContext {
                state : state.to_string(),
                source : source.into()
            }
        )
    }

    pub(crate) fn new_not_supported(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::NotSupported(
            NotSupportedContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_not_connected() -> Self {
        GneissError::NotConnected(
            NotConnectedContext {
            }
        )
    }

    /// Constructs a new TransportError variant from an existing error.  Transport bindings
    /// should use this to report a refused connect, publish, subscribe, unsubscribe or disconnect.
    pub fn new_transport_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::TransportError(
            TransportErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_insufficient_buffer(required_length: usize, available_length: usize) -> Self {
        GneissError::InsufficientBuffer(
            InsufficientBufferContext {
                required_length,
                available_length
            }
        )
    }

    pub(crate) fn new_item_not_found(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::ItemNotFound(
            ItemNotFoundContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_unexpected_character(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::UnexpectedCharacter(
            UnexpectedCharacterContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_topic_no_match(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::TopicNoMatch(
            TopicNoMatchContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_publish_in_progress() -> Self {
        GneissError::PublishInProgress(
            PublishInProgressContext {
            }
        )
    }

    pub(crate) fn new_try_again_later() -> Self {
        GneissError::TryAgainLater(
            TryAgainLaterContext {
            }
        )
    }

    pub(crate) fn new_capacity_exceeded(capacity: usize) -> Self {
        GneissError::CapacityExceeded(
            CapacityExceededContext {
                capacity
            }
        )
    }

    pub(crate) fn new_duplicate_correlation_id() -> Self {
        GneissError::DuplicateCorrelationId(
            DuplicateCorrelationIdContext {
            }
        )
    }

    pub(crate) fn new_timeout(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::Timeout(
            TimeoutContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::InternalStateError(
            InternalStateErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new OtherError variant from an existing error.  Use this to wrap errors that
    /// do not fall into any appropriate existing category.
    #[doc(hidden)]
    pub fn new_other_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::OtherError (
            OtherErrorContext {
                source : source.into()
            }
        )
    }
}

impl Error for GneissError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GneissError::InvalidArgument(context) => {
                Some(context.source.as_ref())
            }
            GneissError::InvalidState(context) => {
                Some(context.source.as_ref())
            }
            GneissError::NotSupported(context) => {
                Some(context.source.as_ref())
            }
            GneissError::TransportError(context) => {
                Some(context.source.as_ref())
            }
            GneissError::ItemNotFound(context) => {
                Some(context.source.as_ref())
            }
            GneissError::UnexpectedCharacter(context) => {
                Some(context.source.as_ref())
            }
            GneissError::TopicNoMatch(context) => {
                Some(context.source.as_ref())
            }
            GneissError::Timeout(context) => {
                Some(context.source.as_ref())
            }
            GneissError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            GneissError::OtherError(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for GneissError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GneissError::InvalidArgument(_) => {
                write!(f, "invalid argument; source contains further details")
            }
            GneissError::InvalidState(context) => {
                write!(f, "event rejected by state machine state {}", context.state)
            }
            GneissError::NotSupported(_) => {
                write!(f, "operation not supported on this sub-client or connection")
            }
            GneissError::NotConnected(_) => {
                write!(f, "outbound MQTT operation attempted while the connection is not established")
            }
            GneissError::TransportError(_) => {
                write!(f, "transport error; source contains further details")
            }
            GneissError::InsufficientBuffer(context) => {
                write!(f, "required length {} exceeds available length {}", context.required_length, context.available_length)
            }
            GneissError::ItemNotFound(_) => {
                write!(f, "requested item was not found")
            }
            GneissError::UnexpectedCharacter(_) => {
                write!(f, "value contains an unexpected character")
            }
            GneissError::TopicNoMatch(_) => {
                write!(f, "topic does not match the expected format")
            }
            GneissError::PublishInProgress(_) => {
                write!(f, "a publish is already awaiting acknowledgement")
            }
            GneissError::TryAgainLater(_) => {
                write!(f, "subscription is still being established; try again later")
            }
            GneissError::CapacityExceeded(context) => {
                write!(f, "capacity of {} outstanding entries exceeded", context.capacity)
            }
            GneissError::DuplicateCorrelationId(_) => {
                write!(f, "correlation id is already in use by an outstanding request")
            }
            GneissError::Timeout(_) => {
                write!(f, "protocol timer expired before the awaited acknowledgement")
            }
            GneissError::InternalStateError(_) => {
                write!(f, "state machine reached an invalid internal state; almost certainly a bug")
            }
            GneissError::OtherError(_) => {
                write!(f, "fallback error type; source contains further details")
            }
        }
    }
}

impl From<std::num::ParseIntError> for GneissError {
    fn from(err: std::num::ParseIntError) -> Self {
        GneissError::new_unexpected_character(err)
    }
}

impl From<std::str::Utf8Error> for GneissError {
    fn from(err: std::str::Utf8Error) -> Self {
        GneissError::new_unexpected_character(err)
    }
}

/// Crate-wide result type for functions that can fail
pub type GneissResult<T> = Result<T, GneissError>;

pub(crate) fn fold_gneiss_result<T>(base: GneissResult<T>, new_result: GneissResult<T>) -> GneissResult<T> {
    new_result?;
    base
}
