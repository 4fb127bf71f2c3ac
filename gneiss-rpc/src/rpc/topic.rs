/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Topic formats: topic strings with `{token}` placeholders that are filled in to build publish
topics and subscription filters, and matched against incoming topics to recover token values.

A token must occupy a whole topic level.  Formats are validated once, when parsed.
 */

use crate::error::{GneissError, GneissResult};
use crate::mqtt::{is_valid_topic_filter, MAXIMUM_STRING_PROPERTY_LENGTH};

use std::fmt;

/// Default format of RPC request topics
pub const DEFAULT_REQUEST_TOPIC_FORMAT : &str = "vehicles/{serviceId}/commands/{executorId}/{name}";

/// Default format of RPC response topics
pub const DEFAULT_RESPONSE_TOPIC_FORMAT : &str = "vehicles/{serviceId}/commands/{executorId}/{name}/for/{invokerClientId}";

/// Default format of telemetry topics
pub const DEFAULT_TELEMETRY_TOPIC_FORMAT : &str = "vehicles/{serviceId}/telemetry/{senderId}/{telemetryName}";

/// Executor id used when a request may be handled by any server
pub const ANY_EXECUTOR_ID : &str = "_any_";

/// Single level wildcard, used as a token value when building subscription filters
pub const SINGLE_LEVEL_WILDCARD : &str = "+";

/// Maximum length of a built topic
pub const MAXIMUM_TOPIC_LENGTH : usize = MAXIMUM_STRING_PROPERTY_LENGTH;

const SERVICE_GROUP_PREFIX : &str = "$share/";

/// Placeholder tokens recognized in a topic format
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TopicToken {

    /// `{invokerClientId}`: client id of the RPC client that invoked a command
    InvokerClientId,

    /// `{serviceId}`: model or service id
    ServiceId,

    /// `{executorId}`: client id of the RPC server expected to execute a command
    ExecutorId,

    /// `{senderId}`: client id of a telemetry sender
    SenderId,

    /// `{name}`: command name
    Name,

    /// `{telemetryName}`: telemetry name
    TelemetryName,
}

impl TopicToken {
    fn from_name(name: &str) -> Option<TopicToken> {
        match name {
            "invokerClientId" => { Some(TopicToken::InvokerClientId) }
            "serviceId" => { Some(TopicToken::ServiceId) }
            "executorId" => { Some(TopicToken::ExecutorId) }
            "senderId" => { Some(TopicToken::SenderId) }
            "name" => { Some(TopicToken::Name) }
            "telemetryName" => { Some(TopicToken::TelemetryName) }
            _ => { None }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TopicToken::InvokerClientId => { "invokerClientId" }
            TopicToken::ServiceId => { "serviceId" }
            TopicToken::ExecutorId => { "executorId" }
            TopicToken::SenderId => { "senderId" }
            TopicToken::Name => { "name" }
            TopicToken::TelemetryName => { "telemetryName" }
        }
    }
}

impl fmt::Display for TopicToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.name())
    }
}

/// Values for the tokens of a topic format.  Used both as input to [`TopicFormat::build`] and as
/// the result (and expected values) of [`TopicFormat::extract`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicTokens {

    /// Value of `{invokerClientId}`
    pub invoker_client_id: Option<String>,

    /// Value of `{serviceId}`
    pub service_id: Option<String>,

    /// Value of `{executorId}`
    pub executor_id: Option<String>,

    /// Value of `{senderId}`
    pub sender_id: Option<String>,

    /// Value of `{name}`
    pub name: Option<String>,

    /// Value of `{telemetryName}`
    pub telemetry_name: Option<String>,
}

impl TopicTokens {

    /// Creates an empty token set
    pub fn new() -> Self {
        TopicTokens::default()
    }

    /// Sets the value of a token, returning the updated set
    pub fn with(mut self, token: TopicToken, value: &str) -> Self {
        *self.slot(token) = Some(value.to_string());
        self
    }

    /// Returns the value of a token, if set
    pub fn get(&self, token: TopicToken) -> Option<&str> {
        match token {
            TopicToken::InvokerClientId => { self.invoker_client_id.as_deref() }
            TopicToken::ServiceId => { self.service_id.as_deref() }
            TopicToken::ExecutorId => { self.executor_id.as_deref() }
            TopicToken::SenderId => { self.sender_id.as_deref() }
            TopicToken::Name => { self.name.as_deref() }
            TopicToken::TelemetryName => { self.telemetry_name.as_deref() }
        }
    }

    fn slot(&mut self, token: TopicToken) -> &mut Option<String> {
        match token {
            TopicToken::InvokerClientId => { &mut self.invoker_client_id }
            TopicToken::ServiceId => { &mut self.service_id }
            TopicToken::ExecutorId => { &mut self.executor_id }
            TopicToken::SenderId => { &mut self.sender_id }
            TopicToken::Name => { &mut self.name }
            TopicToken::TelemetryName => { &mut self.telemetry_name }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(TopicToken),
}

/// A parsed, validated topic format
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicFormat {
    format: String,
    segments: Vec<Segment>,
}

impl TopicFormat {

    /// Parses a topic format.  Fails with `InvalidArgument` if the format is empty, contains
    /// wildcards, has an unknown or unterminated token, or has a token that does not occupy a
    /// whole topic level.
    pub fn new(format: &str) -> GneissResult<TopicFormat> {
        if format.is_empty() {
            return Err(GneissError::new_invalid_argument("topic format must not be empty"));
        }

        let mut segments = Vec::new();
        let mut remaining = format;
        let mut at_level_start = true;

        while !remaining.is_empty() {
            match remaining.find('{') {
                Some(0) => {
                    if !at_level_start {
                        return Err(GneissError::new_invalid_argument(format!("token in topic format \"{}\" does not start a topic level", format)));
                    }

                    let close = remaining.find('}').ok_or_else(|| {
                        GneissError::new_invalid_argument(format!("unterminated token in topic format \"{}\"", format))
                    })?;

                    let name = &remaining[1..close];
                    let token = TopicToken::from_name(name).ok_or_else(|| {
                        GneissError::new_invalid_argument(format!("unknown token \"{}\" in topic format \"{}\"", name, format))
                    })?;

                    remaining = &remaining[close + 1..];
                    if !remaining.is_empty() && !remaining.starts_with('/') {
                        return Err(GneissError::new_invalid_argument(format!("token {} in topic format \"{}\" does not end a topic level", token, format)));
                    }

                    segments.push(Segment::Token(token));
                    at_level_start = false;
                }
                next => {
                    let literal_end = next.unwrap_or(remaining.len());
                    let literal = &remaining[..literal_end];
                    if literal.contains(['}', '+', '#']) {
                        return Err(GneissError::new_invalid_argument(format!("topic format \"{}\" contains an invalid character", format)));
                    }

                    at_level_start = literal.ends_with('/');
                    segments.push(Segment::Literal(literal.to_string()));
                    remaining = &remaining[literal_end..];
                }
            }
        }

        Ok(TopicFormat {
            format: format.to_string(),
            segments,
        })
    }

    /// Returns the unparsed format string
    pub fn as_str(&self) -> &str {
        &self.format
    }

    /// Returns true if the format contains the given token
    pub fn references(&self, token: TopicToken) -> bool {
        self.segments.iter().any(|segment| *segment == Segment::Token(token))
    }

    /// Computes the length of the topic [`build`](TopicFormat::build) would produce.  Fails with
    /// `InvalidArgument` if a referenced token has no value or an empty value.
    pub fn required_length(&self, tokens: &TopicTokens, service_group_id: Option<&str>) -> GneissResult<usize> {
        let mut length = 0;
        if let Some(group) = service_group_id {
            length += SERVICE_GROUP_PREFIX.len() + group.len() + 1;
        }

        for segment in self.segments.iter() {
            length += match segment {
                Segment::Literal(literal) => { literal.len() }
                Segment::Token(token) => { token_value(tokens, *token)?.len() }
            };
        }

        Ok(length)
    }

    /// Substitutes token values into the format, optionally prefixed by a shared subscription
    /// group.  The required length is computed first; if it exceeds `maximum_length` the call
    /// fails with `InsufficientBuffer` and nothing is built.
    pub fn build(&self, tokens: &TopicTokens, service_group_id: Option<&str>, maximum_length: usize) -> GneissResult<String> {
        let required_length = self.required_length(tokens, service_group_id)?;
        if required_length > maximum_length {
            return Err(GneissError::new_insufficient_buffer(required_length, maximum_length));
        }

        let mut topic = String::with_capacity(required_length);
        if let Some(group) = service_group_id {
            topic.push_str(SERVICE_GROUP_PREFIX);
            topic.push_str(group);
            topic.push('/');
        }

        for segment in self.segments.iter() {
            match segment {
                Segment::Literal(literal) => { topic.push_str(literal); }
                Segment::Token(token) => { topic.push_str(token_value(tokens, *token)?); }
            }
        }

        Ok(topic)
    }

    /// Builds a subscription topic filter, typically with [`SINGLE_LEVEL_WILDCARD`] for the
    /// tokens that vary.  Fails with `InvalidArgument` if the result is not a legal filter.
    pub fn build_filter(&self, tokens: &TopicTokens, service_group_id: Option<&str>) -> GneissResult<String> {
        let filter = self.build(tokens, service_group_id, MAXIMUM_TOPIC_LENGTH)?;
        if !is_valid_topic_filter(&filter) {
            return Err(GneissError::new_invalid_argument(format!("\"{}\" built from format \"{}\" is not a valid topic filter", filter, self.format)));
        }

        Ok(filter)
    }

    /// Matches a concrete topic against the format and returns the value of every token.  Each
    /// token consumes exactly one non-empty topic level.  Where `expected` supplies a value for a
    /// token the extracted value must equal it.  Any mismatch fails with `TopicNoMatch`.
    pub fn extract(&self, topic: &str, expected: &TopicTokens) -> GneissResult<TopicTokens> {
        let mut extracted = TopicTokens::new();
        let mut remaining = topic;

        for segment in self.segments.iter() {
            match segment {
                Segment::Literal(literal) => {
                    remaining = remaining.strip_prefix(literal.as_str()).ok_or_else(|| {
                        GneissError::new_topic_no_match(format!("topic \"{}\" does not match format \"{}\"", topic, self.format))
                    })?;
                }
                Segment::Token(token) => {
                    let level_end = remaining.find('/').unwrap_or(remaining.len());
                    let value = &remaining[..level_end];
                    if value.is_empty() {
                        return Err(GneissError::new_topic_no_match(format!("topic \"{}\" has an empty {} level", topic, token)));
                    }

                    if let Some(expected_value) = expected.get(*token) {
                        if expected_value != value {
                            return Err(GneissError::new_topic_no_match(format!("topic \"{}\" has {} \"{}\", expected \"{}\"", topic, token, value, expected_value)));
                        }
                    }

                    let slot = extracted.slot(*token);
                    if let Some(previous) = slot.as_deref() {
                        if previous != value {
                            return Err(GneissError::new_topic_no_match(format!("topic \"{}\" has conflicting values for {}", topic, token)));
                        }
                    }
                    *slot = Some(value.to_string());

                    remaining = &remaining[level_end..];
                }
            }
        }

        if !remaining.is_empty() {
            return Err(GneissError::new_topic_no_match(format!("topic \"{}\" is longer than format \"{}\"", topic, self.format)));
        }

        Ok(extracted)
    }
}

impl fmt::Display for TopicFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format)
    }
}

fn token_value(tokens: &TopicTokens, token: TopicToken) -> GneissResult<&str> {
    match tokens.get(token) {
        Some(value) if !value.is_empty() => { Ok(value) }
        _ => { Err(GneissError::new_invalid_argument(format!("no value supplied for token {}", token))) }
    }
}
