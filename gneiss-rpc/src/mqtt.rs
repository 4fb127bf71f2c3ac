/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
MQTT5 vocabulary shared between the state machines and the transport boundary: quality of
service, acknowledgement reason codes, the MQTT5 property bag, and topic/topic-filter helpers.
 */

use crate::error::{GneissError, GneissResult};

/// Packet identifier the transport assigns to an outbound publish, subscribe or unsubscribe.
pub type PacketId = u16;

/// Maximum length, in bytes, of an MQTT topic or string property.
pub const MAXIMUM_STRING_PROPERTY_LENGTH: usize = 65535;

/// MQTT message delivery quality of service.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901234) encoding values.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No response is sent by the
    /// receiver and no retry is performed by the sender. The message arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = GneissError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(QualityOfService::AtMostOnce) }
            1 => { Ok(QualityOfService::AtLeastOnce) }
            2 => { Ok(QualityOfService::ExactlyOnce) }
            _ => { Err(GneissError::new_invalid_argument(format!("invalid quality of service value: {}", value))) }
        }
    }
}

/// Server return code for connect attempts.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901079) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReasonCode {

    /// Returned when the connection is accepted.
    #[default]
    Success = 0,

    /// Returned when the server has a failure but does not want to specify a reason or none
    /// of the other reason codes apply.
    UnspecifiedError = 128,

    /// Returned when data in the CONNECT packet could not be correctly parsed by the server.
    MalformedPacket = 129,

    /// Returned when data in the CONNECT packet does not conform to the MQTT5 specification requirements.
    ProtocolError = 130,

    /// Returned when the CONNECT packet is valid but was not accepted by the server.
    ImplementationSpecificError = 131,

    /// Returned when the server does not support MQTT5 protocol version specified in the connection.
    UnsupportedProtocolVersion = 132,

    /// Returned when the client identifier in the CONNECT packet is a valid string but not one that
    /// is allowed on the server.
    ClientIdentifierNotValid = 133,

    /// Returned when the server does not accept the username and/or password specified by the client
    /// in the connection packet.
    BadUsernameOrPassword = 134,

    /// Returned when the client is not authorized to connect to the server.
    NotAuthorized = 135,

    /// Returned when the MQTT5 server is not available.
    ServerUnavailable = 136,

    /// Returned when the server is too busy to make a connection.
    ServerBusy = 137,

    /// Returned when the client has been banned from the server.
    Banned = 138,

    /// Returned when the authentication method used in the connection is either not supported on the server or it does
    /// not match the authentication method currently in use in the CONNECT packet.
    BadAuthenticationMethod = 140,

    /// Returned when the Will topic name is correctly formed, but is not accepted by the server.
    TopicNameInvalid = 144,

    /// Returned when the connection packet exceeded the maximum permissible size on the server.
    PacketTooLarge = 149,

    /// Returned when the quota limits set on the server have been met and/or exceeded.
    QuotaExceeded = 151,

    /// Returned when the Will payload does not match the specified payload format indicator.
    PayloadFormatInvalid = 153,

    /// Returned when the server does not retain messages but the Will requested retention.
    RetainNotSupported = 154,

    /// Returned when the server does not support the Will QOS.
    QosNotSupported = 155,

    /// Returned when the server tells the client to temporarily use another server.
    UseAnotherServer = 156,

    /// Returned when the server tells the client to permanently use another server.
    ServerMoved = 157,

    /// Returned when the server connection rate limit has been exceeded.
    ConnectionRateExceeded = 159,
}

impl ConnectReasonCode {
    /// Returns whether or not the reason code represents a successful connect
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectReasonCode::Success)
    }
}

impl TryFrom<u8> for ConnectReasonCode {
    type Error = GneissError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(ConnectReasonCode::Success) }
            128 => { Ok(ConnectReasonCode::UnspecifiedError) }
            129 => { Ok(ConnectReasonCode::MalformedPacket) }
            130 => { Ok(ConnectReasonCode::ProtocolError) }
            131 => { Ok(ConnectReasonCode::ImplementationSpecificError) }
            132 => { Ok(ConnectReasonCode::UnsupportedProtocolVersion) }
            133 => { Ok(ConnectReasonCode::ClientIdentifierNotValid) }
            134 => { Ok(ConnectReasonCode::BadUsernameOrPassword) }
            135 => { Ok(ConnectReasonCode::NotAuthorized) }
            136 => { Ok(ConnectReasonCode::ServerUnavailable) }
            137 => { Ok(ConnectReasonCode::ServerBusy) }
            138 => { Ok(ConnectReasonCode::Banned) }
            140 => { Ok(ConnectReasonCode::BadAuthenticationMethod) }
            144 => { Ok(ConnectReasonCode::TopicNameInvalid) }
            149 => { Ok(ConnectReasonCode::PacketTooLarge) }
            151 => { Ok(ConnectReasonCode::QuotaExceeded) }
            153 => { Ok(ConnectReasonCode::PayloadFormatInvalid) }
            154 => { Ok(ConnectReasonCode::RetainNotSupported) }
            155 => { Ok(ConnectReasonCode::QosNotSupported) }
            156 => { Ok(ConnectReasonCode::UseAnotherServer) }
            157 => { Ok(ConnectReasonCode::ServerMoved) }
            159 => { Ok(ConnectReasonCode::ConnectionRateExceeded) }
            _ => { Err(GneissError::new_invalid_argument(format!("invalid connect reason code: {}", value))) }
        }
    }
}

/// Reason code inside PUBACK packets that indicates the result of the associated PUBLISH request.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901124) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubackReasonCode {

    /// Returned when the (QoS 1) publish was accepted by the recipient.
    #[default]
    Success = 0,

    /// Returned when the (QoS 1) publish was accepted but there were no matching subscribers.
    NoMatchingSubscribers = 16,

    /// Returned when the (QoS 1) publish was not accepted and the receiver does not want to specify a reason.
    UnspecifiedError = 128,

    /// Returned when the (QoS 1) publish was valid but the receiver was not willing to accept it.
    ImplementationSpecificError = 131,

    /// Returned when the (QoS 1) publish was not authorized by the receiver.
    NotAuthorized = 135,

    /// Returned when the topic name was valid but the receiver was not willing to accept it.
    TopicNameInvalid = 144,

    /// Returned when the packet identifier used in the associated PUBLISH was already in use.
    PacketIdentifierInUse = 145,

    /// Returned when the associated PUBLISH failed because an internal quota on the recipient was exceeded.
    QuotaExceeded = 151,

    /// Returned when the PUBLISH packet's payload format did not match its payload format indicator property.
    PayloadFormatInvalid = 153,
}

impl PubackReasonCode {
    /// Returns whether or not the publish was delivered without any qualification.  Request and
    /// telemetry state machines treat every other code, including NoMatchingSubscribers, as a
    /// delivery failure.
    pub fn is_success(&self) -> bool {
        matches!(self, PubackReasonCode::Success)
    }
}

impl TryFrom<u8> for PubackReasonCode {
    type Error = GneissError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(PubackReasonCode::Success) }
            16 => { Ok(PubackReasonCode::NoMatchingSubscribers) }
            128 => { Ok(PubackReasonCode::UnspecifiedError) }
            131 => { Ok(PubackReasonCode::ImplementationSpecificError) }
            135 => { Ok(PubackReasonCode::NotAuthorized) }
            144 => { Ok(PubackReasonCode::TopicNameInvalid) }
            145 => { Ok(PubackReasonCode::PacketIdentifierInUse) }
            151 => { Ok(PubackReasonCode::QuotaExceeded) }
            153 => { Ok(PubackReasonCode::PayloadFormatInvalid) }
            _ => { Err(GneissError::new_invalid_argument(format!("invalid puback reason code: {}", value))) }
        }
    }
}

/// Reason code inside SUBACK packet payloads.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901178) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubackReasonCode {

    /// Returned when the subscription was accepted and the maximum QoS sent will be QoS 0.
    #[default]
    GrantedQos0 = 0,

    /// Returned when the subscription was accepted and the maximum QoS sent will be QoS 1.
    GrantedQos1 = 1,

    /// Returned when the subscription was accepted and the maximum QoS sent will be QoS 2.
    GrantedQos2 = 2,

    /// Returned when the connection was closed but the subscription was not accepted.
    UnspecifiedError = 128,

    /// Returned when the subscription was valid but the server did not accept it.
    ImplementationSpecificError = 131,

    /// Returned when the client was not authorized to make the subscription on the server.
    NotAuthorized = 135,

    /// Returned when the subscription topic filter was correctly formed but not allowed for the client.
    TopicFilterInvalid = 143,

    /// Returned when the packet identifier was already in use on the server.
    PacketIdentifierInUse = 145,

    /// Returned when a subscribe-related quota set on the server was exceeded.
    QuotaExceeded = 151,

    /// Returned when the subscription's topic filter was a shared subscription and the server does not support
    /// shared subscriptions.
    SharedSubscriptionsNotSupported = 158,

    /// Returned when the SUBSCRIBE packet contained a subscription identifier and the server does not support
    /// subscription identifiers.
    SubscriptionIdentifiersNotSupported = 161,

    /// Returned when the subscription's topic filter contains a wildcard but the server does not support
    /// wildcard subscriptions.
    WildcardSubscriptionsNotSupported = 162,
}

impl SubackReasonCode {
    /// Returns whether or not the reason code grants the subscription
    pub fn is_success(&self) -> bool {
        matches!(self, SubackReasonCode::GrantedQos0 | SubackReasonCode::GrantedQos1 | SubackReasonCode::GrantedQos2)
    }
}

impl TryFrom<u8> for SubackReasonCode {
    type Error = GneissError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(SubackReasonCode::GrantedQos0) }
            1 => { Ok(SubackReasonCode::GrantedQos1) }
            2 => { Ok(SubackReasonCode::GrantedQos2) }
            128 => { Ok(SubackReasonCode::UnspecifiedError) }
            131 => { Ok(SubackReasonCode::ImplementationSpecificError) }
            135 => { Ok(SubackReasonCode::NotAuthorized) }
            143 => { Ok(SubackReasonCode::TopicFilterInvalid) }
            145 => { Ok(SubackReasonCode::PacketIdentifierInUse) }
            151 => { Ok(SubackReasonCode::QuotaExceeded) }
            158 => { Ok(SubackReasonCode::SharedSubscriptionsNotSupported) }
            161 => { Ok(SubackReasonCode::SubscriptionIdentifiersNotSupported) }
            162 => { Ok(SubackReasonCode::WildcardSubscriptionsNotSupported) }
            _ => { Err(GneissError::new_invalid_argument(format!("invalid suback reason code: {}", value))) }
        }
    }
}

/// Reason codes inside UNSUBACK packet payloads.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901194) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UnsubackReasonCode {

    /// Returned when the unsubscribe was successful and the client had a subscription.
    #[default]
    Success = 0,

    /// Returned when the topic filter did not match one of the client's existing subscriptions on the server.
    NoSubscriptionExisted = 17,

    /// Returned when the unsubscribe could not be completed and the server did not specify why.
    UnspecifiedError = 128,

    /// Returned when the unsubscribe was valid but the server did not accept it.
    ImplementationSpecificError = 131,

    /// Returned when the client was not authorized to unsubscribe from that topic filter on the server.
    NotAuthorized = 135,

    /// Returned when the topic filter was correctly formed but is not allowed for the client on the server.
    TopicFilterInvalid = 143,

    /// Returned when the packet identifier was already in use on the server.
    PacketIdentifierInUse = 145,
}

impl UnsubackReasonCode {
    /// Returns whether or not the reason code represents a completed unsubscribe
    pub fn is_success(&self) -> bool {
        matches!(self, UnsubackReasonCode::Success | UnsubackReasonCode::NoSubscriptionExisted)
    }
}

/// Reason code that explains why a connection was closed, as reported by the transport.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901208) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DisconnectReasonCode {

    /// Close the connection normally. Do not send the Will Message.
    #[default]
    NormalDisconnection = 0,

    /// The client wishes to disconnect but requires that the server also publishes its Will Message.
    DisconnectWithWillMessage = 4,

    /// The connection is closed but the sender either does not wish to reveal why or none of the other reason codes apply.
    UnspecifiedError = 128,

    /// The received packet does not conform to the MQTT5 specification.
    MalformedPacket = 129,

    /// An unexpected or out-of-order packet was received.
    ProtocolError = 130,

    /// The packet received is valid but cannot be processed by this implementation.
    ImplementationSpecificError = 131,

    /// The request is not authorized.
    NotAuthorized = 135,

    /// The server is busy and cannot continue processing requests from this client.
    ServerBusy = 137,

    /// The server is shutting down.
    ServerShuttingDown = 139,

    /// The connection is closed because no packet has been received for 1.5 times the keepalive time.
    KeepAliveTimeout = 141,

    /// Another connection using the same client id has connected causing this connection to be closed.
    SessionTakenOver = 142,

    /// The server has exceeded a quota.
    QuotaExceeded = 151,

    /// The connection is closed due to an administrative action.
    AdministrativeAction = 152,

    /// The client should temporarily change its server.
    UseAnotherServer = 156,

    /// The server is moved and the client should permanently change its server location.
    ServerMoved = 157,

    /// The connection rate limit has been exceeded.
    ConnectionRateExceeded = 159,
}

/// MQTT5 user property
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserProperty {

    /// User property name
    pub name: String,

    /// User property value
    pub value: String,
}

impl UserProperty {

    /// Creates a new user property from a name-value pair
    pub fn new(name: &str, value: &str) -> Self {
        UserProperty {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// The closed set of MQTT5 property kinds a property bag carries.
///
/// Enum values match MQTT5 property identifiers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PropertyType {

    /// Payload format indicator (byte)
    PayloadFormatIndicator = 1,

    /// Message expiry interval in seconds (four byte integer)
    MessageExpiryInterval = 2,

    /// Content type, usually a UTF-8 MIME type (string)
    ContentType = 3,

    /// Response topic (string)
    ResponseTopic = 8,

    /// Correlation data (binary)
    CorrelationData = 9,

    /// User property (string pair)
    UserProperty = 38,
}

/// A single value stored in a property bag
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PropertyValue {

    /// Single byte value
    Byte(u8),

    /// Four byte integer value
    Int(u32),

    /// UTF-8 string value
    String(String),

    /// UTF-8 name-value pair
    StringPair(UserProperty),

    /// Binary data value
    Binary(Vec<u8>),
}

/// An ordered multimap of MQTT5 properties attached to outbound and inbound publishes.
///
/// RPC and telemetry sub-clients own one bag each and reuse it for every publish, clearing it
/// afterwards.  Values are checked against their property type on append; reads of a missing
/// property fail with `ItemNotFound`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PropertyBag {
    properties: Vec<(PropertyType, PropertyValue)>,
}

impl PropertyBag {

    /// Creates a new, empty property bag
    pub fn new() -> Self {
        PropertyBag {
            properties: Vec::new(),
        }
    }

    /// Appends a string-valued property (content type, response topic)
    pub fn append_string(&mut self, property_type: PropertyType, value: &str) -> GneissResult<()> {
        match property_type {
            PropertyType::ContentType | PropertyType::ResponseTopic => {}
            _ => { return Err(GneissError::new_invalid_argument(format!("{:?} is not a string property", property_type))); }
        }

        check_string_length(value)?;
        self.properties.push((property_type, PropertyValue::String(value.to_string())));
        Ok(())
    }

    /// Appends a user property name-value pair
    pub fn append_string_pair(&mut self, property_type: PropertyType, name: &str, value: &str) -> GneissResult<()> {
        if property_type != PropertyType::UserProperty {
            return Err(GneissError::new_invalid_argument(format!("{:?} is not a string pair property", property_type)));
        }

        check_string_length(name)?;
        check_string_length(value)?;
        self.properties.push((property_type, PropertyValue::StringPair(UserProperty::new(name, value))));
        Ok(())
    }

    /// Appends a byte-valued property (payload format indicator)
    pub fn append_byte(&mut self, property_type: PropertyType, value: u8) -> GneissResult<()> {
        if property_type != PropertyType::PayloadFormatIndicator {
            return Err(GneissError::new_invalid_argument(format!("{:?} is not a byte property", property_type)));
        }

        self.properties.push((property_type, PropertyValue::Byte(value)));
        Ok(())
    }

    /// Appends an integer-valued property (message expiry interval)
    pub fn append_int(&mut self, property_type: PropertyType, value: u32) -> GneissResult<()> {
        if property_type != PropertyType::MessageExpiryInterval {
            return Err(GneissError::new_invalid_argument(format!("{:?} is not an integer property", property_type)));
        }

        self.properties.push((property_type, PropertyValue::Int(value)));
        Ok(())
    }

    /// Appends a binary-valued property (correlation data)
    pub fn append_binary(&mut self, property_type: PropertyType, value: &[u8]) -> GneissResult<()> {
        if property_type != PropertyType::CorrelationData {
            return Err(GneissError::new_invalid_argument(format!("{:?} is not a binary property", property_type)));
        }

        if value.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
            return Err(GneissError::new_insufficient_buffer(value.len(), MAXIMUM_STRING_PROPERTY_LENGTH));
        }

        self.properties.push((property_type, PropertyValue::Binary(value.to_vec())));
        Ok(())
    }

    /// Reads the first string-valued property of the given type
    pub fn read_string(&self, property_type: PropertyType) -> GneissResult<&str> {
        self.properties.iter().find_map(|(kind, value)| {
            match value {
                PropertyValue::String(s) if *kind == property_type => { Some(s.as_str()) }
                _ => { None }
            }
        }).ok_or_else(|| GneissError::new_item_not_found(format!("no {:?} property present", property_type)))
    }

    /// Reads the value of the first user property with the given name
    pub fn read_string_pair(&self, property_type: PropertyType, name: &str) -> GneissResult<&str> {
        self.properties.iter().find_map(|(kind, value)| {
            match value {
                PropertyValue::StringPair(pair) if *kind == property_type && pair.name == name => { Some(pair.value.as_str()) }
                _ => { None }
            }
        }).ok_or_else(|| GneissError::new_item_not_found(format!("no user property named \"{}\" present", name)))
    }

    /// Reads the first byte-valued property of the given type
    pub fn read_byte(&self, property_type: PropertyType) -> GneissResult<u8> {
        self.properties.iter().find_map(|(kind, value)| {
            match value {
                PropertyValue::Byte(b) if *kind == property_type => { Some(*b) }
                _ => { None }
            }
        }).ok_or_else(|| GneissError::new_item_not_found(format!("no {:?} property present", property_type)))
    }

    /// Reads the first integer-valued property of the given type
    pub fn read_int(&self, property_type: PropertyType) -> GneissResult<u32> {
        self.properties.iter().find_map(|(kind, value)| {
            match value {
                PropertyValue::Int(i) if *kind == property_type => { Some(*i) }
                _ => { None }
            }
        }).ok_or_else(|| GneissError::new_item_not_found(format!("no {:?} property present", property_type)))
    }

    /// Reads the first binary-valued property of the given type
    pub fn read_binary(&self, property_type: PropertyType) -> GneissResult<&[u8]> {
        self.properties.iter().find_map(|(kind, value)| {
            match value {
                PropertyValue::Binary(b) if *kind == property_type => { Some(b.as_slice()) }
                _ => { None }
            }
        }).ok_or_else(|| GneissError::new_item_not_found(format!("no {:?} property present", property_type)))
    }

    /// Iterates over every user property in insertion order
    pub fn user_properties(&self) -> impl Iterator<Item = &UserProperty> {
        self.properties.iter().filter_map(|(_, value)| {
            match value {
                PropertyValue::StringPair(pair) => { Some(pair) }
                _ => { None }
            }
        })
    }

    /// Iterates over every property in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (PropertyType, &PropertyValue)> {
        self.properties.iter().map(|(kind, value)| (*kind, value))
    }

    /// Removes every property so the bag can be reused
    pub fn clear(&mut self) {
        self.properties.clear();
    }

    /// Returns the number of properties in the bag
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Returns true if the bag holds no properties
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

fn check_string_length(value: &str) -> GneissResult<()> {
    if value.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        return Err(GneissError::new_insufficient_buffer(value.len(), MAXIMUM_STRING_PROPERTY_LENGTH));
    }

    Ok(())
}

/// Returns true if the topic is a legal publish topic: non-empty, bounded, wildcard-free.
pub fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        return false;
    }

    if topic.contains(['#', '+']) {
        return false;
    }

    true
}

/// Returns true if the topic filter is legal: wildcards occupy whole levels and a multi-level
/// wildcard, if present, is the final level.
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        return false;
    }

    let mut seen_mlw = false;
    for segment in filter.split('/') {
        if seen_mlw {
            return false;
        }

        if segment.len() == 1 {
            if segment == "#" {
                seen_mlw = true;
            }
        } else if segment.contains(['#', '+']) {
            return false;
        }
    }

    true
}

// strips a "$share/<group>/" prefix; shared subscriptions match on the remainder
fn strip_shared_subscription_prefix(filter: &str) -> &str {
    if let Some(remainder) = filter.strip_prefix("$share/") {
        if let Some(separator) = remainder.find('/') {
            return &remainder[separator + 1..];
        }
    }

    filter
}

/// Returns true if a concrete publish topic matches a subscription topic filter.
///
/// `+` matches exactly one level, `#` matches the parent level and everything below it, and
/// topics beginning with `$` are never matched by a leading wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if !is_valid_topic(topic) || !is_valid_topic_filter(filter) {
        return false;
    }

    let filter = strip_shared_subscription_prefix(filter);
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => { return true; }
            (Some("+"), Some(_)) => {}
            (Some(filter_level), Some(topic_level)) => {
                if filter_level != topic_level {
                    return false;
                }
            }
            (None, None) => { return true; }
            _ => { return false; }
        }
    }
}
