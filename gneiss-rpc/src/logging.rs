/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Observer-based logging.  A connection never writes to a process-wide logger on its own; every
message goes through the [`EventObserver`] supplied at construction.  [`LogObserver`] forwards to
the `log` facade and is the default.
 */

use crate::mqtt::*;

use std::fmt;
use std::fmt::Write;

/// Classification of the component that produced a log message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Component {

    /// Event pipeline and timer facility
    Pipeline,

    /// Connection state machine
    Connection,

    /// Correlation-tracked request state machine
    Request,

    /// RPC client state machine
    RpcClient,

    /// RPC server state machine
    RpcServer,

    /// Telemetry producer state machine
    TelemetryProducer,

    /// Telemetry consumer state machine
    TelemetryConsumer,
}

impl Component {

    /// Log target used when forwarding messages from this component to the `log` facade
    pub fn target(&self) -> &'static str {
        match self {
            Component::Pipeline => { "gneiss_rpc::pipeline" }
            Component::Connection => { "gneiss_rpc::connection" }
            Component::Request => { "gneiss_rpc::request" }
            Component::RpcClient => { "gneiss_rpc::rpc_client" }
            Component::RpcServer => { "gneiss_rpc::rpc_server" }
            Component::TelemetryProducer => { "gneiss_rpc::telemetry" }
            Component::TelemetryConsumer => { "gneiss_rpc::telemetry_consumer" }
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Pipeline => { write!(f, "Pipeline") }
            Component::Connection => { write!(f, "Connection") }
            Component::Request => { write!(f, "Request") }
            Component::RpcClient => { write!(f, "RpcClient") }
            Component::RpcServer => { write!(f, "RpcServer") }
            Component::TelemetryProducer => { write!(f, "TelemetryProducer") }
            Component::TelemetryConsumer => { write!(f, "TelemetryConsumer") }
        }
    }
}

/// Sink for diagnostic messages produced by the state machines of a connection.
///
/// `enabled` is consulted before any message is formatted, so a disabled observer costs nothing
/// beyond the call.
pub trait EventObserver : Send + Sync {

    /// Returns whether messages at the given level from the given component should be produced
    fn enabled(&self, level: log::Level, component: Component) -> bool;

    /// Receives a single formatted message
    fn observe(&self, level: log::Level, component: Component, message: fmt::Arguments<'_>);
}

/// Observer that forwards every message to the `log` crate, one target per component.
#[derive(Default, Debug, Clone, Copy)]
pub struct LogObserver {}

impl EventObserver for LogObserver {
    fn enabled(&self, level: log::Level, component: Component) -> bool {
        log::log_enabled!(target: component.target(), level)
    }

    fn observe(&self, level: log::Level, component: Component, message: fmt::Arguments<'_>) {
        log::log!(target: component.target(), level, "{}", message);
    }
}

/// Observer that discards everything.
#[derive(Default, Debug, Clone, Copy)]
pub struct NullObserver {}

impl EventObserver for NullObserver {
    fn enabled(&self, _: log::Level, _: Component) -> bool {
        false
    }

    fn observe(&self, _: log::Level, _: Component, _: fmt::Arguments<'_>) {}
}

macro_rules! observe_at_level {
    ($observer: expr, $level: expr, $component: expr, $($arg:tt)+) => {
        if $observer.enabled($level, $component) {
            $observer.observe($level, $component, format_args!($($arg)+));
        }
    };
}

pub(crate) use observe_at_level;

macro_rules! observe_debug {
    ($observer: expr, $component: expr, $($arg:tt)+) => {
        crate::logging::observe_at_level!($observer, log::Level::Debug, $component, $($arg)+)
    };
}

pub(crate) use observe_debug;

macro_rules! observe_info {
    ($observer: expr, $component: expr, $($arg:tt)+) => {
        crate::logging::observe_at_level!($observer, log::Level::Info, $component, $($arg)+)
    };
}

pub(crate) use observe_info;

macro_rules! observe_warn {
    ($observer: expr, $component: expr, $($arg:tt)+) => {
        crate::logging::observe_at_level!($observer, log::Level::Warn, $component, $($arg)+)
    };
}

pub(crate) use observe_warn;

macro_rules! observe_error {
    ($observer: expr, $component: expr, $($arg:tt)+) => {
        crate::logging::observe_at_level!($observer, log::Level::Error, $component, $($arg)+)
    };
}

pub(crate) use observe_error;

impl fmt::Display for UserProperty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(\"{}\",\"{}\")", self.name, self.value)
    }
}

impl fmt::Display for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (property_type, value) in self.iter() {
            match value {
                PropertyValue::Byte(b) => { write!(f, " {:?}:{}", property_type, b)?; }
                PropertyValue::Int(i) => { write!(f, " {:?}:{}", property_type, i)?; }
                PropertyValue::String(s) => { write!(f, " {:?}:\"{}\"", property_type, s)?; }
                PropertyValue::StringPair(pair) => { write!(f, " {:?}:{}", property_type, pair)?; }
                PropertyValue::Binary(data) => { write!(f, " {:?}:<{} Bytes>", property_type, data.len())?; }
            }
        }
        write!(f, " ]")
    }
}

pub(crate) fn create_binary_log_string(data: &[u8]) -> String {
    let mut val = String::with_capacity(data.len() * 2);
    for byte in data {
        write!(&mut val, "{:02x}", byte).ok();
    }
    val
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingObserver;

    #[test]
    fn macros_respect_enabled_level() {
        let observer = RecordingObserver::new(log::Level::Info);

        observe_debug!(observer, Component::Request, "dropped {}", 1);
        observe_info!(observer, Component::Connection, "entered {}", "idle");
        observe_error!(observer, Component::RpcServer, "faulted");

        assert_eq!(vec!["Connection - entered idle".to_string(), "RpcServer - faulted".to_string()], observer.messages());
    }

    #[test]
    fn property_bag_display() {
        let mut bag = PropertyBag::new();
        bag.append_string(PropertyType::ContentType, "application/json").unwrap();
        bag.append_binary(PropertyType::CorrelationData, &[1, 2]).unwrap();
        bag.append_string_pair(PropertyType::UserProperty, "status", "200").unwrap();

        assert_eq!("[ ContentType:\"application/json\" CorrelationData:<2 Bytes> UserProperty:(\"status\",\"200\") ]", bag.to_string());
        assert_eq!("0aff", create_binary_log_string(&[10, 255]));
    }
}
