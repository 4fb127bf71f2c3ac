/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing types for configuring a connection and the RPC and telemetry sub-clients
attached to it.
 */

use crate::error::{GneissError, GneissResult};
use crate::logging::{EventObserver, LogObserver};
use crate::mqtt::ConnectReasonCode;
use crate::retry::{default_retry_delay, RetryDelayFn};
use crate::rpc::topic::*;

use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Default port for MQTT over TLS
pub const DEFAULT_MQTT_PORT : u16 = 8883;

/// Default timeout for RPC and telemetry publishes, subscribes and executions
pub const DEFAULT_RPC_TIMEOUT : Duration = Duration::from_secs(10);

/// Default maximum number of outstanding RPC invocations per client
pub const DEFAULT_MAX_PENDING_REQUESTS : usize = 5;

/// An X.509 certificate and private key pair used to authenticate a connect attempt
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClientCertificate {

    /// PEM- or DER-encoded certificate
    pub certificate: Vec<u8>,

    /// PEM- or DER-encoded private key
    pub private_key: Vec<u8>,
}

impl ClientCertificate {

    /// Creates a certificate/key pair from in-memory encodings
    pub fn new(certificate: &[u8], private_key: &[u8]) -> Self {
        ClientCertificate {
            certificate: certificate.to_vec(),
            private_key: private_key.to_vec(),
        }
    }
}

impl Debug for ClientCertificate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ClientCertificate {{ certificate: <{} Bytes>, private_key: <...redacted> }}", self.certificate.len())
    }
}

/// Predicate deciding whether a failed connect should rotate to the next client certificate
pub type CredentialSwapFn = fn(ConnectReasonCode) -> bool;

/// Default credential swap predicate: rotate on reason codes that suggest the presented
/// credentials were rejected.
pub fn default_credential_swap_condition(reason_code: ConnectReasonCode) -> bool {
    matches!(reason_code,
        ConnectReasonCode::UnspecifiedError |
        ConnectReasonCode::NotAuthorized |
        ConnectReasonCode::ServerBusy |
        ConnectReasonCode::Banned |
        ConnectReasonCode::BadAuthenticationMethod)
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct RetryOptions {
    pub(crate) min_retry_delay: Duration,
    pub(crate) max_retry_delay: Duration,
    pub(crate) max_random_jitter: Duration,
    pub(crate) max_connect_attempts: Option<u32>,
}

impl RetryOptions {
    pub(crate) fn normalize(&mut self) {
        if self.min_retry_delay > self.max_retry_delay {
            std::mem::swap(&mut self.min_retry_delay, &mut self.max_retry_delay)
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            min_retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_millis(100000),
            max_random_jitter: Duration::from_millis(5000),
            max_connect_attempts: None,
        }
    }
}

/// Configuration for a [`Connection`](crate::connection::Connection)
#[derive(Clone)]
pub struct ConnectionOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) client_id: String,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) client_certificates: Vec<ClientCertificate>,

    pub(crate) retry_options: RetryOptions,
    pub(crate) disconnect_timeout: Duration,

    pub(crate) retry_delay_fn: RetryDelayFn,
    pub(crate) credential_swap_fn: CredentialSwapFn,

    pub(crate) disable_connection_management: bool,

    pub(crate) observer: Arc<dyn EventObserver>,
}

impl Debug for ConnectionOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionOptions {{ ")?;
        write!(f, "host: {:?}, ", self.host)?;
        write!(f, "port: {}, ", self.port)?;
        write!(f, "client_id: {:?}, ", self.client_id)?;
        write!(f, "username: {:?}, ", self.username)?;
        if self.password.is_some() {
            write!(f, "password: <...redacted>, ")?;
        }
        write!(f, "client_certificates: {:?}, ", self.client_certificates)?;
        write!(f, "retry_options: {:?}, ", self.retry_options)?;
        write!(f, "disconnect_timeout: {:?}, ", self.disconnect_timeout)?;
        write!(f, "disable_connection_management: {}, ", self.disable_connection_management)?;
        write!(f, "}}")
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            host: String::new(),
            port: DEFAULT_MQTT_PORT,
            client_id: String::new(),
            username: None,
            password: None,
            client_certificates: Vec::new(),
            retry_options: RetryOptions::default(),
            disconnect_timeout: Duration::from_secs(5),
            retry_delay_fn: default_retry_delay,
            credential_swap_fn: default_credential_swap_condition,
            disable_connection_management: false,
            observer: Arc::new(LogObserver::default()),
        }
    }
}

/// Builder type for [`ConnectionOptions`]
#[derive(Debug, Default)]
pub struct ConnectionOptionsBuilder {
    options: ConnectionOptions
}

impl ConnectionOptionsBuilder {

    /// Creates a new builder targeting the given endpoint
    pub fn new(host: &str, client_id: &str) -> Self {
        ConnectionOptionsBuilder {
            options: ConnectionOptions {
                host: host.to_string(),
                client_id: client_id.to_string(),
                ..Default::default()
            }
        }
    }

    /// Sets the endpoint port.  Defaults to 8883.
    pub fn with_port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Sets the username presented on connect
    pub fn with_username(mut self, username: &str) -> Self {
        self.options.username = Some(username.to_string());
        self
    }

    /// Sets the password presented on connect
    pub fn with_password(mut self, password: &[u8]) -> Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Adds a client certificate to the rotation list.  Connect attempts use the certificates in
    /// the order they were added.
    pub fn with_client_certificate(mut self, certificate: ClientCertificate) -> Self {
        self.options.client_certificates.push(certificate);
        self
    }

    /// Sets the reconnect delay used after the first failed attempt
    pub fn with_min_retry_delay(mut self, min_retry_delay: Duration) -> Self {
        self.options.retry_options.min_retry_delay = min_retry_delay;
        self
    }

    /// Sets the upper bound on the reconnect delay
    pub fn with_max_retry_delay(mut self, max_retry_delay: Duration) -> Self {
        self.options.retry_options.max_retry_delay = max_retry_delay;
        self
    }

    /// Sets the upper bound (exclusive) of the random component added to each reconnect delay
    pub fn with_max_random_jitter(mut self, max_random_jitter: Duration) -> Self {
        self.options.retry_options.max_random_jitter = max_random_jitter;
        self
    }

    /// Limits the number of consecutive failed connect attempts before the connection faults.
    /// Unlimited by default.
    pub fn with_max_connect_attempts(mut self, max_connect_attempts: u32) -> Self {
        self.options.retry_options.max_connect_attempts = Some(max_connect_attempts);
        self
    }

    /// Sets how long a close request waits for the transport to report the disconnect
    pub fn with_disconnect_timeout(mut self, disconnect_timeout: Duration) -> Self {
        self.options.disconnect_timeout = disconnect_timeout;
        self
    }

    /// Replaces the reconnect delay function
    pub fn with_retry_delay_fn(mut self, retry_delay_fn: RetryDelayFn) -> Self {
        self.options.retry_delay_fn = retry_delay_fn;
        self
    }

    /// Replaces the predicate deciding when to rotate client certificates
    pub fn with_credential_swap_fn(mut self, credential_swap_fn: CredentialSwapFn) -> Self {
        self.options.credential_swap_fn = credential_swap_fn;
        self
    }

    /// Bypasses the connection state machine: open and close map directly onto transport calls
    /// and no reconnects are attempted.
    pub fn with_connection_management_disabled(mut self) -> Self {
        self.options.disable_connection_management = true;
        self
    }

    /// Sets the observer that receives all diagnostic output.  Defaults to [`LogObserver`].
    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.options.observer = observer;
        self
    }

    /// Validates and builds the options
    pub fn build(self) -> GneissResult<ConnectionOptions> {
        let mut options = self.options;
        options.retry_options.normalize();

        if options.host.is_empty() {
            return Err(GneissError::new_invalid_argument("host must not be empty"));
        }

        if options.client_id.is_empty() {
            return Err(GneissError::new_invalid_argument("client id must not be empty"));
        }

        check_timeout(options.disconnect_timeout, "disconnect timeout")?;

        Ok(options)
    }
}

fn check_timeout(timeout: Duration, name: &str) -> GneissResult<()> {
    if timeout.is_zero() {
        return Err(GneissError::new_invalid_argument(format!("{} must be greater than zero", name)));
    }

    Ok(())
}

fn check_identifier(value: &str, name: &str) -> GneissResult<()> {
    if value.is_empty() {
        return Err(GneissError::new_invalid_argument(format!("{} must not be empty", name)));
    }

    Ok(())
}

fn check_service_group_id(service_group_id: Option<&str>) -> GneissResult<()> {
    if let Some(group) = service_group_id {
        if group.is_empty() || group.contains(['/', '+', '#']) {
            return Err(GneissError::new_invalid_argument("service group id must be a single non-wildcard topic level"));
        }
    }

    Ok(())
}

/// Configuration for an RPC client
#[derive(Clone, Debug)]
pub struct RpcClientOptions {
    pub(crate) client_id: String,
    pub(crate) model_id: String,
    pub(crate) request_topic_format: String,
    pub(crate) response_topic_format: String,
    pub(crate) subscribe_timeout: Duration,
    pub(crate) publish_timeout: Duration,
    pub(crate) execution_timeout: Duration,
    pub(crate) max_pending_requests: usize,
}

/// Builder type for [`RpcClientOptions`]
#[derive(Debug)]
pub struct RpcClientOptionsBuilder {
    options: RpcClientOptions
}

impl RpcClientOptionsBuilder {

    /// Creates a new builder.  `client_id` fills the `{invokerClientId}` token and `model_id`
    /// fills `{serviceId}`.
    pub fn new(client_id: &str, model_id: &str) -> Self {
        RpcClientOptionsBuilder {
            options: RpcClientOptions {
                client_id: client_id.to_string(),
                model_id: model_id.to_string(),
                request_topic_format: DEFAULT_REQUEST_TOPIC_FORMAT.to_string(),
                response_topic_format: DEFAULT_RESPONSE_TOPIC_FORMAT.to_string(),
                subscribe_timeout: DEFAULT_RPC_TIMEOUT,
                publish_timeout: DEFAULT_RPC_TIMEOUT,
                execution_timeout: DEFAULT_RPC_TIMEOUT,
                max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            }
        }
    }

    /// Sets the topic format requests are published to
    pub fn with_request_topic_format(mut self, format: &str) -> Self {
        self.options.request_topic_format = format.to_string();
        self
    }

    /// Sets the topic format responses are received on
    pub fn with_response_topic_format(mut self, format: &str) -> Self {
        self.options.response_topic_format = format.to_string();
        self
    }

    /// Sets how long to wait for the response subscription to be acknowledged
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.options.subscribe_timeout = timeout;
        self
    }

    /// Sets how long to wait for a request publish to be acknowledged
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.options.publish_timeout = timeout;
        self
    }

    /// Sets the default time allowed for a command to complete
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.options.execution_timeout = timeout;
        self
    }

    /// Sets the maximum number of outstanding invocations
    pub fn with_max_pending_requests(mut self, max_pending_requests: usize) -> Self {
        self.options.max_pending_requests = max_pending_requests;
        self
    }

    /// Validates and builds the options
    pub fn build(self) -> GneissResult<RpcClientOptions> {
        let options = self.options;
        check_identifier(&options.client_id, "client id")?;
        check_identifier(&options.model_id, "model id")?;
        check_timeout(options.subscribe_timeout, "subscribe timeout")?;
        check_timeout(options.publish_timeout, "publish timeout")?;
        check_timeout(options.execution_timeout, "execution timeout")?;
        if options.max_pending_requests == 0 {
            return Err(GneissError::new_invalid_argument("max pending requests must be greater than zero"));
        }

        TopicFormat::new(&options.request_topic_format)?;
        TopicFormat::new(&options.response_topic_format)?;

        Ok(options)
    }
}

/// Configuration for an RPC server
#[derive(Clone, Debug)]
pub struct RpcServerOptions {
    pub(crate) client_id: String,
    pub(crate) model_id: String,
    pub(crate) request_topic_format: String,
    pub(crate) service_group_id: Option<String>,
    pub(crate) execution_timeout: Duration,
}

/// Builder type for [`RpcServerOptions`]
#[derive(Debug)]
pub struct RpcServerOptionsBuilder {
    options: RpcServerOptions
}

impl RpcServerOptionsBuilder {

    /// Creates a new builder.  `client_id` fills the `{executorId}` token of the subscription
    /// and `model_id` fills `{serviceId}`.
    pub fn new(client_id: &str, model_id: &str) -> Self {
        RpcServerOptionsBuilder {
            options: RpcServerOptions {
                client_id: client_id.to_string(),
                model_id: model_id.to_string(),
                request_topic_format: DEFAULT_REQUEST_TOPIC_FORMAT.to_string(),
                service_group_id: None,
                execution_timeout: DEFAULT_RPC_TIMEOUT,
            }
        }
    }

    /// Sets the topic format requests arrive on
    pub fn with_request_topic_format(mut self, format: &str) -> Self {
        self.options.request_topic_format = format.to_string();
        self
    }

    /// Subscribes through a shared subscription group so requests are load balanced across
    /// servers in the group
    pub fn with_service_group_id(mut self, service_group_id: &str) -> Self {
        self.options.service_group_id = Some(service_group_id.to_string());
        self
    }

    /// Sets how long the application may take to answer a request before the server answers
    /// with a timeout status on its behalf
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.options.execution_timeout = timeout;
        self
    }

    /// Validates and builds the options
    pub fn build(self) -> GneissResult<RpcServerOptions> {
        let options = self.options;
        check_identifier(&options.client_id, "client id")?;
        check_identifier(&options.model_id, "model id")?;
        check_timeout(options.execution_timeout, "execution timeout")?;
        check_service_group_id(options.service_group_id.as_deref())?;

        TopicFormat::new(&options.request_topic_format)?;

        Ok(options)
    }
}

/// Configuration for a telemetry producer
#[derive(Clone, Debug)]
pub struct TelemetryProducerOptions {
    pub(crate) client_id: String,
    pub(crate) model_id: String,
    pub(crate) topic_format: String,
    pub(crate) publish_timeout: Duration,
}

/// Builder type for [`TelemetryProducerOptions`]
#[derive(Debug)]
pub struct TelemetryProducerOptionsBuilder {
    options: TelemetryProducerOptions
}

impl TelemetryProducerOptionsBuilder {

    /// Creates a new builder.  `client_id` fills the `{senderId}` token and `model_id` fills
    /// `{serviceId}`.
    pub fn new(client_id: &str, model_id: &str) -> Self {
        TelemetryProducerOptionsBuilder {
            options: TelemetryProducerOptions {
                client_id: client_id.to_string(),
                model_id: model_id.to_string(),
                topic_format: DEFAULT_TELEMETRY_TOPIC_FORMAT.to_string(),
                publish_timeout: DEFAULT_RPC_TIMEOUT,
            }
        }
    }

    /// Sets the topic format telemetry is published to
    pub fn with_topic_format(mut self, format: &str) -> Self {
        self.options.topic_format = format.to_string();
        self
    }

    /// Sets how long to wait for a QoS 1 telemetry publish to be acknowledged
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.options.publish_timeout = timeout;
        self
    }

    /// Validates and builds the options
    pub fn build(self) -> GneissResult<TelemetryProducerOptions> {
        let options = self.options;
        check_identifier(&options.client_id, "client id")?;
        check_identifier(&options.model_id, "model id")?;
        check_timeout(options.publish_timeout, "publish timeout")?;

        TopicFormat::new(&options.topic_format)?;

        Ok(options)
    }
}

/// Configuration for a telemetry consumer
#[derive(Clone, Debug)]
pub struct TelemetryConsumerOptions {
    pub(crate) model_id: String,
    pub(crate) sender_id: Option<String>,
    pub(crate) topic_format: String,
    pub(crate) service_group_id: Option<String>,
    pub(crate) subscribe_timeout: Duration,
}

/// Builder type for [`TelemetryConsumerOptions`]
#[derive(Debug)]
pub struct TelemetryConsumerOptionsBuilder {
    options: TelemetryConsumerOptions
}

impl TelemetryConsumerOptionsBuilder {

    /// Creates a new builder that consumes the telemetry of every sender.  `model_id` fills
    /// `{serviceId}`.
    pub fn new(model_id: &str) -> Self {
        TelemetryConsumerOptionsBuilder {
            options: TelemetryConsumerOptions {
                model_id: model_id.to_string(),
                sender_id: None,
                topic_format: DEFAULT_TELEMETRY_TOPIC_FORMAT.to_string(),
                service_group_id: None,
                subscribe_timeout: DEFAULT_RPC_TIMEOUT,
            }
        }
    }

    /// Restricts the consumer to the telemetry of a single sender
    pub fn with_sender_id(mut self, sender_id: &str) -> Self {
        self.options.sender_id = Some(sender_id.to_string());
        self
    }

    /// Sets the topic format telemetry is received on
    pub fn with_topic_format(mut self, format: &str) -> Self {
        self.options.topic_format = format.to_string();
        self
    }

    /// Subscribes through a shared subscription group so telemetry is load balanced across
    /// consumers in the group
    pub fn with_service_group_id(mut self, service_group_id: &str) -> Self {
        self.options.service_group_id = Some(service_group_id.to_string());
        self
    }

    /// Sets how long to wait for the telemetry subscription to be acknowledged
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.options.subscribe_timeout = timeout;
        self
    }

    /// Validates and builds the options
    pub fn build(self) -> GneissResult<TelemetryConsumerOptions> {
        let options = self.options;
        check_identifier(&options.model_id, "model id")?;
        if let Some(sender_id) = &options.sender_id {
            check_identifier(sender_id, "sender id")?;
        }
        check_timeout(options.subscribe_timeout, "subscribe timeout")?;
        check_service_group_id(options.service_group_id.as_deref())?;

        TopicFormat::new(&options.topic_format)?;

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn connection_options_defaults() {
        let options = ConnectionOptionsBuilder::new("localhost", "client").build().unwrap();
        assert_eq!(DEFAULT_MQTT_PORT, options.port);
        assert_eq!(Duration::from_millis(1000), options.retry_options.min_retry_delay);
        assert_eq!(Duration::from_millis(100000), options.retry_options.max_retry_delay);
        assert_eq!(Duration::from_millis(5000), options.retry_options.max_random_jitter);
        assert_eq!(None, options.retry_options.max_connect_attempts);
        assert_eq!(Duration::from_secs(5), options.disconnect_timeout);
        assert!(!options.disable_connection_management);
    }

    #[test]
    fn connection_options_normalize_inverted_delays() {
        let options = ConnectionOptionsBuilder::new("localhost", "client")
            .with_min_retry_delay(Duration::from_secs(30))
            .with_max_retry_delay(Duration::from_secs(2))
            .build()
            .unwrap();

        assert_eq!(Duration::from_secs(2), options.retry_options.min_retry_delay);
        assert_eq!(Duration::from_secs(30), options.retry_options.max_retry_delay);
    }

    #[test]
    fn connection_options_validation() {
        assert_matches!(ConnectionOptionsBuilder::new("", "client").build(), Err(GneissError::InvalidArgument(_)));
        assert_matches!(ConnectionOptionsBuilder::new("localhost", "").build(), Err(GneissError::InvalidArgument(_)));
        assert_matches!(ConnectionOptionsBuilder::new("localhost", "client").with_disconnect_timeout(Duration::ZERO).build(), Err(GneissError::InvalidArgument(_)));
    }

    #[test]
    fn connection_options_debug_redacts_secrets() {
        let options = ConnectionOptionsBuilder::new("localhost", "client")
            .with_password(b"hunter2")
            .with_client_certificate(ClientCertificate::new(b"cert", b"key"))
            .build()
            .unwrap();

        let debug = format!("{:?}", options);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn default_credential_swap_reason_codes() {
        assert!(default_credential_swap_condition(ConnectReasonCode::UnspecifiedError));
        assert!(default_credential_swap_condition(ConnectReasonCode::NotAuthorized));
        assert!(default_credential_swap_condition(ConnectReasonCode::ServerBusy));
        assert!(default_credential_swap_condition(ConnectReasonCode::Banned));
        assert!(default_credential_swap_condition(ConnectReasonCode::BadAuthenticationMethod));
        assert!(!default_credential_swap_condition(ConnectReasonCode::BadUsernameOrPassword));
        assert!(!default_credential_swap_condition(ConnectReasonCode::Success));
    }

    #[test]
    fn sub_client_option_validation() {
        assert!(RpcClientOptionsBuilder::new("client", "model").build().is_ok());
        assert_matches!(RpcClientOptionsBuilder::new("client", "model").with_publish_timeout(Duration::ZERO).build(), Err(GneissError::InvalidArgument(_)));
        assert_matches!(RpcClientOptionsBuilder::new("client", "model").with_max_pending_requests(0).build(), Err(GneissError::InvalidArgument(_)));
        assert_matches!(RpcClientOptionsBuilder::new("client", "model").with_request_topic_format("a/{bogus}").build(), Err(GneissError::InvalidArgument(_)));

        assert!(RpcServerOptionsBuilder::new("server", "model").with_service_group_id("workers").build().is_ok());
        assert_matches!(RpcServerOptionsBuilder::new("server", "model").with_service_group_id("a/b").build(), Err(GneissError::InvalidArgument(_)));
        assert_matches!(RpcServerOptionsBuilder::new("", "model").build(), Err(GneissError::InvalidArgument(_)));

        assert!(TelemetryProducerOptionsBuilder::new("sender", "model").build().is_ok());
        assert_matches!(TelemetryProducerOptionsBuilder::new("sender", "model").with_topic_format("a{senderId}").build(), Err(GneissError::InvalidArgument(_)));

        assert!(TelemetryConsumerOptionsBuilder::new("model").with_sender_id("sender").with_service_group_id("dashboards").build().is_ok());
        assert_matches!(TelemetryConsumerOptionsBuilder::new("").build(), Err(GneissError::InvalidArgument(_)));
        assert_matches!(TelemetryConsumerOptionsBuilder::new("model").with_sender_id("").build(), Err(GneissError::InvalidArgument(_)));
        assert_matches!(TelemetryConsumerOptionsBuilder::new("model").with_service_group_id("a+").build(), Err(GneissError::InvalidArgument(_)));
        assert_matches!(TelemetryConsumerOptionsBuilder::new("model").with_subscribe_timeout(Duration::ZERO).build(), Err(GneissError::InvalidArgument(_)));
    }
}
