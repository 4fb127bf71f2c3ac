/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Request/response (RPC) over MQTT5: status codes and property names shared by the
[`client`] and [`server`] state machines, plus topic formats and the application-side
pending-commands table.
 */

pub mod client;
pub mod pending;
pub mod server;
pub mod topic;

use crate::mqtt::QualityOfService;

use std::fmt;

/// Name of the user property carrying the RPC status of a response
pub const RPC_STATUS_PROPERTY_NAME : &str = "status";

/// Name of the user property carrying the error message of a failed response
pub const RPC_STATUS_MESSAGE_PROPERTY_NAME : &str = "statusMessage";

/// Quality of service used for every RPC publish and subscribe
pub const RPC_QOS : QualityOfService = QualityOfService::AtLeastOnce;

/// HTTP-style status code carried by RPC responses
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcStatus(pub i32);

impl RpcStatus {

    /// Status reported when a response could not be parsed
    pub const UNKNOWN : RpcStatus = RpcStatus(0);

    pub const OK : RpcStatus = RpcStatus(200);
    pub const ACCEPTED : RpcStatus = RpcStatus(202);
    pub const NO_CONTENT : RpcStatus = RpcStatus(204);
    pub const BAD_REQUEST : RpcStatus = RpcStatus(400);
    pub const UNAUTHORIZED : RpcStatus = RpcStatus(401);
    pub const FORBIDDEN : RpcStatus = RpcStatus(403);
    pub const NOT_FOUND : RpcStatus = RpcStatus(404);
    pub const NOT_ALLOWED : RpcStatus = RpcStatus(405);
    pub const CONFLICT : RpcStatus = RpcStatus(409);
    pub const PRECONDITION_FAILED : RpcStatus = RpcStatus(412);
    pub const REQUEST_TOO_LARGE : RpcStatus = RpcStatus(413);
    pub const UNSUPPORTED_TYPE : RpcStatus = RpcStatus(415);
    pub const THROTTLED : RpcStatus = RpcStatus(429);
    pub const CLIENT_CLOSED : RpcStatus = RpcStatus(499);
    pub const SERVER_ERROR : RpcStatus = RpcStatus(500);
    pub const BAD_GATEWAY : RpcStatus = RpcStatus(502);
    pub const SERVICE_UNAVAILABLE : RpcStatus = RpcStatus(503);

    /// Status reported for publish and execution timeouts
    pub const TIMEOUT : RpcStatus = RpcStatus(504);

    /// Returns true for any status outside the 2xx range
    pub fn is_failure(&self) -> bool {
        self.0 < 200 || self.0 >= 300
    }
}

impl Default for RpcStatus {
    fn default() -> Self {
        RpcStatus::UNKNOWN
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for RpcStatus {
    fn from(value: i32) -> Self {
        RpcStatus(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_failure_classification() {
        assert!(!RpcStatus::OK.is_failure());
        assert!(!RpcStatus::NO_CONTENT.is_failure());
        assert!(!RpcStatus(299).is_failure());
        assert!(RpcStatus(199).is_failure());
        assert!(RpcStatus(300).is_failure());
        assert!(RpcStatus::NOT_FOUND.is_failure());
        assert!(RpcStatus::TIMEOUT.is_failure());
        assert_eq!("504", RpcStatus::TIMEOUT.to_string());
    }
}
