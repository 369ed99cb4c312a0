//! Static description of the replication service
//!
//! Every remotely invokable method is a [`Method`] variant with a fixed
//! invocation kind. Dispatch matches on the enum, so adding a method without
//! a handler does not compile.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How a method delivers its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// One request, one response
    Request,
    /// Zero or more stream items followed by a terminating response
    Stream,
}

/// Methods exposed on each connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Fetch,
    Version,
    CreateReadStream,
    Auth,
    Methods,
    Ping,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Fetch,
        Method::Version,
        Method::CreateReadStream,
        Method::Auth,
        Method::Methods,
        Method::Ping,
    ];

    /// Wire name
    pub fn name(&self) -> &'static str {
        match self {
            Method::Fetch => "fetch",
            Method::Version => "version",
            Method::CreateReadStream => "createReadStream",
            Method::Auth => "auth",
            Method::Methods => "methods",
            Method::Ping => "ping",
        }
    }

    pub fn kind(&self) -> MethodKind {
        match self {
            Method::CreateReadStream => MethodKind::Stream,
            _ => MethodKind::Request,
        }
    }

    /// Whether the `access` predicate is consulted before invocation
    ///
    /// Session plumbing (`auth`, `methods`, `ping`) is always allowed so a
    /// peer can authenticate before anything is granted.
    pub fn requires_access(&self) -> bool {
        matches!(
            self,
            Method::Fetch | Method::Version | Method::CreateReadStream
        )
    }

    /// Service description returned by the `methods` call
    pub fn describe() -> Value {
        let table: serde_json::Map<String, Value> = Self::ALL
            .iter()
            .map(|m| (m.name().to_string(), json!({ "type": m.kind() })))
            .collect();
        Value::Object(table)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Parameters of `fetch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchParams {
    pub key: String,
}
