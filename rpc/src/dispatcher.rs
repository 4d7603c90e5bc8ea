use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::error::RpcError;
use crate::message::Request;

/// A `major.minor` handler version. Compatibility is asymmetric: a handler
/// serves any request with the same major and a minor at or below its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

pub const DEFAULT_VERSION: Version = Version { major: 1, minor: 0 };

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, requested: Version) -> bool {
        self.major == requested.major && requested.minor <= self.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| RpcError::Decode(format!("bad version {}", s)))?;
        let minor = match parts.next() {
            Some(p) => p
                .parse()
                .map_err(|_| RpcError::Decode(format!("bad version {}", s)))?,
            None => 0,
        };
        Ok(Version { major, minor })
    }
}

/// What a handler's `execute` can fail with. These map onto the failure
/// kinds carried back to the caller in the reply envelope.
#[derive(Debug)]
pub enum HandlerError {
    NoSuchMethod,
    InvalidArgs(String),
    Application { message: String, detail: Value },
}

impl HandlerError {
    pub fn application(message: &str) -> Self {
        HandlerError::Application {
            message: message.to_string(),
            detail: Value::Null,
        }
    }
}

/// Result values from one dispatch. A handler that streams partial results
/// returns `Many`; each value becomes its own reply on the wire.
#[derive(Debug)]
pub enum Replies {
    One(Value),
    Many(Vec<Value>),
}

impl Replies {
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Replies::One(v) => vec![v],
            Replies::Many(vs) => vs,
        }
    }
}

/// One versioned method table. Implementations match on the method name in
/// `execute` and return `HandlerError::NoSuchMethod` for names they do not
/// know.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    fn version(&self) -> Version;

    fn namespace(&self) -> Option<&str> {
        None
    }

    async fn execute(
        &self,
        ctx: &Context,
        method: &str,
        args: &serde_json::Map<String, Value>,
    ) -> Result<Replies, HandlerError>;
}

/// Hook for translating values at the dispatch boundary: `deserialize`
/// turns inbound wire arguments into handler-facing values, `serialize`
/// turns handler results back into wire values. Both default to identity.
pub trait Serializer: Send + Sync {
    fn deserialize(&self, ctx: &Context, value: Value) -> Value {
        let _ = ctx;
        value
    }

    fn serialize(&self, ctx: &Context, value: Value) -> Value {
        let _ = ctx;
        value
    }
}

pub struct NoopSerializer;

impl Serializer for NoopSerializer {}

/// Routes incoming requests to the registered handler whose namespace and
/// version match. Handlers are scanned in registration order and the first
/// compatible one wins.
pub struct Dispatcher {
    handlers: Vec<Box<dyn RpcHandler>>,
    serializer: Box<dyn Serializer>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            serializer: Box::new(NoopSerializer),
        }
    }

    pub fn with_serializer(serializer: Box<dyn Serializer>) -> Self {
        Self {
            handlers: Vec::new(),
            serializer,
        }
    }

    /// Register a handler. Two handlers may not share a (namespace, major)
    /// pair; that would make dispatch order-dependent in a way callers
    /// cannot observe, so it is refused outright.
    pub fn register(
        &mut self,
        handler: Box<dyn RpcHandler>,
    ) -> Result<(), RpcError> {
        for existing in &self.handlers {
            if existing.namespace() == handler.namespace()
                && existing.version().major == handler.version().major
            {
                return Err(RpcError::DuplicateHandler(format!(
                    "{}/{}",
                    handler.namespace().unwrap_or("(root)"),
                    handler.version().major
                )));
            }
        }
        self.handlers.push(handler);
        Ok(())
    }

    /// Find the matching handler for `request` and run it.
    ///
    /// A request with no version gets `DEFAULT_VERSION`. No compatible
    /// handler yields `UnsupportedVersion`; a compatible handler that lacks
    /// the method yields `NoSuchMethod`. The two are kept distinct so the
    /// caller can tell a deployment skew from a typo.
    pub async fn dispatch(
        &self,
        ctx: &Context,
        request: &Request,
    ) -> Result<Vec<Value>, RpcError> {
        let requested = match &request.version {
            Some(v) => Version::from_str(v)?,
            None => DEFAULT_VERSION,
        };
        let namespace = request.namespace.as_deref();

        for handler in &self.handlers {
            if handler.namespace() != namespace {
                continue;
            }
            if !handler.version().is_compatible(requested) {
                continue;
            }
            let mut args = serde_json::Map::new();
            for (key, value) in &request.args {
                args.insert(
                    key.clone(),
                    self.serializer.deserialize(ctx, value.clone()),
                );
            }
            let replies = handler
                .execute(ctx, &request.method, &args)
                .await
                .map_err(|e| match e {
                    HandlerError::NoSuchMethod => {
                        RpcError::NoSuchMethod(request.method.clone())
                    }
                    HandlerError::InvalidArgs(msg) => RpcError::Remote(
                        crate::message::FailureInfo {
                            kind: crate::message::RemoteErrorKind::InvalidArgs,
                            message: msg,
                            detail: Value::Null,
                        },
                    ),
                    HandlerError::Application { message, detail } => {
                        RpcError::Remote(crate::message::FailureInfo {
                            kind: crate::message::RemoteErrorKind::Application,
                            message,
                            detail,
                        })
                    }
                })?;
            return Ok(replies
                .into_vec()
                .into_iter()
                .map(|v| self.serializer.serialize(ctx, v))
                .collect());
        }

        Err(RpcError::UnsupportedVersion(requested.to_string()))
    }
}
