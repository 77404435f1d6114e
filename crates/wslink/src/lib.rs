//! # wslink
//!
//! Client engine for the wslink protocol: RPC calls that resolve
//! asynchronously, server-pushed topic events and binary payloads,
//! multiplexed over one WebSocket connection with a bounded frame size.
//!
//! ```no_run
//! use wslink::{SessionBuilder, Value};
//!
//! # async fn run() -> wslink::Result<()> {
//! let (session, _events) = SessionBuilder::new("ws://localhost:8080/ws")
//!     .with_secret("wslink-secret")
//!     .connect()
//!     .await?;
//!
//! let numbers = Value::Array(vec![Value::from(1), Value::from(2)]);
//! let sum = session.call("math.add", vec![numbers], Default::default())?.await?;
//! println!("{:?}", sum);
//! session.close().await
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use wslink_proto as proto;
pub use wslink_transport as transport;

/// Error types for the wslink client
pub mod error;

/// Ordered execution of asynchronous tasks
pub mod queue;

/// Topic subscription registry
pub mod subscription;

/// Out-of-band binary attachment correlation
pub mod attachment;

mod protocol;

mod driver;

/// Session handle, configuration and driver
pub mod session;

/// Registry of live sessions
pub mod registry;

pub use error::{SessionError, CLIENT_ERROR};
pub use queue::{QueuedTask, SequentialTaskQueue};
pub use session::{
    ConnectionEvent, ConnectionEvents, PendingCall, Session, SessionBuilder, SessionConfig, SessionState,
    Subscription,
};
pub use registry::SessionRegistry;
pub use wslink_proto::{ReassemblyPolicy, RpcError, Value, WireFormat};

/// Result type alias for wslink operations
pub type Result<T> = std::result::Result<T, SessionError>;
