#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! froxy library — relay-tunneled HTTP/CONNECT proxy.
//!
//! Two processes pair up through an external WebSocket relay:
//! - the **edge** (`proxy`) exposes a local HTTP proxy and forwards requests
//!   for configured domains over the relay,
//! - the **agent** (`agent`) runs inside the private network and executes
//!   those requests for real.
//!
//! Modules:
//! - `protocol` — `RelayMessage` wire format
//! - `sessions` — in-flight request table on the edge
//! - `tunnel` — relay endpoint and the reconnecting `RelayLink`
//! - `routing` — domain filter and per-side routing policy
//! - `proxy` — local listener, CONNECT tunnels, direct and relayed requests
//! - `agent` — request executor
//! - `lifecycle` — cancellation scope and bounded shutdown
//! - `config` — TOML + env-var configuration

pub mod agent;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod proxy;
pub mod routing;
pub mod sessions;
pub mod state;
pub mod tunnel;
pub mod util;

pub use agent::{Agent, AgentHandle, Executor};
pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{MessageType, RelayMessage};
pub use proxy::{EdgeHandle, EdgeProxy};
pub use sessions::SessionTable;
pub use tunnel::{LinkState, RelayEndpoint, RelayLink, StartupPolicy};
