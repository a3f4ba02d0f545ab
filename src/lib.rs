#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod envelope;
pub use envelope::{Envelope, MessageType, STATE_CHANGED_EVENT};

mod waiter;
pub use waiter::Waiter;

mod task_supervisor;
pub use task_supervisor::{SupervisorHandle, TaskGuard, TaskSupervisor};

mod registry;
pub use registry::ProxyRegistry;

mod proxy;
pub use proxy::{DtoProxy, EventSubscription};

mod session;
pub use session::{ClientSession, SessionState};

mod client;
pub use client::ClientConfig;

mod member;
pub use member::{Args, MemberTable};

mod dto;
pub use dto::{Dto, DtoCore, DtoRegistry, RemoteObject};

mod server;
pub use server::RemoteServer;
