pub mod credential;
pub mod error;
pub mod event;
pub mod pool;
pub mod provider;
pub mod request;
pub mod state;

pub use credential::{Credential, PoolSnapshot, Quota, Validity};
pub use error::{AttemptFailure, GatewayError, PoolMark};
pub use event::{DoneMeta, EventStream, RateLimitNotice, StreamEvent};
pub use pool::{AcquireError, CredentialPool, PoolConfig, RotationStrategy};
pub use provider::{CallContext, CredentialValidator, ProbeOutcome, Provider};
pub use request::ChatRequest;
pub use state::{NoopStateSink, StateSink};
