// ctrlwire-core: realtime control-channel engine between ctrlwire-api and consumers (CLI).

pub mod auth;
pub mod bindings;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod mock;
pub mod single_flight;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use auth::{CredentialManager, HeadlessNavigator, Navigator};
pub use bindings::{BindingKey, BindingRegistry, BindingStream, DebugEvent};
pub use client::{Client, ClientBuilder};
pub use config::{
    AuthOptions, ClientConfig, GrantType, PasswordCredentials, StorageMode, SupervisorConfig, TlsVerification,
};
pub use correlator::{Correlator, Registration};
pub use error::{AuthError, CoreError, RequestError};
pub use mock::{MockConnector, SimulatedBackend, SimulatedModule, SimulatedSystem};
pub use single_flight::SingleFlight;
pub use supervisor::{ConnectionState, CredentialSource, Dispatch, Supervisor};

// Wire types callers commonly need alongside the client.
pub use ctrlwire_api::{Authority, ErrorCode};
