//! SAML 2.0 service-provider engine for SPID.
//!
//! The HTTP layer stays with the host: it hands inbound messages to a
//! [`ServiceProvider`] and writes out the [`EncodedMessage`]s it gets back.
//! The expiry sweeps [`session::session_cleanup_task`] and
//! [`sp::tracker::request_cleanup_task`] are optional and meant to be spawned
//! by the host on its tokio runtime.

pub mod attributes;
pub mod authn_context;
pub mod bindings;
pub mod config;
pub mod error;
pub mod idp;
pub mod session;
pub mod signature;
pub mod sp;
pub mod state;
pub mod xml;

pub use authn_context::{AuthnLevel, Comparison, RequestedAuthnContext};
pub use bindings::{Binding, EncodedMessage, InboundMessage};
pub use config::ServiceProviderConfig;
pub use error::{ConfigurationError, Error, RequestError, SessionError, ValidationError};
pub use idp::IdentityProviderMetadata;
pub use session::{Session, SessionToken};
pub use sp::acs::Assertion;
pub use sp::slo::{LogoutOutcome, LogoutProfile, LogoutState};
pub use state::ServiceProvider;
