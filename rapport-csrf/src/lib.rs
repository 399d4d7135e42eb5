//! # Rapport CSRF
//!
//! Session-bound anti-forgery tokens over the Rapport dual-tier store.
//!
//! ## Features
//!
//! - **Synchronizer tokens**: one live token per session, re-issue supersedes
//! - **Digest at rest**: the store holds an HMAC-SHA256 digest, never the token
//! - **Constant-time checks**: verification never short-circuits on content
//! - **Outage tolerant**: tokens are issued and checked on the fallback while
//!   the shared store is down
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rapport_csrf::{CsrfConfig, TokenStore};
//!
//! let tokens = TokenStore::new(tiers, CsrfConfig::from_env()?)?;
//!
//! // Render a form
//! let token = tokens.issue(&session_id).await?;
//!
//! // Handle the submission; answers 403 on failure
//! let submitted = request.header(&tokens.config().header_name);
//! tokens.require(&session_id, submitted).await?;
//! ```

pub mod config;
pub mod error;
pub mod store;
pub mod token;

pub use config::CsrfConfig;
pub use error::{CsrfError, Result};
pub use store::TokenStore;
pub use token::{CsrfToken, TokenRecord};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::CsrfConfig;
    pub use crate::error::{CsrfError, Result};
    pub use crate::store::TokenStore;
    pub use crate::token::CsrfToken;
}
