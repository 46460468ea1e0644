//! OAuth2 credential lifecycle
//!
//! Everything between "the catalog says this server speaks OAuth" and
//! "here is a fresh `Authorization` header": endpoint discovery,
//! dynamic client registration, the per-(user, server) token manager,
//! and the multi-tenant session registry.
//!
//! # Module Layout
//!
//! - [`discovery`]    -- RFC 8414 well-known metadata fetch + cache
//! - [`registration`] -- RFC 7591 dynamic client registration
//! - [`pkce`]         -- PKCE `S256` challenge and state nonce generation
//! - [`token`]        -- `OAuthToken` and the flow-specific `TokenManager`
//! - [`session`]      -- `UserSessionStore` and CSRF state tracking

pub mod discovery;
pub mod pkce;
pub mod registration;
pub mod session;
pub mod token;
