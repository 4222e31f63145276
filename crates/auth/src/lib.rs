//! `uploadflow-auth` — bearer token identity for the upload gateway.
//!
//! Decoding and claim validation only; what a role may do is decided by the
//! API layer.

pub mod claims;
pub mod jwt;
pub mod roles;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtError, JwtValidator, encode_hs256};
pub use roles::Role;
