pub mod middleware;
pub mod verifier;

pub use verifier::{AuthError, Authenticator, Identity, JwtVerifier, TokenClaims};
