pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use auth::{Authenticator, JwtVerifier};
use chat::ChatHub;
use config::Config;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<dyn Authenticator>,
    pub hub: Arc<ChatHub>,
}

impl AppState {
    /// Wire the JWT verifier and the chat hub from configuration.
    pub fn new(config: Config) -> Self {
        let auth: Arc<dyn Authenticator> = Arc::new(JwtVerifier::new(
            &config.jwt_secret,
            config.jwt_issuer.as_deref(),
        ));
        let hub = Arc::new(ChatHub::new(auth.clone(), &config));

        Self {
            config: Arc::new(config),
            auth,
            hub,
        }
    }
}
