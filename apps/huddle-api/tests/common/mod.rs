#![allow(dead_code)]

use axum::Router;
use jsonwebtoken::{Algorithm, EncodingKey, Header};

use huddle_api::auth::TokenClaims;
use huddle_api::config::Config;
use huddle_api::AppState;

pub const TEST_SECRET: &str = "huddle-test-secret";

/// Configuration for tests: small history window, generous queues.
pub fn test_config() -> Config {
    Config {
        jwt_secret: TEST_SECRET.to_string(),
        jwt_issuer: None,
        port: 0,
        history_capacity: 50,
        session_queue_capacity: 256,
        max_message_length: 4000,
    }
}

/// Mint a credential token the test state will accept.
pub fn mint_token(user_id: &str, display_name: &str) -> String {
    mint(user_id, display_name, 300)
}

/// Mint a token that expired ten minutes ago.
pub fn mint_expired_token(user_id: &str) -> String {
    mint(user_id, "Expired User", -600)
}

fn mint(user_id: &str, display_name: &str, expires_in: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = TokenClaims {
        sub: user_id.to_string(),
        name: display_name.to_string(),
        iat: now,
        exp: now + expires_in,
        iss: None,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("mint test token")
}

/// A fresh user id, unique per call.
pub fn new_user_id() -> String {
    huddle_common::id::prefixed_ulid(huddle_common::id::prefix::USER)
}

pub fn test_state() -> AppState {
    test_state_with(test_config())
}

pub fn test_state_with(config: Config) -> AppState {
    AppState::new(config)
}

/// Build the full application router wired to a test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = huddle_api::routes::router().with_state(state.clone());
    (app, state)
}
