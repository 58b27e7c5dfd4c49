//! Authentication Module
//! Mission: Keep one valid bearer token alive without duplicate exchanges

pub mod token_manager;

pub use token_manager::{HttpTokenExchange, TokenExchange, TokenManager, TokenResponse};
