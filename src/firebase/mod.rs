pub mod auth;
pub mod client;
pub mod credentials;
pub mod models;
