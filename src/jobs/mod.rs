pub mod dispatcher;
pub mod documents;
pub mod models;
pub mod poller;
