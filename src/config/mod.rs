pub mod loading;
pub mod models;
pub mod schedule;
