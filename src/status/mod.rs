pub mod board;
pub mod prompt;
