pub mod characters;
pub mod models;
pub mod prompt;
