pub mod config;
pub mod note;
pub mod project;
pub mod time;
