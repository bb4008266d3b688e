pub mod common;
pub mod cvar;
pub mod files;
pub mod save_data;
