pub mod capability;
pub mod config;
pub mod db;
pub mod error;
pub mod eval;
pub mod index;
pub mod pipeline;
pub mod util;
