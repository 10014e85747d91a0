pub mod analysis;
pub mod config;
pub mod events;
pub mod index;
pub mod models;
pub mod runs;
