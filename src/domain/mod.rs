pub mod analysis;
pub mod arrs;
pub mod cooldown;
pub mod models;
pub mod statistics;
