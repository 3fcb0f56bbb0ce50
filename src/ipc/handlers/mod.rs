pub mod access;
pub mod core;
pub mod instances;
pub mod operations;
pub mod resources;
pub mod schedules;
pub mod setup;
