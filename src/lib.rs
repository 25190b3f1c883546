pub mod broadcast;
pub mod config;
pub mod model;
pub mod notify;
pub mod probe;
pub mod scheduler;
pub mod store;
pub mod web;
