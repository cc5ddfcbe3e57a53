pub mod app;
pub mod config;
pub mod models;
pub mod providers;
pub mod services;

#[cfg(test)]
mod testing;
