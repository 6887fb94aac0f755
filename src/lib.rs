pub mod app;
pub mod artifacts;
pub mod cli;
pub mod command;
pub mod config;
pub mod crawler;
pub mod enumerate;
pub mod events;
pub mod output;
pub mod probe;
pub mod runner;
pub mod session;
pub mod urls;
pub mod utils;
pub mod xss;

#[cfg(test)]
mod tests;
