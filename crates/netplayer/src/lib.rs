pub mod cli;
pub mod config;
pub mod runtime;

mod cpal_sink;
mod device;
