pub mod buffer;
pub mod codec;
pub mod config;
pub mod decode;
pub mod error;
pub mod output;
pub mod pack;
pub mod pipeline;
mod process;
mod shared;
pub mod sink;
pub mod status;
pub mod stream;
mod trim;

pub use pipeline::Pipeline;
