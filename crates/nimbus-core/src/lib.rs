pub mod buffer;
pub mod cache;
pub mod chunk;
pub mod chunkmac;
pub mod config;
pub mod context;
pub mod engine;
pub mod fs;
pub mod http;
pub mod piece;
pub mod raid;
pub mod slot;
pub mod speed;
pub mod testing;
pub mod transfer;
pub mod workers;
