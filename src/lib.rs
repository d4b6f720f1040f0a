pub mod api;
pub mod cli;
pub mod clients;
pub mod engine;
pub mod error;
pub mod steps;
pub mod storage;
