pub mod config;
pub mod daemon;
pub mod deployment;
pub mod error;
pub mod generator;
pub mod ops;
pub mod pia;
pub mod util;
pub mod webhook;
