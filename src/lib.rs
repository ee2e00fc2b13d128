#![deny(unreachable_pub)]
pub mod config;
pub mod grid;
pub mod runner;
