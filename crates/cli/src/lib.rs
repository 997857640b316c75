#![deny(unsafe_code)]

pub mod cli;
pub mod demo;
pub mod filter;
pub mod signals;
pub mod summary;
