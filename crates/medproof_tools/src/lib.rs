#![forbid(unsafe_code)]

pub mod key_cli;
