#![allow(dead_code)]

pub mod archive;

#[cfg(unix)]
pub mod daemon;
