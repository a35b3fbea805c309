#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Hashing and file-write helpers shared by the urja crates. No logging.

pub mod fs;
pub mod hash;
