#![doc = include_str!("../README.md")]

pub mod backend;
pub mod canon;
pub mod error;
pub mod kwargs;
pub mod transport;

pub use error::{Error, Result};
pub use kwargs::{KwValue, Kwargs};
