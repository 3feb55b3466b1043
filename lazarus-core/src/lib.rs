pub mod arch;
pub mod config;
pub mod error;
mod header;
pub mod image;
pub mod layout;
pub mod mappings;
pub mod note;
pub mod relocate;
pub mod revival;
pub mod sections;
pub mod symbols;
pub mod tables;

#[cfg(test)]
mod fixtures;

pub use config::*;
pub use error::{Error, Result};
pub use header::elf::Elf64Ehdr;
pub use header::Header;
pub use image::*;
pub use mappings::*;
pub use note::*;
pub use revival::*;
pub use sections::*;
pub use symbols::*;
pub use tables::*;
