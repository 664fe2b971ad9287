#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod crypto;
pub mod encoding;
pub mod keys;
pub mod logging;
