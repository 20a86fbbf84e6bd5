#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(unreachable_pub)]

#[macro_use]
extern crate serde_derive;

extern crate serde;
extern crate serde_json;

pub mod address;
pub mod arbiter;
pub mod builder;
pub mod descriptor;
pub mod executor;
pub mod inventory;
pub mod machine;
pub mod store;
