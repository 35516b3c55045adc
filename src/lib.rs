#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod action;
pub mod cache;
mod config;
mod dispatcher;
mod error;
mod fingerprint;
mod graph;
mod handle;
pub mod hash;
pub mod lock;
#[cfg(feature = "logging")]
pub mod logging;
mod report;
mod utils;

pub use crate::action::{Action, Command, from_fn};
pub use crate::config::Config;
pub use crate::dispatcher::{Dispatcher, Registered};
pub use crate::error::*;
pub use crate::handle::{
    AnyHandle, DirHandle, FileHandle, GlobHandle, Handle, HandleId, HandleKind, ValueHandle,
};
pub use crate::hash::{Digestible, Hash32};
pub use crate::report::{ActionState, Report, ReportEntry};
