#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

//! Core of urja.
//!
//! - [`pipeline`]: fixed-order production build over a shared context
//! - [`prebundle`]: third-party dependencies to cached ES modules
//! - [`dev`]: on-demand dev server with HMR
//! - [`federation`]: remote container loading and shared scope

pub mod config;
pub mod css;
pub mod dev;
pub mod engine;
pub mod error;
pub mod federation;
pub mod imports;
pub mod pipeline;
pub mod plugin;
pub mod prebundle;
pub mod resolver;

pub use config::{BuildConfig, FederationConfig, Mode, Platform};
pub use dev::DevServer;
pub use engine::{default_engine, Engine, NativeEngine};
pub use error::Error;
pub use pipeline::{BuildContext, Pipeline, PipelineExecutor};
pub use prebundle::DependencyPreBundler;
