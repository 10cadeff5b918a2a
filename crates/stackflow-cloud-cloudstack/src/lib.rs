//! Apache CloudStack Provider for StackFlow
//!
//! This crate implements [`stackflow_cloud::CloudStackApi`] on top of the
//! `cmk` (CloudMonkey) CLI, which takes care of request signing.
//!
//! # Requirements
//!
//! - `cmk` installed and on `PATH` (or configured via `cmk_binary`)
//! - A cloud-config file with a `[Global]` section:
//!
//! ```ini
//! [Global]
//! api-url = https://cloud.example.com/client/api
//! api-key = ...
//! secret-key = ...
//! verify-ssl = true
//! ```

pub mod cloud_config;
pub mod cmk;
pub mod error;
pub mod provider;

pub use cloud_config::CloudConfig;
pub use cmk::Cmk;
pub use error::{CloudStackError, Result};
pub use provider::CloudStackProvider;
