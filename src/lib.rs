//! The geoipenv library: GeoIP enrichment of requests from MaxMind DB files.
//!
//! A [`ModuleConfig`] is loaded from a directive file, the databases it names
//! are opened once into a [`DatabaseRegistry`], and a [`GeoIpModule`] hooks
//! into a [`Pipeline`] to bind `GEOIP_*` variables on every request before
//! rewrite and environment-setting stages run.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use geoipenv::{directive, DatabaseRegistry, GeoIpModule, Pipeline, Request};
//!
//! # fn main() -> geoipenv::Result<()> {
//! let config = directive::parse(
//!     "inline",
//!     "MaxMindDBEnable On\nMaxMindDBFile /usr/share/GeoIP/GeoLite2-City.mmdb\n",
//! )?;
//! let databases = DatabaseRegistry::default();
//! databases.preload(&config);
//!
//! let module = Arc::new(GeoIpModule::new(Arc::new(config), Arc::new(databases)));
//! let mut pipeline = Pipeline::new();
//! module.register(&mut pipeline);
//! pipeline.build()?;
//!
//! let mut request = Request::new("81.2.69.142", "/");
//! pipeline.process(&mut request)?;
//! println!("{:?}", request.vars.get("GEOIP_COUNTRY_CODE"));
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod config;
pub mod directive;
pub mod error;
pub mod extract;
pub mod input;
pub mod mmdb;
pub mod module;
pub mod pipeline;
pub mod record;

pub use crate::config::{DirectoryConfig, ModuleConfig, ScopeConfig, ServerConfig};
pub use crate::error::{Error, Result};
pub use crate::extract::{extract, OutputVariable};
pub use crate::mmdb::{DatabaseRegistry, GeoDatabase, MaxMindDatabase, MemoryDatabase};
pub use crate::module::GeoIpModule;
pub use crate::pipeline::{Disposition, HookOrder, Phase, Pipeline, Request};
pub use crate::record::{FieldPath, FieldValue, LocatedEntry, RecordNode};
