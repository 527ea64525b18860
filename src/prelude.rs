//! Ambient stack shared by every module: the binary-boundary `Result` alias,
//! logging setup, and the handful of crates (`kube`, `k8s-openapi`, `serde`,
//! `chrono`, `thiserror`) almost every file touches. Reconcile-path errors
//! flow through `ControllerError` (see `crate::error`); this `Result` is
//! only for `main`'s own fallible steps (arg parsing, client construction).

pub use crate::error::ControllerError;
pub use chrono::{DateTime, Utc};
pub use color_eyre::Result;
pub use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
pub use k8s_openapi::ByteString;
pub use kube::{
  api::{Api, ListParams, Patch, PatchParams, PostParams},
  core::ObjectMeta,
  runtime::controller::Action,
  Client, CustomResource, CustomResourceExt, Resource, ResourceExt,
};
pub use schemars::JsonSchema;
pub use serde::{Deserialize, Serialize};
pub use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
  time::Duration,
};
pub use thiserror::Error;
pub use tracing::{debug, error, info, warn};
pub use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};
pub use tracing_tree::HierarchicalLayer;

/// Wires `tracing` through a `tracing-tree` hierarchical layer filtered by
/// `RUST_LOG` (default `<crate>=<default_level>`), the way the teacher's
/// `auto-secret` binary does, and installs `color_eyre`'s panic/error
/// reporting for the binary boundary. `RUST_LOG`, when set, always wins over
/// `default_level` (the CLI's `--log-level`).
pub fn setup_logging(default_level: &str) -> Result<()> {
  let default_filter = format!("{}={}", env!("CARGO_PKG_NAME").replace('-', "_"), default_level);
  if std::env::var("RUST_LOG").is_err() {
    std::env::set_var("RUST_LOG", &default_filter);
  }

  color_eyre::install()?;
  Registry::default()
    .with(EnvFilter::from_default_env())
    .with(HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(true))
    .init();

  Ok(())
}
