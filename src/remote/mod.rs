//! Access to the server side of the sync layer.

mod http;

pub use http::HttpRemote;

use color_eyre::Result;
use std::future::Future;

use crate::criteria::Criteria;
use crate::types::{Location, Row};

/// Trait for the remote end of the data source.
pub trait RemoteSource: Send + Sync + 'static {
  /// Retrieve rows at `location` matching `criteria`.
  fn fetch(
    &self,
    location: &Location,
    criteria: &Criteria,
  ) -> impl Future<Output = Result<Vec<Row>>> + Send;

  /// Store `objects`, returning the rows as the server saved them.
  fn save(
    &self,
    location: &Location,
    objects: &[Row],
  ) -> impl Future<Output = Result<Vec<Row>>> + Send;

  /// Delete `objects`, returning the rows the server removed.
  fn remove(
    &self,
    location: &Location,
    objects: &[Row],
  ) -> impl Future<Output = Result<Vec<Row>>> + Send;

  /// Ask `server` to route change notifications to the push connection
  /// identified by `token`.
  fn subscribe(&self, server: &str, token: &str) -> impl Future<Output = Result<()>> + Send;
}
