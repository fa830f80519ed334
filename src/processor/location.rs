//! Location metadata used to enrich readings.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::DependencyError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Resolves a location name to coordinates.
///
/// `Ok(None)` means the service answered and does not know the location; an
/// `Err` means it could not answer, and the reading will be retried.
pub trait LocationService: Send + Sync + 'static {
    fn locate<'a>(
        &'a self,
        location_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Coordinates>, DependencyError>>;
}

/// Fixed, case-insensitive directory of known locations.
#[derive(Debug, Clone)]
pub struct LocationDirectory {
    entries: HashMap<String, Coordinates>,
}

impl LocationDirectory {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with(mut self, name: &str, lat: f64, lng: f64) -> Self {
        self.entries
            .insert(normalize(name), Coordinates { lat, lng });
        self
    }

    pub fn get(&self, name: &str) -> Option<Coordinates> {
        self.entries.get(&normalize(name)).copied()
    }
}

impl Default for LocationDirectory {
    fn default() -> Self {
        Self::empty()
            .with("Cape Town", -33.9249, 18.4241)
            .with("Stellenbosch", -33.9321, 18.8602)
            .with("Paarl", -33.7342, 18.9621)
            .with("Durban", -29.8587, 31.0218)
            .with("Johannesburg", -26.2041, 28.0473)
            .with("Pretoria", -25.7479, 28.2293)
    }
}

impl LocationService for LocationDirectory {
    fn locate<'a>(
        &'a self,
        location_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Coordinates>, DependencyError>> {
        Box::pin(async move { Ok(self.get(location_name)) })
    }
}

fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
