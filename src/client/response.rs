//! Wire types for the forum's JSON listing and profile endpoints.

use serde::Deserialize;

use crate::models::{RawPost, RawUser};

/// Top-level listing envelope: `{"kind": "Listing", "data": {...}}`.
#[derive(Debug, Deserialize)]
pub struct ListingEnvelope {
    pub data: ListingData,
}

#[derive(Debug, Deserialize)]
pub struct ListingData {
    /// Opaque cursor for the next page, if any.
    pub after: Option<String>,
    #[serde(default)]
    pub children: Vec<ListingChild>,
}

/// One listing item: `{"kind": "t3", "data": {...}}`.
///
/// `data` stays raw JSON here so one malformed item can be skipped
/// without poisoning the rest of the page.
#[derive(Debug, Deserialize)]
pub struct ListingChild {
    pub data: serde_json::Value,
}

impl ListingChild {
    pub fn into_raw_post(self) -> Result<RawPost, serde_json::Error> {
        serde_json::from_value(self.data)
    }
}

/// Profile envelope: `{"kind": "t2", "data": {...}}`.
#[derive(Debug, Deserialize)]
pub struct ProfileEnvelope {
    pub data: RawUser,
}
