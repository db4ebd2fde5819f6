//! The join map from request identity back to record identifiers.

use std::collections::BTreeMap;

use spill_chips_request_models::{CorrelationToken, ImageRequest};
use spill_chips_spill_models::BoundsKey;

/// Two records whose computed boxes are bit-for-bit identical.
///
/// The first record keeps the bounds entry. The second can still be matched
/// through its correlation token, but a manifest that only echoes the box
/// resolves to the first record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundsCollision {
    /// The shared boundary tuple.
    pub key: BoundsKey,
    /// Identifier that owns the bounds entry.
    pub kept: String,
    /// Identifier that could not claim it.
    pub shadowed: String,
}

/// How a manifest was matched to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    /// The manifest carried a known correlation token.
    Token,
    /// Exact lookup of the echoed bounding box.
    Bounds,
}

/// A resolved record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub identifier: &'a str,
    pub matched_by: MatchedBy,
}

/// Maps each request's correlation token and exact bounding box to the
/// identifier of the record it was built from.
///
/// Only [`crate::build_plan`] populates it; afterwards it is read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeometryIdentifierMap {
    by_bounds: BTreeMap<BoundsKey, String>,
    by_token: BTreeMap<CorrelationToken, String>,
}

impl GeometryIdentifierMap {
    pub(crate) fn insert(
        &mut self,
        request: &ImageRequest,
        identifier: &str,
    ) -> Result<(), BoundsCollision> {
        self.by_token
            .insert(request.correlation.clone(), identifier.to_string());

        let key = request.geo.bounds_key();
        if let Some(kept) = self.by_bounds.get(&key) {
            return Err(BoundsCollision {
                key,
                kept: kept.clone(),
                shadowed: identifier.to_string(),
            });
        }
        self.by_bounds.insert(key, identifier.to_string());
        Ok(())
    }

    /// Looks up an exact `(min_lon, min_lat, max_lon, max_lat)` tuple.
    #[must_use]
    pub fn identifier_for_bounds(&self, bbox: [f64; 4]) -> Option<&str> {
        self.by_bounds
            .get(&BoundsKey::from_bbox(bbox))
            .map(String::as_str)
    }

    /// Looks up a correlation token.
    #[must_use]
    pub fn identifier_for_token(&self, token: &CorrelationToken) -> Option<&str> {
        self.by_token.get(token).map(String::as_str)
    }

    /// Resolves a manifest's identity, preferring the correlation token and
    /// falling back to the exact bounding box.
    #[must_use]
    pub fn resolve(
        &self,
        token: Option<&CorrelationToken>,
        bbox: Option<[f64; 4]>,
    ) -> Option<Resolution<'_>> {
        if let Some(identifier) = token.and_then(|t| self.identifier_for_token(t)) {
            return Some(Resolution {
                identifier,
                matched_by: MatchedBy::Token,
            });
        }

        bbox.and_then(|b| self.identifier_for_bounds(b))
            .map(|identifier| Resolution {
                identifier,
                matched_by: MatchedBy::Bounds,
            })
    }

    /// Number of records in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// Number of distinct bounding boxes. Smaller than [`Self::len`] when
    /// boxes collided.
    #[must_use]
    pub fn bounds_len(&self) -> usize {
        self.by_bounds.len()
    }
}
