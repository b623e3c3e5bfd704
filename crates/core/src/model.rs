//! Persisted model marker.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A type persisted as a JSON document under a fixed model name.
///
/// The model name is what the tenant-scoping layer keys its allow-list on, so
/// it must be stable across releases.
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    /// Entity-type name (e.g. `"Job"`).
    const MODEL: &'static str;

    /// Field holding the primary identifier.
    const ID_FIELD: &'static str = "id";
}
