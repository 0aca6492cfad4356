use crate::error::Result;

/// Where remote config documents come from.
pub trait ConfigSource: Send + Sync {
    /// Fetch the latest document. `Ok(None)` means the server reports that
    /// `current_version` is still current.
    fn fetch(&self, current_version: Option<&str>) -> Result<Option<String>>;
}
