//! Extension-based MIME type lookup.

/// Returned for names without a known extension.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// MIME type for `name`, judged by its extension only.
pub fn mime_type_for(name: &str) -> &'static str {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return DEFAULT_MIME_TYPE;
    };
    // ".bashrc" style names and trailing path segments have no extension
    if stem.is_empty() || stem.ends_with('/') || ext.is_empty() || ext.contains('/') {
        return DEFAULT_MIME_TYPE;
    }
    mime_guess::from_ext(ext)
        .first_raw()
        .unwrap_or(DEFAULT_MIME_TYPE)
}
