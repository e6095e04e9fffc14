//! Per-target content resolution.

use crier_store::{Content, ContentOverride, Post};

/// Content to send to `target`: its override if one exists, otherwise the base content.
///
/// An override replaces text and media together; nothing is merged.
pub fn effective_content(post: &Post, overrides: &[ContentOverride], target: &str) -> Content {
    overrides
        .iter()
        .find(|o| o.post_id == post.id && o.target == target)
        .map(|o| o.content.clone())
        .unwrap_or_else(|| post.content.clone())
}
