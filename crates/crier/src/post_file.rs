//! JSON import format for posts.

use std::collections::BTreeMap;

use serde::Deserialize;

use crier_store::{Content, ContentOverride, Post};

/// A draft post as written by an operator.
///
/// ```json
/// {
///   "ownerId": "u1",
///   "text": "Launch day!",
///   "media": ["https://cdn.example/video.mp4"],
///   "targets": ["tiktok", "instagram"],
///   "overrides": { "instagram": { "text": "Launch day! Link in bio" } }
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostFile {
    pub owner_id: String,
    pub text: String,
    #[serde(default)]
    pub media: Vec<String>,
    pub targets: Vec<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, Content>,
}

impl PostFile {
    /// Build a fresh draft and its overrides.
    pub fn into_post(self) -> (Post, Vec<ContentOverride>) {
        let post = Post::draft(
            self.owner_id,
            Content::new(self.text, self.media),
            self.targets,
        );
        let overrides = self
            .overrides
            .into_iter()
            .map(|(target, content)| ContentOverride {
                post_id: post.id.clone(),
                target,
                content,
            })
            .collect();
        (post, overrides)
    }
}
