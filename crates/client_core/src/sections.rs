use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use shared::domain::{Post, PostKey};

/// Position of one post inside its day bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SectionEntry {
    pub created_at: DateTime<Utc>,
    pub key: PostKey,
}

/// One local day of a channel's feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub date: NaiveDate,
    pub entries: Vec<SectionEntry>,
}

impl Section {
    pub fn keys(&self) -> impl Iterator<Item = &PostKey> {
        self.entries.iter().map(|entry| &entry.key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Day-bucketed read model of one channel, maintained incrementally from
/// merge outcomes.
#[derive(Debug, Clone)]
pub struct SectionIndex {
    offset: FixedOffset,
    sections: Vec<Section>,
    locations: HashMap<PostKey, NaiveDate>,
}

impl SectionIndex {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            sections: Vec::new(),
            locations: HashMap::new(),
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_of(&self, key: &PostKey) -> Option<NaiveDate> {
        self.locations.get(key).copied()
    }

    pub fn post_count(&self) -> usize {
        self.locations.len()
    }

    /// Local calendar day a post is bucketed under.
    pub fn bucket_date(&self, post: &Post) -> NaiveDate {
        post.created_at.with_timezone(&self.offset).date_naive()
    }

    /// Full rebuild, used once for a channel loaded from disk.
    pub fn rebuild(&mut self, posts: &[Post]) {
        self.sections.clear();
        self.locations.clear();
        for post in posts.iter().filter(|post| post.is_live()) {
            self.insert(post);
        }
    }

    /// Applies one merge outcome. `snapshot` is the post sequence after the
    /// merge; only the posts named in `changed` are looked at.
    pub fn apply_change(&mut self, changed: &[PostKey], removed: &[PostKey], snapshot: &[Post]) {
        for key in removed {
            self.remove(key);
        }
        if changed.is_empty() {
            return;
        }

        let wanted: HashSet<&PostKey> = changed.iter().collect();
        for post in snapshot.iter().filter(|post| wanted.contains(&post.key)) {
            self.remove(&post.key);
            if post.is_live() {
                self.insert(post);
            }
        }
    }

    fn insert(&mut self, post: &Post) {
        let date = self.bucket_date(post);
        let section_idx = match self.sections.binary_search_by(|s| s.date.cmp(&date)) {
            Ok(idx) => idx,
            Err(idx) => {
                self.sections.insert(
                    idx,
                    Section {
                        date,
                        entries: Vec::new(),
                    },
                );
                idx
            }
        };

        let entry = SectionEntry {
            created_at: post.created_at,
            key: post.key.clone(),
        };
        let entries = &mut self.sections[section_idx].entries;
        let pos = entries.binary_search(&entry).unwrap_or_else(|pos| pos);
        entries.insert(pos, entry);
        self.locations.insert(post.key.clone(), date);
    }

    fn remove(&mut self, key: &PostKey) {
        let Some(date) = self.locations.remove(key) else {
            return;
        };
        let Ok(section_idx) = self.sections.binary_search_by(|s| s.date.cmp(&date)) else {
            return;
        };
        let section = &mut self.sections[section_idx];
        section.entries.retain(|entry| &entry.key != key);
        if section.entries.is_empty() {
            self.sections.remove(section_idx);
        }
    }
}

#[cfg(test)]
#[path = "tests/sections_tests.rs"]
mod tests;
