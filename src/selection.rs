use crate::identity::CurrentIdentity;
use crate::reference::{Reference, TagOrDigest};

/// Who caused a selection change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The user picked an item in a list
    User,
    /// The synchronizer mirrored a completed load
    Synchronizer,
    /// The coordinator reset state (disconnect, delete)
    Coordinator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionChanged {
    Repository { name: Option<String>, origin: Origin },
    Tag { name: Option<String>, origin: Origin },
}

impl SelectionChanged {
    pub fn origin(&self) -> Origin {
        match self {
            SelectionChanged::Repository { origin, .. } | SelectionChanged::Tag { origin, .. } => {
                *origin
            }
        }
    }
}

/// A tag in the tag list, with the digest it resolved to if known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub name: String,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSnapshot {
    pub repositories: Vec<String>,
    /// Repository the tag list belongs to
    pub tags_repository: Option<String>,
    pub tags: Vec<TagEntry>,
    pub selected_repository: Option<String>,
    pub selected_tag: Option<String>,
}

/// Keeps repository and tag selection in line with the loaded manifest.
///
/// Changes made here are reported with [`Origin::Synchronizer`] and never
/// count as user selections, so mirroring a load can't start another load.
#[derive(Debug, Default)]
pub struct SelectionSync {
    state: SelectionSnapshot,
    suppress_next: bool,
}

impl SelectionSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SelectionSnapshot {
        self.state.clone()
    }

    pub fn tags_repository(&self) -> Option<&str> {
        self.state.tags_repository.as_deref()
    }

    pub fn set_repositories(&mut self, mut repositories: Vec<String>) {
        repositories.sort();
        self.state.repositories = repositories;
    }

    /// Replace the tag list. Known digests survive for tags still present; the
    /// tag selection survives only if the repository is the same and the tag
    /// still exists.
    pub fn set_tags(&mut self, repository: &str, names: Vec<String>) -> Option<SelectionChanged> {
        let same_repository = self.state.tags_repository.as_deref() == Some(repository);
        let previous = std::mem::take(&mut self.state.tags);

        self.state.tags = names
            .into_iter()
            .map(|name| {
                let digest = previous
                    .iter()
                    .filter(|_| same_repository)
                    .find(|entry| entry.name == name)
                    .and_then(|entry| entry.digest.clone());
                TagEntry { name, digest }
            })
            .collect();
        self.state.tags_repository = Some(repository.to_string());

        let keep = same_repository
            && self
                .state
                .selected_tag
                .as_ref()
                .is_some_and(|tag| self.find_tag(tag).is_some());
        if !keep && self.state.selected_tag.is_some() {
            self.state.selected_tag = None;
            return Some(SelectionChanged::Tag {
                name: None,
                origin: Origin::Synchronizer,
            });
        }
        None
    }

    /// Remember which digest a tag resolved to
    pub fn record_tag_digest(&mut self, tag: &str, digest: &str) {
        if let Some(index) = self.find_tag(tag) {
            self.state.tags[index].digest = Some(digest.to_string());
        }
    }

    /// The next user tag selection will not start a load
    pub fn suppress_next_auto_load(&mut self) {
        self.suppress_next = true;
    }

    /// Apply a user tag pick. Returns the change and whether it should load.
    pub fn user_select_tag(&mut self, name: &str) -> (SelectionChanged, bool) {
        let auto_load = !std::mem::take(&mut self.suppress_next);
        let name = self
            .find_tag(name)
            .map(|index| self.state.tags[index].name.clone())
            .unwrap_or_else(|| name.to_string());
        self.state.selected_tag = Some(name.clone());
        (
            SelectionChanged::Tag {
                name: Some(name),
                origin: Origin::User,
            },
            auto_load,
        )
    }

    /// Apply a user repository pick; the tag list now belongs to another repository
    pub fn user_select_repository(&mut self, name: &str) -> SelectionChanged {
        let name = self
            .state
            .repositories
            .iter()
            .find(|repo| repo.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string());
        self.state.selected_repository = Some(name.clone());
        SelectionChanged::Repository {
            name: Some(name),
            origin: Origin::User,
        }
    }

    /// Mirror a completed load into the selection
    pub fn sync_to(
        &mut self,
        identity: &CurrentIdentity,
        reference: &Reference,
    ) -> Vec<SelectionChanged> {
        let mut changes = Vec::new();

        let repository = self
            .state
            .repositories
            .iter()
            .find(|repo| repo.eq_ignore_ascii_case(&identity.repository))
            .cloned();
        if let Some(repository) = repository {
            if self.state.selected_repository.as_deref() != Some(repository.as_str()) {
                self.state.selected_repository = Some(repository.clone());
                changes.push(SelectionChanged::Repository {
                    name: Some(repository),
                    origin: Origin::Synchronizer,
                });
            }
        }

        let tags_match_repository =
            self.state.tags_repository.as_deref() == Some(identity.repository.as_str());

        let target = match reference.content() {
            TagOrDigest::Tag(tag) => {
                if !tags_match_repository {
                    return changes;
                }
                self.record_tag_digest(tag, &identity.manifest_digest);
                match self.find_tag(tag) {
                    Some(index) => Some(self.state.tags[index].name.clone()),
                    // tag list not loaded yet or tag missing: leave selection alone
                    None => return changes,
                }
            }
            TagOrDigest::Digest(_) => {
                if tags_match_repository {
                    self.state
                        .tags
                        .iter()
                        .find(|entry| entry.digest.as_deref() == Some(identity.manifest_digest.as_str()))
                        .map(|entry| entry.name.clone())
                } else {
                    None
                }
            }
        };

        if self.state.selected_tag != target {
            self.state.selected_tag = target.clone();
            changes.push(SelectionChanged::Tag {
                name: target,
                origin: Origin::Synchronizer,
            });
        }
        changes
    }

    /// Forget a deleted manifest's digest
    pub fn forget_digest(&mut self, digest: &str) {
        for entry in &mut self.state.tags {
            if entry.digest.as_deref() == Some(digest) {
                entry.digest = None;
            }
        }
    }

    /// Drop all lists and selections
    pub fn clear(&mut self) -> Vec<SelectionChanged> {
        let mut changes = Vec::new();
        if self.state.selected_repository.is_some() {
            changes.push(SelectionChanged::Repository {
                name: None,
                origin: Origin::Coordinator,
            });
        }
        if self.state.selected_tag.is_some() {
            changes.push(SelectionChanged::Tag {
                name: None,
                origin: Origin::Coordinator,
            });
        }
        self.state = SelectionSnapshot::default();
        self.suppress_next = false;
        changes
    }

    fn find_tag(&self, name: &str) -> Option<usize> {
        self.state
            .tags
            .iter()
            .position(|entry| entry.name.eq_ignore_ascii_case(name))
    }
}
