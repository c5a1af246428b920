//! Index group partitioner
//!
//! Classifies indices into named groups using ordered regex rules. The first
//! matching rule wins; indices that match nothing land in the implicit
//! default group, so classification is total.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::{ConfigError, GroupRule};

/// Name of the catch-all group
pub const DEFAULT_GROUP: &str = "default";

/// Group name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A balancing group and the copy kinds it scores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub includes_primaries: bool,
    pub includes_replicas: bool,
}

impl Group {
    /// Whether a copy of the given kind counts toward this group's load
    pub fn in_scope(&self, primary: bool) -> bool {
        if primary {
            self.includes_primaries
        } else {
            self.includes_replicas
        }
    }

    /// Report label, e.g. `logs pr`
    pub fn label(&self) -> String {
        format!(
            "{} {}{}",
            self.id,
            if self.includes_primaries { "p" } else { "" },
            if self.includes_replicas { "r" } else { "" }
        )
    }
}

/// Ordered pattern classifier
#[derive(Debug, Clone)]
pub struct IndexGroupPartitioner {
    rules: Vec<(Regex, Group)>,
    default_group: Group,
}

impl IndexGroupPartitioner {
    /// Compile the rules; any malformed pattern fails here
    pub fn new(rules: &[GroupRule]) -> Result<Self, ConfigError> {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut flags_by_name: BTreeMap<&str, (bool, bool)> = BTreeMap::new();

        for rule in rules {
            if !rule.primaries && !rule.replicas {
                return Err(ConfigError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    reason: "group must include primaries, replicas or both".to_string(),
                });
            }

            let flags = (rule.primaries, rule.replicas);
            if let Some(existing) = flags_by_name.insert(rule.group_name(), flags) {
                if existing != flags {
                    return Err(ConfigError::InvalidPattern {
                        pattern: rule.pattern.clone(),
                        reason: format!(
                            "group {} is declared with conflicting primary/replica scope",
                            rule.group_name()
                        ),
                    });
                }
            }

            let regex = Regex::new(&format!("^(?:{})$", rule.pattern)).map_err(|e| {
                ConfigError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    reason: e.to_string(),
                }
            })?;

            compiled.push((
                regex,
                Group {
                    id: GroupId::new(rule.group_name()),
                    includes_primaries: rule.primaries,
                    includes_replicas: rule.replicas,
                },
            ));
        }

        Ok(Self {
            rules: compiled,
            default_group: Group {
                id: GroupId::new(DEFAULT_GROUP),
                includes_primaries: true,
                includes_replicas: true,
            },
        })
    }

    /// Group for an index name
    pub fn classify(&self, index: &str) -> &Group {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(index))
            .map(|(_, group)| group)
            .unwrap_or(&self.default_group)
    }

    /// Group name to sorted index names, for reporting
    pub fn group_mapping<'a, I>(&self, indices: I) -> BTreeMap<GroupId, Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut mapping: BTreeMap<GroupId, BTreeSet<String>> = BTreeMap::new();
        for index in indices {
            mapping
                .entry(self.classify(index).id.clone())
                .or_default()
                .insert(index.to_string());
        }

        mapping
            .into_iter()
            .map(|(group, names)| (group, names.into_iter().collect()))
            .collect()
    }
}
