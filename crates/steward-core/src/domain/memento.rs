//! Memento - 永続化用のスナップショット表現
//!
//! `MementoSet` は全エンティティの memento と root id の manifest です。
//! 各 memento は 1 エンティティを親子 id 付きで完結して表現します。

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityConfig;
use super::errors::{Result, StewardError};
use super::ids::EntityId;
use super::lifecycle::Lifecycle;
use super::location::LocationHandle;
use super::policy::PolicySpec;
use super::value::AttributeValue;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMemento {
    pub value: AttributeValue,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMemento {
    pub id: EntityId,
    pub type_name: String,
    pub display_name: Option<String>,
    pub parent: Option<EntityId>,
    #[serde(default)]
    pub children: Vec<EntityId>,
    #[serde(default)]
    pub config: EntityConfig,
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeMemento>,
    pub location: Option<LocationHandle>,
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MementoSet {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub roots: Vec<EntityId>,
    pub entities: Vec<EntityMemento>,
}

impl MementoSet {
    pub fn get(&self, id: EntityId) -> Option<&EntityMemento> {
        self.entities.iter().find(|m| m.id == id)
    }

    /// Structural checks that need no type registry.
    ///
    /// - format version and duplicate ids → `MalformedMemento`
    /// - parent / child / root ids that point nowhere → `DanglingReference`
    /// - parent and child lists that disagree, or cycles → `MalformedMemento`
    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(StewardError::MalformedMemento(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        let mut ids = HashSet::new();
        for m in &self.entities {
            if !ids.insert(m.id) {
                return Err(StewardError::MalformedMemento(format!("duplicate entity {}", m.id)));
            }
        }

        for root in &self.roots {
            let Some(m) = self.get(*root) else {
                return Err(StewardError::DanglingReference(format!("root {root}")));
            };
            if m.parent.is_some() {
                return Err(StewardError::MalformedMemento(format!("root {root} has a parent")));
            }
        }

        for m in &self.entities {
            match m.parent {
                None if !self.roots.contains(&m.id) => {
                    return Err(StewardError::MalformedMemento(format!(
                        "{} has no parent and is not a root",
                        m.id
                    )));
                }
                Some(parent) => {
                    let Some(p) = self.get(parent) else {
                        return Err(StewardError::DanglingReference(format!(
                            "parent {parent} of {}",
                            m.id
                        )));
                    };
                    if !p.children.contains(&m.id) {
                        return Err(StewardError::MalformedMemento(format!(
                            "{parent} does not list child {}",
                            m.id
                        )));
                    }
                }
                None => {}
            }
            for child in &m.children {
                let Some(c) = self.get(*child) else {
                    return Err(StewardError::DanglingReference(format!(
                        "child {child} of {}",
                        m.id
                    )));
                };
                if c.parent != Some(m.id) {
                    return Err(StewardError::MalformedMemento(format!(
                        "{child} does not point back to {}",
                        m.id
                    )));
                }
            }
        }

        // every entity must be reachable from a root, otherwise there is a cycle
        if self.ordered().len() != self.entities.len() {
            return Err(StewardError::MalformedMemento("entity graph has a cycle".into()));
        }
        Ok(())
    }

    /// Parent-before-child order, following each parent's child list.
    pub fn ordered(&self) -> Vec<&EntityMemento> {
        let mut out = Vec::with_capacity(self.entities.len());
        let mut seen = HashSet::new();
        let mut stack: Vec<EntityId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(m) = self.get(id) {
                out.push(m);
                stack.extend(m.children.iter().rev().copied());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memento(id: EntityId, parent: Option<EntityId>, children: Vec<EntityId>) -> EntityMemento {
        EntityMemento {
            id,
            type_name: "t".into(),
            display_name: None,
            parent,
            children,
            config: EntityConfig::default(),
            lifecycle: Lifecycle::Created,
            attributes: BTreeMap::new(),
            location: None,
            policies: Vec::new(),
        }
    }

    fn set(roots: Vec<EntityId>, entities: Vec<EntityMemento>) -> MementoSet {
        MementoSet {
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
            roots,
            entities,
        }
    }

    #[test]
    fn ordered_puts_parents_first() {
        let (a, b, c) = (EntityId::generate(), EntityId::generate(), EntityId::generate());
        let s = set(
            vec![a],
            vec![memento(c, Some(b), vec![]), memento(b, Some(a), vec![c]), memento(a, None, vec![b])],
        );
        s.validate().unwrap();
        let order: Vec<_> = s.ordered().iter().map(|m| m.id).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn missing_child_is_dangling() {
        let (a, ghost) = (EntityId::generate(), EntityId::generate());
        let s = set(vec![a], vec![memento(a, None, vec![ghost])]);
        assert!(matches!(s.validate(), Err(StewardError::DanglingReference(_))));
    }

    #[test]
    fn missing_parent_is_dangling() {
        let (a, ghost) = (EntityId::generate(), EntityId::generate());
        let s = set(vec![], vec![memento(a, Some(ghost), vec![])]);
        assert!(matches!(s.validate(), Err(StewardError::DanglingReference(_))));
    }

    #[test]
    fn duplicate_ids_are_malformed() {
        let a = EntityId::generate();
        let s = set(vec![a], vec![memento(a, None, vec![]), memento(a, None, vec![])]);
        assert!(matches!(s.validate(), Err(StewardError::MalformedMemento(_))));
    }

    #[test]
    fn survives_json() {
        let a = EntityId::generate();
        let mut m = memento(a, None, vec![]);
        m.attributes.insert(
            "x".into(),
            AttributeMemento {
                value: AttributeValue::Integer(3),
                sequence: 4,
            },
        );
        let s = set(vec![a], vec![m]);
        let back: MementoSet = serde_json::from_str(&serde_json::to_string(&s).unwrap()).unwrap();
        assert_eq!(back, s);
    }
}
