//! Node selectors and node membership matching

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cluster node as seen by the partitioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name (unique, also the carve-out ordering key)
    pub name: String,
    /// Node labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Builder: add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Operator of a selector expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One `matchExpressions` requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
            SelectorOperator::In => value.map_or(false, |v| self.values.contains(v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
        }
    }
}

/// Node selector of a pool; all terms are ANDed, an empty selector matches every node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl NodeSelector {
    /// Selector matching every node
    pub fn everything() -> Self {
        Self::default()
    }

    /// Builder: require a label value
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Builder: add an expression
    pub fn with_expression(
        mut self,
        key: impl Into<String>,
        operator: SelectorOperator,
        values: Vec<String>,
    ) -> Self {
        self.match_expressions.push(SelectorRequirement {
            key: key.into(),
            operator,
            values,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, node: &NodeInfo) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| node.labels.get(k) == Some(v))
            && self
                .match_expressions
                .iter()
                .all(|req| req.matches(&node.labels))
    }

    /// Names of matching nodes, sorted
    pub fn members<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeInfo>) -> Vec<String> {
        let mut names: Vec<String> = nodes
            .into_iter()
            .filter(|node| self.matches(node))
            .map(|node| node.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Structural checks applied at pool admission
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        for req in &self.match_expressions {
            if req.key.is_empty() {
                return Err("selector expression with empty key".to_string());
            }
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn if req.values.is_empty() => {
                    return Err(format!(
                        "selector expression on {} requires values for {:?}",
                        req.key, req.operator
                    ));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !req.values.is_empty() =>
                {
                    return Err(format!(
                        "selector expression on {} must not carry values for {:?}",
                        req.key, req.operator
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_selector_matches_all() {
        let selector = NodeSelector::everything();
        assert!(selector.matches(&NodeInfo::new("n1")));
    }

    #[test]
    fn test_match_labels() {
        let selector = NodeSelector::default().with_label("rack", "a");
        assert!(selector.matches(&NodeInfo::new("n1").with_label("rack", "a")));
        assert!(!selector.matches(&NodeInfo::new("n2").with_label("rack", "b")));
        assert!(!selector.matches(&NodeInfo::new("n3")));
    }

    #[test]
    fn test_expressions() {
        let selector = NodeSelector::default()
            .with_expression("gpu", SelectorOperator::Exists, vec![])
            .with_expression("zone", SelectorOperator::NotIn, vec!["z9".into()]);

        assert!(selector.matches(&NodeInfo::new("n1").with_label("gpu", "a100")));
        assert!(!selector.matches(
            &NodeInfo::new("n2")
                .with_label("gpu", "a100")
                .with_label("zone", "z9")
        ));
        assert!(!selector.matches(&NodeInfo::new("n3")));
    }

    #[test]
    fn test_members_sorted() {
        let nodes = vec![
            NodeInfo::new("c").with_label("ipam", "on"),
            NodeInfo::new("a").with_label("ipam", "on"),
            NodeInfo::new("b"),
        ];
        let selector = NodeSelector::default().with_label("ipam", "on");
        assert_eq!(selector.members(&nodes), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_validate_rejects_in_without_values() {
        let selector = NodeSelector::default().with_expression("zone", SelectorOperator::In, vec![]);
        assert!(selector.validate().is_err());
    }
}
