//! Physical plan: which node plays root, intermediate or leaf for a job.

use crate::{LinDbError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub indicator: String,
    /// Number of direct children.
    pub num_of_task: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intermediate {
    pub parent: String,
    pub indicator: String,
    /// Number of leaves reporting to this node.
    pub num_of_task: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    pub parent: String,
    pub indicator: String,
    pub shard_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    pub database: String,
    pub root: Root,
    pub intermediates: Vec<Intermediate>,
    pub leafs: Vec<Leaf>,
}

impl PhysicalPlan {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| LinDbError::UnmarshalPlan(e.to_string()))
    }

    pub fn leaf(&self, node: &str) -> Option<&Leaf> {
        self.leafs.iter().find(|l| l.indicator == node)
    }

    pub fn intermediate(&self, node: &str) -> Option<&Intermediate> {
        self.intermediates.iter().find(|i| i.indicator == node)
    }

    /// Leaves whose parent is `node`.
    pub fn leafs_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Leaf> + 'a {
        self.leafs.iter().filter(move |l| l.parent == node)
    }

    /// Checks that every node of the plan has somewhere to send to or
    /// report to: the root has children, every leaf's parent is the root or
    /// an intermediate, and every intermediate has leaves.
    pub fn validate(&self) -> Result<()> {
        if self.root_targets().is_empty() {
            return Err(LinDbError::InvalidPlan(format!(
                "root '{}' has no target node",
                self.root.indicator
            )));
        }
        for leaf in &self.leafs {
            let known = if self.intermediates.is_empty() {
                leaf.parent == self.root.indicator
            } else {
                self.intermediate(&leaf.parent).is_some()
            };
            if !known {
                return Err(LinDbError::InvalidPlan(format!(
                    "leaf '{}' reports to unknown node '{}'",
                    leaf.indicator, leaf.parent
                )));
            }
        }
        if let Some(i) = self
            .intermediates
            .iter()
            .find(|i| self.leafs_of(&i.indicator).next().is_none())
        {
            return Err(LinDbError::InvalidPlan(format!(
                "intermediate '{}' has no leaf",
                i.indicator
            )));
        }
        Ok(())
    }

    /// Nodes the root sends the job to.
    pub fn root_targets(&self) -> Vec<String> {
        if self.intermediates.is_empty() {
            self.leafs.iter().map(|l| l.indicator.clone()).collect()
        } else {
            self.intermediates.iter().map(|i| i.indicator.clone()).collect()
        }
    }
}

/// Builds physical plans from the shard placement of a database.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    database: String,
    root: String,
    intermediates: Vec<String>,
    leafs: Vec<(String, Vec<u32>)>,
}

impl PlanBuilder {
    pub fn new(database: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            root: root.into(),
            intermediates: Vec::new(),
            leafs: Vec::new(),
        }
    }

    pub fn intermediate(mut self, node: impl Into<String>) -> Self {
        self.intermediates.push(node.into());
        self
    }

    pub fn leaf(mut self, node: impl Into<String>, shard_ids: Vec<u32>) -> Self {
        self.leafs.push((node.into(), shard_ids));
        self
    }

    /// Without grouping, or without intermediate nodes, leaves report to the
    /// root directly. Otherwise leaves are spread round robin over the
    /// intermediates and intermediates without leaves are left out.
    pub fn build(self, grouping: bool) -> Result<PhysicalPlan> {
        if self.leafs.is_empty() {
            return Err(LinDbError::Query(format!(
                "database '{}' has no leaf node",
                self.database
            )));
        }

        if !grouping || self.intermediates.is_empty() {
            let leafs: Vec<Leaf> = self
                .leafs
                .into_iter()
                .map(|(indicator, shard_ids)| Leaf {
                    parent: self.root.clone(),
                    indicator,
                    shard_ids,
                })
                .collect();
            return Ok(PhysicalPlan {
                database: self.database,
                root: Root {
                    indicator: self.root,
                    num_of_task: leafs.len(),
                },
                intermediates: Vec::new(),
                leafs,
            });
        }

        let n = self.intermediates.len();
        let leafs: Vec<Leaf> = self
            .leafs
            .into_iter()
            .enumerate()
            .map(|(i, (indicator, shard_ids))| Leaf {
                parent: self.intermediates[i % n].clone(),
                indicator,
                shard_ids,
            })
            .collect();
        let intermediates: Vec<Intermediate> = self
            .intermediates
            .iter()
            .map(|node| Intermediate {
                parent: self.root.clone(),
                indicator: node.clone(),
                num_of_task: leafs.iter().filter(|l| &l.parent == node).count(),
            })
            .filter(|i| i.num_of_task > 0)
            .collect();
        Ok(PhysicalPlan {
            database: self.database,
            root: Root {
                indicator: self.root,
                num_of_task: intermediates.len(),
            },
            intermediates,
            leafs,
        })
    }
}
