//! Agent tree: pure in-memory hierarchy with structural queries.
//!
//! No routing, no persistence, no I/O. The tree is derived state: it is
//! rebuilt on startup from per-session `agent.created` / `agent.terminated`
//! events, so nothing here touches disk.

use std::collections::HashMap;

use uuid::Uuid;

use crate::agent::node::AgentNode;
use crate::error::{SubstratError, SubstratResult};

#[derive(Default)]
pub struct AgentTree {
    nodes: HashMap<Uuid, AgentNode>,
    by_session: HashMap<Uuid, Uuid>,
}

impl AgentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Faults if the id already exists, the parent is
    /// missing, or a sibling already carries the name. Roots are mutual
    /// siblings for name-uniqueness purposes.
    pub fn add(&mut self, node: AgentNode) -> SubstratResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(SubstratError::Other(anyhow::anyhow!(
                "duplicate agent id: {}",
                node.id.simple()
            )));
        }
        match node.parent_id {
            Some(parent_id) => {
                let parent = self.nodes.get(&parent_id).ok_or_else(|| {
                    SubstratError::NotFound(format!("parent {}", parent_id.simple()))
                })?;
                if !node.name.is_empty() {
                    self.check_name_collision(&node.name, &parent.children)?;
                }
                self.nodes
                    .get_mut(&parent_id)
                    .expect("parent existence checked above")
                    .children
                    .push(node.id);
            }
            None => {
                if !node.name.is_empty() {
                    let root_ids: Vec<Uuid> = self
                        .nodes
                        .values()
                        .filter(|n| n.parent_id.is_none())
                        .map(|n| n.id)
                        .collect();
                    self.check_name_collision(&node.name, &root_ids)?;
                }
            }
        }
        self.by_session.insert(node.session_id, node.id);
        self.nodes.insert(node.id, node);
        Ok(())
    }

    /// Remove a leaf node and return it. Faults if missing or non-leaf.
    pub fn remove(&mut self, agent_id: Uuid) -> SubstratResult<AgentNode> {
        let node = self.get(agent_id)?;
        if !node.children.is_empty() {
            return Err(SubstratError::Other(anyhow::anyhow!(
                "agent {} has children; remove them first",
                agent_id.simple()
            )));
        }
        let parent_id = node.parent_id;
        let node = self.nodes.remove(&agent_id).expect("checked above");
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                parent.children.retain(|c| *c != agent_id);
            }
        }
        self.by_session.remove(&node.session_id);
        Ok(node)
    }

    pub fn get(&self, agent_id: Uuid) -> SubstratResult<&AgentNode> {
        self.nodes
            .get(&agent_id)
            .ok_or_else(|| SubstratError::NotFound(format!("agent {}", agent_id.simple())))
    }

    pub fn get_mut(&mut self, agent_id: Uuid) -> SubstratResult<&mut AgentNode> {
        self.nodes
            .get_mut(&agent_id)
            .ok_or_else(|| SubstratError::NotFound(format!("agent {}", agent_id.simple())))
    }

    pub fn contains(&self, agent_id: Uuid) -> bool {
        self.nodes.contains_key(&agent_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The parent node, or None for roots.
    pub fn parent(&self, agent_id: Uuid) -> SubstratResult<Option<&AgentNode>> {
        let node = self.get(agent_id)?;
        Ok(match node.parent_id {
            Some(pid) => self.nodes.get(&pid),
            None => None,
        })
    }

    /// Direct children, in spawn order.
    pub fn children(&self, agent_id: Uuid) -> SubstratResult<Vec<&AgentNode>> {
        let node = self.get(agent_id)?;
        Ok(node
            .children
            .iter()
            .filter_map(|cid| self.nodes.get(cid))
            .collect())
    }

    /// Siblings excluding self. Empty for roots.
    pub fn team(&self, agent_id: Uuid) -> SubstratResult<Vec<&AgentNode>> {
        let node = self.get(agent_id)?;
        let Some(parent_id) = node.parent_id else {
            return Ok(Vec::new());
        };
        let parent = self.get(parent_id)?;
        Ok(parent
            .children
            .iter()
            .filter(|cid| **cid != agent_id)
            .filter_map(|cid| self.nodes.get(cid))
            .collect())
    }

    /// All root nodes (no parent).
    pub fn roots(&self) -> Vec<&AgentNode> {
        self.nodes.values().filter(|n| n.parent_id.is_none()).collect()
    }

    /// All descendants depth-first. Does not include the node itself.
    pub fn subtree(&self, agent_id: Uuid) -> SubstratResult<Vec<&AgentNode>> {
        let node = self.get(agent_id)?;
        let mut result = Vec::new();
        let mut stack: Vec<Uuid> = node.children.iter().rev().copied().collect();
        while let Some(nid) = stack.pop() {
            let child = self.get(nid)?;
            result.push(child);
            stack.extend(child.children.iter().rev().copied());
        }
        Ok(result)
    }

    /// Resolve a name within one team: the children of `parent_id`, or the
    /// roots when `parent_id` is None.
    pub fn by_name(&self, parent_id: Option<Uuid>, name: &str) -> Option<Uuid> {
        match parent_id {
            Some(pid) => self
                .nodes
                .get(&pid)?
                .children
                .iter()
                .find(|cid| self.nodes.get(cid).is_some_and(|n| n.name == name))
                .copied(),
            None => self
                .nodes
                .values()
                .find(|n| n.parent_id.is_none() && n.name == name)
                .map(|n| n.id),
        }
    }

    /// The agent backed by a session, if any.
    pub fn by_session(&self, session_id: Uuid) -> Option<Uuid> {
        self.by_session.get(&session_id).copied()
    }

    fn check_name_collision(&self, name: &str, sibling_ids: &[Uuid]) -> SubstratResult<()> {
        for sid in sibling_ids {
            if self.nodes.get(sid).is_some_and(|n| n.name == name) {
                return Err(SubstratError::NameConflict(format!(
                    "sibling name collision: {name:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> AgentNode {
        AgentNode::new(Uuid::new_v4(), name)
    }

    fn child_of(parent: &AgentNode, name: &str) -> AgentNode {
        node(name).with_parent(parent.id)
    }

    /// root -> (p1 -> (c1, c2), p2)
    fn sample_tree() -> (AgentTree, AgentNode, AgentNode, AgentNode, AgentNode, AgentNode) {
        let mut tree = AgentTree::new();
        let root = node("root");
        let p1 = child_of(&root, "p1");
        let p2 = child_of(&root, "p2");
        let c1 = child_of(&p1, "c1");
        let c2 = child_of(&p1, "c2");
        tree.add(root.clone()).unwrap();
        tree.add(p1.clone()).unwrap();
        tree.add(p2.clone()).unwrap();
        tree.add(c1.clone()).unwrap();
        tree.add(c2.clone()).unwrap();
        (tree, root, p1, p2, c1, c2)
    }

    #[test]
    fn add_and_query() {
        let (tree, root, p1, p2, c1, c2) = sample_tree();
        assert_eq!(tree.len(), 5);
        assert!(tree.contains(root.id));

        assert_eq!(tree.parent(c1.id).unwrap().unwrap().id, p1.id);
        assert!(tree.parent(root.id).unwrap().is_none());

        let children: Vec<Uuid> = tree.children(p1.id).unwrap().iter().map(|n| n.id).collect();
        assert_eq!(children, vec![c1.id, c2.id]);

        let team: Vec<Uuid> = tree.team(c1.id).unwrap().iter().map(|n| n.id).collect();
        assert_eq!(team, vec![c2.id]);
        assert!(tree.team(root.id).unwrap().is_empty());

        assert_eq!(tree.roots().len(), 1);

        let subtree: Vec<Uuid> = tree.subtree(root.id).unwrap().iter().map(|n| n.id).collect();
        assert_eq!(subtree, vec![p1.id, c1.id, c2.id, p2.id]);
    }

    #[test]
    fn add_missing_parent_faults() {
        let mut tree = AgentTree::new();
        let orphan = node("x").with_parent(Uuid::new_v4());
        assert!(matches!(
            tree.add(orphan).unwrap_err(),
            SubstratError::NotFound(_)
        ));
    }

    #[test]
    fn sibling_name_collision_faults() {
        let (mut tree, _root, p1, _p2, _c1, _c2) = sample_tree();
        let dup = node("c1").with_parent(p1.id);
        assert!(matches!(
            tree.add(dup).unwrap_err(),
            SubstratError::NameConflict(_)
        ));
    }

    #[test]
    fn root_names_are_mutually_unique() {
        let mut tree = AgentTree::new();
        tree.add(node("main")).unwrap();
        assert!(matches!(
            tree.add(node("main")).unwrap_err(),
            SubstratError::NameConflict(_)
        ));
        // Same name is fine under different parents.
        let (mut tree, _root, p1, p2, _c1, _c2) = sample_tree();
        tree.add(node("w").with_parent(p1.id)).unwrap();
        tree.add(node("w").with_parent(p2.id)).unwrap();
    }

    #[test]
    fn remove_leaf_only() {
        let (mut tree, _root, p1, _p2, c1, _c2) = sample_tree();
        assert!(tree.remove(p1.id).is_err());

        let removed = tree.remove(c1.id).unwrap();
        assert_eq!(removed.id, c1.id);
        assert!(!tree.contains(c1.id));
        assert!(!tree.get(p1.id).unwrap().children.contains(&c1.id));
    }

    #[test]
    fn remove_missing_faults() {
        let mut tree = AgentTree::new();
        assert!(matches!(
            tree.remove(Uuid::new_v4()).unwrap_err(),
            SubstratError::NotFound(_)
        ));
    }

    #[test]
    fn by_name_scopes_to_team() {
        let (tree, root, p1, _p2, c1, _c2) = sample_tree();
        assert_eq!(tree.by_name(Some(p1.id), "c1"), Some(c1.id));
        assert_eq!(tree.by_name(Some(root.id), "c1"), None);
        assert_eq!(tree.by_name(None, "root"), Some(root.id));
        assert_eq!(tree.by_name(None, "p1"), None);
    }

    #[test]
    fn by_session_index_tracks_add_remove() {
        let (mut tree, _root, _p1, _p2, c1, _c2) = sample_tree();
        assert_eq!(tree.by_session(c1.session_id), Some(c1.id));
        tree.remove(c1.id).unwrap();
        assert_eq!(tree.by_session(c1.session_id), None);
    }

    #[test]
    fn duplicate_id_faults() {
        let mut tree = AgentTree::new();
        let a = node("a");
        tree.add(a.clone()).unwrap();
        assert!(tree.add(a).is_err());
    }
}
