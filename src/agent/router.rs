//! Pure-function message routing on top of the agent tree.
//!
//! No mutable state, no I/O. Validates one-hop reachability and resolves
//! broadcast targets. One-hop means parent, children, or team; the SYSTEM
//! and USER sentinels bypass the hop check but must pair with a real agent
//! on the other side.

use std::collections::HashSet;

use uuid::Uuid;

use crate::agent::message::is_sentinel;
use crate::agent::tree::AgentTree;
use crate::error::{SubstratError, SubstratResult};

/// The set of agent ids reachable in one hop (parent + children + siblings).
/// Does not include `agent_id` itself.
pub fn reachable_set(tree: &AgentTree, agent_id: Uuid) -> SubstratResult<HashSet<Uuid>> {
    let node = tree.get(agent_id)?;
    let mut result = HashSet::new();
    if let Some(parent_id) = node.parent_id {
        result.insert(parent_id);
    }
    result.extend(node.children.iter().copied());
    for sibling in tree.team(agent_id)? {
        result.insert(sibling.id);
    }
    Ok(result)
}

/// Fault with [`SubstratError::RouteInvalid`] if `sender` cannot reach
/// `recipient`.
pub fn validate_route(tree: &AgentTree, sender: Uuid, recipient: Uuid) -> SubstratResult<()> {
    if sender == recipient {
        return Err(SubstratError::RouteInvalid("self-delivery".into()));
    }
    if is_sentinel(sender) && is_sentinel(recipient) {
        return Err(SubstratError::RouteInvalid(
            "sentinels must pair with a real agent".into(),
        ));
    }
    if is_sentinel(sender) {
        if !tree.contains(recipient) {
            return Err(SubstratError::RouteInvalid(format!(
                "recipient {} not in tree",
                recipient.simple()
            )));
        }
        return Ok(());
    }
    if is_sentinel(recipient) {
        if !tree.contains(sender) {
            return Err(SubstratError::RouteInvalid(format!(
                "sender {} not in tree",
                sender.simple()
            )));
        }
        return Ok(());
    }
    if !tree.contains(recipient) {
        return Err(SubstratError::RouteInvalid(format!(
            "recipient {} not in tree",
            recipient.simple()
        )));
    }
    if !tree.contains(sender) {
        return Err(SubstratError::RouteInvalid(format!(
            "sender {} not in tree",
            sender.simple()
        )));
    }
    if !reachable_set(tree, sender)?.contains(&recipient) {
        return Err(SubstratError::RouteInvalid(format!(
            "{} cannot reach {}",
            sender.simple(),
            recipient.simple()
        )));
    }
    Ok(())
}

/// Sibling ids for a broadcast from `sender`. Sentinels cannot broadcast
/// (they have no position in the tree). An empty team is not a fault; the
/// broadcast simply reaches nobody.
pub fn resolve_broadcast(tree: &AgentTree, sender: Uuid) -> SubstratResult<Vec<Uuid>> {
    if is_sentinel(sender) {
        return Err(SubstratError::RouteInvalid("sentinels cannot broadcast".into()));
    }
    if !tree.contains(sender) {
        return Err(SubstratError::RouteInvalid(format!(
            "sender {} not in tree",
            sender.simple()
        )));
    }
    Ok(tree.team(sender)?.iter().map(|n| n.id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::{SYSTEM, USER};
    use crate::agent::node::AgentNode;

    /// g -> p -> (c1, c2)
    fn chain() -> (AgentTree, Uuid, Uuid, Uuid, Uuid) {
        let mut tree = AgentTree::new();
        let g = AgentNode::new(Uuid::new_v4(), "g");
        let p = AgentNode::new(Uuid::new_v4(), "p").with_parent(g.id);
        let c1 = AgentNode::new(Uuid::new_v4(), "c1").with_parent(p.id);
        let c2 = AgentNode::new(Uuid::new_v4(), "c2").with_parent(p.id);
        let (gid, pid, c1id, c2id) = (g.id, p.id, c1.id, c2.id);
        tree.add(g).unwrap();
        tree.add(p).unwrap();
        tree.add(c1).unwrap();
        tree.add(c2).unwrap();
        (tree, gid, pid, c1id, c2id)
    }

    #[test]
    fn reachable_is_parent_children_team() {
        let (tree, g, p, c1, c2) = chain();
        let reach = reachable_set(&tree, c1).unwrap();
        assert!(reach.contains(&p));
        assert!(reach.contains(&c2));
        assert!(!reach.contains(&g));
        assert!(!reach.contains(&c1));

        let reach = reachable_set(&tree, p).unwrap();
        assert!(reach.contains(&g));
        assert!(reach.contains(&c1));
        assert!(reach.contains(&c2));
    }

    #[test]
    fn one_hop_routes_validate() {
        let (tree, g, p, c1, c2) = chain();
        validate_route(&tree, p, g).unwrap();
        validate_route(&tree, p, c1).unwrap();
        validate_route(&tree, c1, c2).unwrap();
    }

    #[test]
    fn grandchild_route_is_invalid() {
        let (tree, g, _p, c1, _c2) = chain();
        let err = validate_route(&tree, g, c1).unwrap_err();
        assert!(matches!(err, SubstratError::RouteInvalid(_)));
        let err = validate_route(&tree, c1, g).unwrap_err();
        assert!(matches!(err, SubstratError::RouteInvalid(_)));
    }

    #[test]
    fn self_delivery_rejected() {
        let (tree, g, ..) = chain();
        assert!(validate_route(&tree, g, g).is_err());
    }

    #[test]
    fn sentinels_bypass_hop_check() {
        let (tree, _g, _p, c1, _c2) = chain();
        validate_route(&tree, SYSTEM, c1).unwrap();
        validate_route(&tree, USER, c1).unwrap();
        validate_route(&tree, c1, SYSTEM).unwrap();
        validate_route(&tree, c1, USER).unwrap();
    }

    #[test]
    fn sentinel_pairs_need_a_real_agent() {
        let (tree, ..) = chain();
        assert!(validate_route(&tree, SYSTEM, USER).is_err());
        assert!(validate_route(&tree, SYSTEM, Uuid::new_v4()).is_err());
        assert!(validate_route(&tree, Uuid::new_v4(), USER).is_err());
    }

    #[test]
    fn broadcast_resolves_team() {
        let (tree, _g, _p, c1, c2) = chain();
        assert_eq!(resolve_broadcast(&tree, c1).unwrap(), vec![c2]);
    }

    #[test]
    fn broadcast_with_no_siblings_is_empty() {
        let (tree, g, p, ..) = chain();
        assert!(resolve_broadcast(&tree, g).unwrap().is_empty());
        assert!(resolve_broadcast(&tree, p).unwrap().is_empty());
    }

    #[test]
    fn sentinels_cannot_broadcast() {
        let (tree, ..) = chain();
        assert!(resolve_broadcast(&tree, SYSTEM).is_err());
    }
}
