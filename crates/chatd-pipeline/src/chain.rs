//! Chain: the contexts issued for one client action.

use chatd_core::ClientId;

use crate::ctx::Ctx;

/// Ordered contexts in send order. Sealed into one queue entry by
/// [`Pipeline::chain_done`](crate::Pipeline::chain_done).
pub struct Chain<E> {
    nodes: Vec<Ctx<E>>,
}

impl<E> Chain<E> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn push(&mut self, ctx: Ctx<E>) {
        self.nodes.push(ctx);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Oldest node still waiting for its result.
    pub fn first_pending_mut(&mut self) -> Option<&mut Ctx<E>> {
        self.nodes.iter_mut().find(|c| c.is_pending())
    }

    /// Every node has its result.
    pub fn is_resolved(&self) -> bool {
        self.nodes.iter().all(|c| !c.is_pending())
    }

    /// Distinct owners in first-seen order.
    pub fn owners(&self) -> Vec<(ClientId, &'static str)> {
        let mut out: Vec<(ClientId, &'static str)> = Vec::new();
        for ctx in &self.nodes {
            if let Some(owner) = ctx.owner() {
                if !out.iter().any(|(o, _)| *o == owner) {
                    out.push((owner, ctx.label()));
                }
            }
        }
        out
    }

    pub fn nodes(&self) -> &[Ctx<E>] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<Ctx<E>> {
        self.nodes
    }
}

impl<E> Default for Chain<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::DbResult;

    #[test]
    fn test_pending_advances_in_order() {
        let mut chain: Chain<()> = Chain::new();
        chain.push(Ctx::new("a"));
        chain.push(Ctx::new("b"));
        assert!(!chain.is_resolved());

        chain.first_pending_mut().unwrap().resolve(&DbResult::command_ok("INSERT 0 1"));
        assert_eq!(chain.first_pending_mut().unwrap().label(), "b");
        chain.first_pending_mut().unwrap().resolve(&DbResult::error("boom"));
        assert!(chain.is_resolved());
        assert!(chain.first_pending_mut().is_none());
    }

    #[test]
    fn test_owners_dedup() {
        let mut chain: Chain<()> = Chain::new();
        chain.push(Ctx::for_owner("x", ClientId(1)));
        chain.push(Ctx::new("y"));
        chain.push(Ctx::for_owner("z", ClientId(1)));
        chain.push(Ctx::for_owner("w", ClientId(2)));
        assert_eq!(chain.owners(), vec![(ClientId(1), "x"), (ClientId(2), "w")]);
    }
}
