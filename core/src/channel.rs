// SPDX-License-Identifier: LGPL-3.0-or-later

//! Logical-channel (handle) tree (§3): a forest of Single and Set nodes.
//! Reserved id `-1` is the auto-maintained universal set of every Single
//! channel. Cycle detection uses a transient visit mark during validation
//! (§4.7 step 3, §9 "Cyclic graphs").

use std::collections::HashMap;

use crate::error::{Error, Result};

pub const UNIVERSAL_SET_ID: i32 = -1;

#[derive(Debug, Clone)]
enum ChannelNode {
    Single { module_alias: String },
    Set { children: Vec<i32> },
}

#[derive(Debug, Clone, Default)]
pub struct ChannelTree {
    nodes: HashMap<i32, ChannelNode>,
}

impl ChannelTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(UNIVERSAL_SET_ID, ChannelNode::Set { children: Vec::new() });
        ChannelTree { nodes }
    }

    /// Registers `id` as a Single channel owned by `module_alias` and adds
    /// it to the universal set. Fails if `id` is already used by any node
    /// (§3 invariant: every logical-channel id used in any Module is
    /// globally unique).
    pub fn register_single(&mut self, id: i32, module_alias: &str) -> Result<()> {
        if id == UNIVERSAL_SET_ID {
            return Err(Error::BadChannel(id));
        }
        if self.nodes.contains_key(&id) {
            return Err(Error::AliasExists(format!("logical channel {}", id)));
        }
        self.nodes.insert(
            id,
            ChannelNode::Single {
                module_alias: module_alias.to_string(),
            },
        );
        if let Some(ChannelNode::Set { children }) = self.nodes.get_mut(&UNIVERSAL_SET_ID) {
            children.push(id);
        }
        Ok(())
    }

    pub fn new_set(&mut self, id: i32) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::AliasExists(format!("logical channel set {}", id)));
        }
        self.nodes.insert(id, ChannelNode::Set { children: Vec::new() });
        Ok(())
    }

    pub fn add_to_set(&mut self, set_id: i32, child_id: i32) -> Result<()> {
        if !self.nodes.contains_key(&child_id) {
            return Err(Error::NoModChan(child_id));
        }
        match self.nodes.get_mut(&set_id) {
            Some(ChannelNode::Set { children }) => {
                children.push(child_id);
                Ok(())
            }
            Some(ChannelNode::Single { .. }) => Err(Error::BadChannel(set_id)),
            None => Err(Error::NoModChan(set_id)),
        }
    }

    pub fn is_set(&self, id: i32) -> bool {
        matches!(self.nodes.get(&id), Some(ChannelNode::Set { .. }))
    }

    /// Resolve a handle into the flat list of (logical_id, module_alias)
    /// pairs it fans out to (§4.9 run controller, §4.10 readout).
    pub fn resolve(&self, id: i32) -> Result<Vec<(i32, String)>> {
        let mut out = Vec::new();
        self.resolve_into(id, &mut out)?;
        Ok(out)
    }

    fn resolve_into(&self, id: i32, out: &mut Vec<(i32, String)>) -> Result<()> {
        match self.nodes.get(&id) {
            Some(ChannelNode::Single { module_alias }) => {
                out.push((id, module_alias.clone()));
                Ok(())
            }
            Some(ChannelNode::Set { children }) => {
                for child in children {
                    self.resolve_into(*child, out)?;
                }
                Ok(())
            }
            None => Err(Error::NoModChan(id)),
        }
    }

    /// §4.7 step 3: depth-first walk of every Set node with a transient
    /// `is_tagged` flag; revisiting a tagged Set is `InfiniteLoop`.
    pub fn validate(&self) -> Result<()> {
        let mut visiting: HashMap<i32, bool> = HashMap::new();
        for id in self.nodes.keys() {
            if self.is_set(*id) {
                self.walk(*id, &mut visiting)?;
            }
        }
        Ok(())
    }

    fn walk(&self, id: i32, visiting: &mut HashMap<i32, bool>) -> Result<()> {
        if let Some(true) = visiting.get(&id) {
            return Err(Error::InfiniteLoop(id));
        }
        match self.nodes.get(&id) {
            Some(ChannelNode::Set { children }) => {
                visiting.insert(id, true);
                for child in children {
                    self.walk(*child, visiting)?;
                }
                visiting.insert(id, false);
                Ok(())
            }
            Some(ChannelNode::Single { .. }) | None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn universal_set_collects_every_single() {
        let mut t = ChannelTree::new();
        t.register_single(0, "mod0").unwrap();
        t.register_single(1, "mod0").unwrap();
        let all = t.resolve(UNIVERSAL_SET_ID).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn cyclic_sets_rejected() {
        let mut t = ChannelTree::new();
        t.new_set(10).unwrap();
        t.new_set(11).unwrap();
        t.add_to_set(10, 11).unwrap();
        t.add_to_set(11, 10).unwrap();
        let err = t.validate().unwrap_err();
        assert!(matches!(err, Error::InfiniteLoop(_)));
    }

    #[test]
    fn duplicate_logical_channel_rejected() {
        let mut t = ChannelTree::new();
        t.register_single(0, "mod0").unwrap();
        let err = t.register_single(0, "mod1").unwrap_err();
        assert!(matches!(err, Error::AliasExists(_)));
    }

    #[test]
    fn set_fans_out_to_members() {
        let mut t = ChannelTree::new();
        t.register_single(0, "mod0").unwrap();
        t.register_single(1, "mod0").unwrap();
        t.new_set(5).unwrap();
        t.add_to_set(5, 0).unwrap();
        t.add_to_set(5, 1).unwrap();
        let members = t.resolve(5).unwrap();
        assert_eq!(members.len(), 2);
    }
}
