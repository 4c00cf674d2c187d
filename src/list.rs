//! The source registry: a priority-sorted list of registered sources.

use std::num::NonZeroU32;
use std::sync::Arc;

use bitflags::bitflags;

use crate::sources::{DestroyNotify, EventSource, UserData};

bitflags! {
    pub(crate) struct SourceFlags: u8 {
        /// Cleared when the source is removed while a dispatch is in
        /// flight; such a node stays linked as a tombstone until the
        /// dispatching frame unlinks it.
        const VALID = 0x01;
        /// A dispatch of this source is currently running.
        const IN_CALL = 0x02;
        /// Prepare reported the source ready; consumed by the check
        /// phase of the same iteration.
        const READY = 0x04;
        /// The source may be dispatched from within its own dispatch.
        const CAN_RECURSE = 0x08;
    }
}

/// The identity tag of a registered source.
///
/// Tags are assigned from a counter that is never reused, so a tag is
/// unique for the lifetime of its [`Context`](crate::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(NonZeroU32);

pub(crate) struct SourceNode {
    pub(crate) id: SourceId,
    pub(crate) priority: i32,
    pub(crate) flags: SourceFlags,
    pub(crate) source: Arc<dyn EventSource>,
    pub(crate) user_data: Option<UserData>,
    pub(crate) user_destroy: Option<DestroyNotify>,
}

impl SourceNode {
    pub(crate) fn is_valid(&self) -> bool {
        self.flags.contains(SourceFlags::VALID)
    }

    /// In a non-recursable dispatch: skipped by prepare and check.
    pub(crate) fn is_blocked(&self) -> bool {
        self.flags.contains(SourceFlags::IN_CALL) && !self.flags.contains(SourceFlags::CAN_RECURSE)
    }
}

pub(crate) struct SourceList {
    nodes: Vec<SourceNode>,
    next_id: u32,
}

impl SourceList {
    pub(crate) fn new() -> SourceList {
        SourceList {
            nodes: Vec::new(),
            next_id: 1,
        }
    }

    /// Inserts a new source after all existing sources of equal priority
    /// and returns its fresh identity tag.
    pub(crate) fn insert(
        &mut self,
        priority: i32,
        can_recurse: bool,
        source: Arc<dyn EventSource>,
        user_data: Option<UserData>,
        user_destroy: Option<DestroyNotify>,
    ) -> SourceId {
        let id = SourceId(NonZeroU32::new(self.next_id).expect("source id space exhausted"));
        self.next_id += 1;

        let mut flags = SourceFlags::VALID;
        if can_recurse {
            flags |= SourceFlags::CAN_RECURSE;
        }

        let pos = self
            .nodes
            .iter()
            .position(|node| node.priority > priority)
            .unwrap_or(self.nodes.len());
        self.nodes.insert(
            pos,
            SourceNode {
                id,
                priority,
                flags,
                source,
                user_data,
                user_destroy,
            },
        );

        id
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn get(&self, idx: usize) -> &SourceNode {
        &self.nodes[idx]
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut SourceNode {
        &mut self.nodes[idx]
    }

    pub(crate) fn remove(&mut self, idx: usize) -> SourceNode {
        self.nodes.remove(idx)
    }

    /// Position of the live source with the given tag; tombstones do not
    /// match.
    pub(crate) fn position_valid(&self, id: SourceId) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.id == id && node.is_valid())
    }

    /// Position of the node with the given tag, tombstoned or not.
    pub(crate) fn position_any(&self, id: SourceId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    /// Position of the first live source matching the predicate.
    pub(crate) fn find_valid<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&SourceNode) -> bool,
    {
        self.nodes
            .iter()
            .position(|node| node.is_valid() && pred(node))
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, SourceNode> {
        self.nodes.drain(..)
    }
}
