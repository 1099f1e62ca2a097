//! Tombstones for destroyed channels.

use std::collections::{HashMap, VecDeque};

use super::state::CloseReason;
use crate::error::{CapabilityError, ChannelError, Error};
use crate::id::{CapabilityId, ChannelId};

/// How many destroyed channels keep reporting why they closed.
pub(crate) const RETIRED_CHANNELS: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Tombstone {
    pub(crate) capability: CapabilityId,
    pub(crate) reason: CloseReason,
}

impl Tombstone {
    /// What a late caller of the destroyed channel is told.
    pub(crate) fn error(&self, channel: ChannelId) -> Error {
        match self.reason {
            CloseReason::Revoked => CapabilityError::Revoked(self.capability).into(),
            CloseReason::Normal => ChannelError::Closed(channel).into(),
        }
    }
}

/// Oldest-first bounded map of recently destroyed channels.
#[derive(Debug)]
pub(crate) struct Retired {
    order: VecDeque<ChannelId>,
    tombstones: HashMap<ChannelId, Tombstone>,
    max: usize,
}

impl Retired {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            order: VecDeque::new(),
            tombstones: HashMap::new(),
            max,
        }
    }

    pub(crate) fn insert(&mut self, channel: ChannelId, tombstone: Tombstone) {
        if self.tombstones.insert(channel, tombstone).is_some() {
            return;
        }
        self.order.push_back(channel);
        while self.order.len() > self.max {
            if let Some(oldest) = self.order.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }

    pub(crate) fn get(&self, channel: &ChannelId) -> Option<Tombstone> {
        self.tombstones.get(channel).copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tombstones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_tombstones_fall_off() {
        let mut retired = Retired::new(2);
        let ids: Vec<ChannelId> = (0..3).map(|_| ChannelId::new()).collect();
        let cap = CapabilityId::new();
        for (i, id) in ids.iter().enumerate() {
            let reason = if i == 0 { CloseReason::Normal } else { CloseReason::Revoked };
            retired.insert(*id, Tombstone { capability: cap, reason });
        }

        assert_eq!(retired.len(), 2);
        assert!(retired.get(&ids[0]).is_none());
        let err = retired.get(&ids[2]).unwrap().error(ids[2]);
        assert_eq!(err, Error::Capability(CapabilityError::Revoked(cap)));
    }
}
