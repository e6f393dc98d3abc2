//! Fragment collection and reassembly
//!
//! Incoming fragments of the same original bundle accumulate per group until
//! their payload ranges cover the whole application data unit, at which point
//! the original bundle is rebuilt and handed back for normal admission.
//! Coverage is a union of byte ranges: overlapping or duplicate fragments
//! never inflate the covered total.
//!
//! The claimed total length is an untrusted wire field: a group keeps only
//! the payload pieces it has actually received and allocates the full buffer
//! no earlier than completion, when coverage proves the total is backed by
//! real data.
//!
//! Extension blocks survive reassembly through signed positions relative to
//! the payload: the first fragment contributes the blocks preceding the
//! payload (negative positions counting back from -1), the last fragment the
//! blocks following it (positive positions from +1). Blocks of middle
//! fragments carry no position information and are dropped.
//!
//! Each absorbed fragment keeps its own container so partially collected
//! groups persist like ordinary bundles and survive a restart.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use caravel_bundle::{Block, Bundle, BundleId, EndpointId, PrimaryBlock};
use tracing::debug;

use crate::container::BundleContainer;
use crate::error::{StoreError, StoreResult};

/// Identity of a fragment group: the original bundle's whole-bundle identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FragmentKey {
    source: EndpointId,
    timestamp: u64,
    sequence: u64,
}

impl FragmentKey {
    fn of(bundle: &Bundle) -> Self {
        Self {
            source: bundle.primary.source.clone(),
            timestamp: bundle.primary.timestamp,
            sequence: bundle.primary.sequence,
        }
    }
}

/// What absorbing one fragment did to its group
#[derive(Debug)]
pub(crate) enum AbsorbOutcome {
    /// The group is still missing payload ranges
    Incomplete,
    /// This exact fragment was already absorbed; nothing changed
    Duplicate,
    /// The group is complete: the reassembled bundle plus the fragment
    /// containers to retire
    Complete {
        bundle: Bundle,
        sources: Vec<BundleContainer>,
    },
}

#[derive(Debug)]
struct FragmentGroup {
    /// Primary block template, taken from the first absorbed fragment
    primary: PrimaryBlock,
    total_len: u64,
    /// Received payload pieces keyed by (offset, length); doubles as the
    /// duplicate check
    pieces: BTreeMap<(u64, u64), Bytes>,
    /// Union of covered payload ranges as disjoint `start -> end` pairs
    ranges: BTreeMap<u64, u64>,
    /// Extension blocks keyed by signed position relative to the payload
    leading: BTreeMap<i32, Block>,
    trailing: BTreeMap<i32, Block>,
    /// Longest lifetime seen across the group's fragments
    lifetime: u64,
    sources: Vec<BundleContainer>,
}

impl FragmentGroup {
    fn new(fragment: &Bundle) -> Self {
        Self {
            primary: fragment.primary.clone(),
            total_len: fragment.primary.app_data_length,
            pieces: BTreeMap::new(),
            ranges: BTreeMap::new(),
            leading: BTreeMap::new(),
            trailing: BTreeMap::new(),
            lifetime: 0,
            sources: Vec::new(),
        }
    }

    /// Absolute expiry of the group: the latest expiry among its fragments
    fn expires_at(&self) -> u64 {
        self.primary.timestamp.saturating_add(self.lifetime)
    }

    fn absorb(
        &mut self,
        fragment: &Bundle,
        source: Option<BundleContainer>,
    ) -> StoreResult<bool> {
        let offset = fragment.primary.fragment_offset;
        let payload = fragment
            .payload()
            .ok_or_else(|| StoreError::InvalidFragment("fragment without payload".into()))?;
        let len = payload.data.len() as u64;

        if fragment.primary.app_data_length != self.total_len {
            return Err(StoreError::InvalidFragment(format!(
                "total length {} disagrees with group total {}",
                fragment.primary.app_data_length, self.total_len
            )));
        }
        if offset.saturating_add(len) > self.total_len {
            return Err(StoreError::InvalidFragment(format!(
                "range {}..{} exceeds total length {}",
                offset,
                offset + len,
                self.total_len
            )));
        }

        if self.pieces.contains_key(&(offset, len)) {
            return Ok(false);
        }
        self.pieces.insert((offset, len), payload.data.clone());
        self.merge_range(offset, offset + len);
        self.lifetime = self.lifetime.max(fragment.primary.lifetime);

        let payload_idx = fragment
            .blocks
            .iter()
            .position(Block::is_payload)
            .unwrap_or(fragment.blocks.len());
        if offset == 0 {
            // First fragment: blocks ahead of the payload, counted back from -1.
            for (i, block) in fragment.blocks[..payload_idx].iter().enumerate() {
                let position = i as i32 - payload_idx as i32;
                self.leading.insert(position, block.clone());
            }
        }
        if offset + len == self.total_len {
            // Last fragment: blocks after the payload, counted up from +1.
            for (i, block) in fragment.blocks[payload_idx + 1..].iter().enumerate() {
                self.trailing.insert(i as i32 + 1, block.clone());
            }
        }

        if let Some(container) = source {
            self.sources.push(container);
        }

        Ok(self.is_complete())
    }

    fn merge_range(&mut self, start: u64, end: u64) {
        let mut start = start;
        let mut end = end;
        // Swallow every existing range touching [start, end).
        let overlapping: Vec<u64> = self
            .ranges
            .iter()
            .filter(|&(&s, &e)| s <= end && e >= start)
            .map(|(&s, _)| s)
            .collect();
        for s in overlapping {
            if let Some(e) = self.ranges.remove(&s) {
                start = start.min(s);
                end = end.max(e);
            }
        }
        self.ranges.insert(start, end);
    }

    fn is_complete(&self) -> bool {
        self.total_len == 0
            || (self.ranges.len() == 1 && self.ranges.get(&0) == Some(&self.total_len))
    }

    fn into_bundle(self) -> (Bundle, Vec<BundleContainer>) {
        let mut primary = self.primary;
        primary.flags.set_fragment(false);
        primary.fragment_offset = 0;
        primary.app_data_length = 0;
        primary.lifetime = self.lifetime;

        // Coverage is complete, so every byte below total_len is backed by a
        // received piece.
        let mut payload = vec![0u8; self.total_len as usize];
        for (&(offset, _), data) in &self.pieces {
            payload[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }

        let mut blocks: Vec<Block> =
            Vec::with_capacity(self.leading.len() + 1 + self.trailing.len());
        blocks.extend(self.leading.into_values());
        blocks.push(Block::payload(Bytes::from(payload)));
        blocks.extend(self.trailing.into_values());

        (Bundle { primary, blocks }, self.sources)
    }
}

/// All partially collected fragment groups
#[derive(Debug, Default)]
pub(crate) struct FragmentTable {
    groups: HashMap<FragmentKey, FragmentGroup>,
}

impl FragmentTable {
    /// Absorb one fragment into its group, creating the group on first sight
    ///
    /// `source` is the container persisting this fragment; completed or
    /// expired groups hand all their containers back for retirement.
    pub(crate) fn absorb(
        &mut self,
        fragment: &Bundle,
        source: Option<BundleContainer>,
    ) -> StoreResult<AbsorbOutcome> {
        if !fragment.primary.flags.is_fragment() {
            return Err(StoreError::InvalidFragment(
                "bundle is not a fragment".into(),
            ));
        }

        let key = FragmentKey::of(fragment);
        let group = self
            .groups
            .entry(key.clone())
            .or_insert_with(|| FragmentGroup::new(fragment));

        let before = group.pieces.len();
        let complete = group.absorb(fragment, source)?;
        if group.pieces.len() == before {
            return Ok(AbsorbOutcome::Duplicate);
        }

        if complete {
            let group = self
                .groups
                .remove(&key)
                .ok_or_else(|| StoreError::InvalidFragment("group vanished".into()))?;
            debug!(
                fragments = group.pieces.len(),
                total_len = group.total_len,
                "Fragment group complete, reassembling"
            );
            let (bundle, sources) = group.into_bundle();
            Ok(AbsorbOutcome::Complete { bundle, sources })
        } else {
            Ok(AbsorbOutcome::Incomplete)
        }
    }

    /// Whether a fragment with this identity is already part of a group
    pub(crate) fn contains(&self, id: &BundleId) -> bool {
        let Some(offset) = id.fragment_offset else {
            return false;
        };
        let key = FragmentKey {
            source: id.source.clone(),
            timestamp: id.timestamp,
            sequence: id.sequence,
        };
        self.groups
            .get(&key)
            .is_some_and(|g| g.pieces.keys().any(|&(o, _)| o == offset))
    }

    /// Drop every group whose latest fragment expiry has passed
    ///
    /// Returns the retired fragment containers for artifact cleanup.
    pub(crate) fn expire(&mut self, now: u64) -> Vec<BundleContainer> {
        let expired: Vec<FragmentKey> = self
            .groups
            .iter()
            .filter(|(_, g)| g.expires_at() <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut retired = Vec::new();
        for key in expired {
            if let Some(group) = self.groups.remove(&key) {
                retired.extend(group.sources);
            }
        }
        retired
    }

    /// Retire every group, returning all fragment containers
    pub(crate) fn drain(&mut self) -> Vec<BundleContainer> {
        std::mem::take(&mut self.groups)
            .into_values()
            .flat_map(|g| g.sources)
            .collect()
    }

    /// Number of partially collected groups
    pub(crate) fn group_count(&self) -> usize {
        self.groups.len()
    }
}
