//! The bundle itself: primary block, payload and extension blocks
//!
//! A bundle is a primary block (routing metadata) followed by a sequence of
//! canonical blocks, one of which is the payload. Wire encoding is postcard;
//! the storage engine treats the encoded form as the durable representation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointId;
use crate::error::BundleError;
use crate::id::BundleId;

/// Block type of the payload block
pub const BLOCK_PAYLOAD: u8 = 1;

/// Delivery priority class, carried in the primary block flags
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Priority {
    /// Bulk transfer, lowest priority
    Bulk,
    /// Normal delivery (default)
    #[default]
    Normal,
    /// Expedited, highest priority
    Expedited,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Bulk => write!(f, "bulk"),
            Priority::Normal => write!(f, "normal"),
            Priority::Expedited => write!(f, "expedited"),
        }
    }
}

/// Primary block processing flags
///
/// Bit 0 marks a fragment; bits 7..8 carry the priority class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct ProcessingFlags(pub u32);

impl ProcessingFlags {
    const FRAGMENT: u32 = 0x0001;
    const PRIORITY_SHIFT: u32 = 7;
    const PRIORITY_MASK: u32 = 0x0003 << Self::PRIORITY_SHIFT;

    /// Whether the fragment bit is set
    pub fn is_fragment(self) -> bool {
        self.0 & Self::FRAGMENT != 0
    }

    /// Set or clear the fragment bit
    pub fn set_fragment(&mut self, fragment: bool) {
        if fragment {
            self.0 |= Self::FRAGMENT;
        } else {
            self.0 &= !Self::FRAGMENT;
        }
    }

    /// The priority class encoded in the flags
    pub fn priority(self) -> Priority {
        match (self.0 & Self::PRIORITY_MASK) >> Self::PRIORITY_SHIFT {
            0 => Priority::Bulk,
            2 => Priority::Expedited,
            _ => Priority::Normal,
        }
    }

    /// Replace the priority class bits
    pub fn with_priority(self, priority: Priority) -> Self {
        let bits = match priority {
            Priority::Bulk => 0,
            Priority::Normal => 1,
            Priority::Expedited => 2,
        };
        Self((self.0 & !Self::PRIORITY_MASK) | (bits << Self::PRIORITY_SHIFT))
    }
}

/// A canonical block: payload or extension data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block type code (`BLOCK_PAYLOAD` for the payload)
    pub block_type: u8,
    /// Block processing flags, passed through opaquely
    pub flags: u64,
    /// Block body
    pub data: Bytes,
}

impl Block {
    /// Create a payload block
    pub fn payload(data: Bytes) -> Self {
        Self {
            block_type: BLOCK_PAYLOAD,
            flags: 0,
            data,
        }
    }

    /// Create an extension block
    pub fn extension(block_type: u8, data: Bytes) -> Self {
        Self {
            block_type,
            flags: 0,
            data,
        }
    }

    /// Whether this is the payload block
    pub fn is_payload(&self) -> bool {
        self.block_type == BLOCK_PAYLOAD
    }
}

/// The primary block: everything needed to route and expire a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryBlock {
    /// Processing flags (fragment bit, priority class)
    pub flags: ProcessingFlags,
    /// Final destination endpoint
    pub destination: EndpointId,
    /// Source endpoint
    pub source: EndpointId,
    /// Endpoint to send status reports to
    pub report_to: EndpointId,
    /// Current custodian endpoint
    pub custodian: EndpointId,
    /// Creation timestamp in DTN seconds
    pub timestamp: u64,
    /// Creation sequence number
    pub sequence: u64,
    /// Lifetime in seconds; expiry is `timestamp + lifetime`
    pub lifetime: u64,
    /// Payload offset within the original bundle, meaningful for fragments
    pub fragment_offset: u64,
    /// Total application data length of the original bundle, meaningful for fragments
    pub app_data_length: u64,
}

/// A DTN bundle: primary block plus canonical blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Primary block
    pub primary: PrimaryBlock,
    /// Canonical blocks in transmission order
    pub blocks: Vec<Block>,
}

impl Bundle {
    /// Create a bundle with a single payload block
    pub fn new(
        source: EndpointId,
        destination: EndpointId,
        timestamp: u64,
        sequence: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            primary: PrimaryBlock {
                flags: ProcessingFlags::default().with_priority(Priority::Normal),
                destination,
                source,
                report_to: EndpointId::null(),
                custodian: EndpointId::null(),
                timestamp,
                sequence,
                lifetime: 3600,
                fragment_offset: 0,
                app_data_length: 0,
            },
            blocks: vec![Block::payload(payload)],
        }
    }

    /// Set the lifetime in seconds
    pub fn with_lifetime(mut self, lifetime: u64) -> Self {
        self.primary.lifetime = lifetime;
        self
    }

    /// Set the priority class
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.primary.flags = self.primary.flags.with_priority(priority);
        self
    }

    /// Set the report-to endpoint
    pub fn with_report_to(mut self, report_to: EndpointId) -> Self {
        self.primary.report_to = report_to;
        self
    }

    /// Turn this bundle into a fragment of a larger bundle
    ///
    /// `offset` is the byte position of this bundle's payload within the
    /// original payload; `total_length` is the original payload's length.
    pub fn as_fragment(mut self, offset: u64, total_length: u64) -> Self {
        self.primary.flags.set_fragment(true);
        self.primary.fragment_offset = offset;
        self.primary.app_data_length = total_length;
        self
    }

    /// The identity of this bundle
    pub fn id(&self) -> BundleId {
        BundleId {
            source: self.primary.source.clone(),
            timestamp: self.primary.timestamp,
            sequence: self.primary.sequence,
            fragment_offset: self
                .primary
                .flags
                .is_fragment()
                .then_some(self.primary.fragment_offset),
        }
    }

    /// The payload block, if present
    pub fn payload(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| b.is_payload())
    }

    /// Absolute expiry time in DTN seconds
    pub fn expires_at(&self) -> u64 {
        self.primary.timestamp.saturating_add(self.primary.lifetime)
    }

    /// Encode to the wire/durable representation
    pub fn to_wire(&self) -> Result<Vec<u8>, BundleError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from the wire/durable representation
    pub fn from_wire(data: &[u8]) -> Result<Self, BundleError> {
        Ok(postcard::from_bytes(data)?)
    }
}
