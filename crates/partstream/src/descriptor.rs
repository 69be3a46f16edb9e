//! The computation description shipped to every partition.
//!
//! The descriptor is produced elsewhere; the coordinator only reads its
//! location (where to bind, which partitions to address), finalizes the
//! partition count into it, and serializes it once for the init handshake.

use crate::PartId;
use bytes::Bytes;

/// How a match tag constrains the choice of remote providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TagMatchType {
    Ignore = 0,
    Prefer = 1,
    Require = 2,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct MatchTag {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(enumeration = "TagMatchType", tag = "2")]
    pub match_type: i32,
}

impl MatchTag {
    pub fn new(key: impl Into<String>, match_type: TagMatchType) -> Self {
        Self {
            key: key.into(),
            match_type: match_type as i32,
        }
    }
}

/// Which partitions of the target are addressed.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct PartInfoDef {
    /// Unset until the coordinator has bound and learned the real count.
    #[prost(uint32, optional, tag = "1")]
    pub part_count: Option<u32>,
    /// Empty means every partition.
    #[prost(uint32, repeated, tag = "2")]
    pub part_ids: Vec<PartId>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct LocationDef {
    #[prost(string, tag = "1")]
    pub biz_name: String,
    #[prost(message, optional, tag = "2")]
    pub part_info: Option<PartInfoDef>,
    #[prost(bool, tag = "3")]
    pub enable_probe: bool,
    #[prost(message, repeated, tag = "4")]
    pub tags: Vec<MatchTag>,
}

/// A computation targeted at one remote business.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SubgraphDef {
    #[prost(uint32, tag = "1")]
    pub graph_id: u32,
    #[prost(message, optional, tag = "2")]
    pub location: Option<LocationDef>,
    /// Opaque to the coordinator.
    #[prost(bytes = "bytes", tag = "3")]
    pub body: Bytes,
}

impl SubgraphDef {
    /// A descriptor addressing every partition of `biz_name`.
    pub fn new(graph_id: u32, biz_name: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            graph_id,
            location: Some(LocationDef {
                biz_name: biz_name.into(),
                part_info: Some(PartInfoDef::default()),
                enable_probe: false,
                tags: Vec::new(),
            }),
            body: body.into(),
        }
    }

    /// Restricts the descriptor to a subset of partitions.
    #[must_use]
    pub fn with_part_ids(mut self, part_ids: impl IntoIterator<Item = PartId>) -> Self {
        self.part_info_mut().part_ids = part_ids.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: MatchTag) -> Self {
        self.location_mut().tags.push(tag);
        self
    }

    #[must_use]
    pub fn with_probe(mut self, enable_probe: bool) -> Self {
        self.location_mut().enable_probe = enable_probe;
        self
    }

    pub fn location_mut(&mut self) -> &mut LocationDef {
        self.location.get_or_insert_with(LocationDef::default)
    }

    pub fn part_info_mut(&mut self) -> &mut PartInfoDef {
        self.location_mut()
            .part_info
            .get_or_insert_with(PartInfoDef::default)
    }

    pub fn part_ids(&self) -> &[PartId] {
        self.location
            .as_ref()
            .and_then(|location| location.part_info.as_ref())
            .map(|part_info| part_info.part_ids.as_slice())
            .unwrap_or_default()
    }

    pub fn part_count(&self) -> Option<u32> {
        self.location
            .as_ref()
            .and_then(|location| location.part_info.as_ref())
            .and_then(|part_info| part_info.part_count)
    }
}
