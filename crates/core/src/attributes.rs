// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-packet attributes.
//!
//! Attributes are small value types attached to a packet: timestamps and cue
//! flags. Absence is allowed — a freshly allocated packet carries none.

use smallvec::SmallVec;

/// Attribute discriminant, used for keyed lookup and replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    PresentationTime,
    DecodingTime,
    Cue,
}

/// Decode/display cue flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CueFlags {
    /// The packet starts a random-access point.
    pub keyframe: bool,
    /// The stream is discontinuous at this packet.
    pub discontinuity: bool,
}

/// One attribute value. Times are in 180 kHz clock ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// PTS: when to present.
    PresentationTime(i64),
    /// DTS: when to decode.
    DecodingTime(i64),
    Cue(CueFlags),
}

impl Attribute {
    pub const fn kind(&self) -> AttributeKind {
        match self {
            Self::PresentationTime(_) => AttributeKind::PresentationTime,
            Self::DecodingTime(_) => AttributeKind::DecodingTime,
            Self::Cue(_) => AttributeKind::Cue,
        }
    }
}

/// Keyed attribute bag. Packets rarely carry more than a PTS, a DTS and cue
/// flags, so the storage is inline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    items: SmallVec<[Attribute; 4]>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the attribute of the same kind.
    pub fn set(&mut self, attr: Attribute) {
        match self.items.iter_mut().find(|a| a.kind() == attr.kind()) {
            Some(slot) => *slot = attr,
            None => self.items.push(attr),
        }
    }

    pub fn get(&self, kind: AttributeKind) -> Option<Attribute> {
        self.items.iter().find(|a| a.kind() == kind).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn presentation_time(&self) -> Option<i64> {
        match self.get(AttributeKind::PresentationTime) {
            Some(Attribute::PresentationTime(t)) => Some(t),
            _ => None,
        }
    }

    pub fn decoding_time(&self) -> Option<i64> {
        match self.get(AttributeKind::DecodingTime) {
            Some(Attribute::DecodingTime(t)) => Some(t),
            _ => None,
        }
    }

    pub fn cue(&self) -> Option<CueFlags> {
        match self.get(AttributeKind::Cue) {
            Some(Attribute::Cue(c)) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_same_kind() {
        let mut attrs = Attributes::new();
        attrs.set(Attribute::PresentationTime(100));
        attrs.set(Attribute::DecodingTime(90));
        attrs.set(Attribute::PresentationTime(200));

        assert_eq!(attrs.presentation_time(), Some(200));
        assert_eq!(attrs.decoding_time(), Some(90));
        assert_eq!(attrs.cue(), None);
    }

    #[test]
    fn absence_is_allowed() {
        let attrs = Attributes::new();
        assert_eq!(attrs.presentation_time(), None);
        assert_eq!(attrs.get(AttributeKind::Cue), None);
    }
}
