//! Typed kernel-wide and vat-local slot identifiers.
//!
//! Kernel slots render as `ko20` / `kp60` / `kd70`; vat slots render as
//! `o+12` (allocated by the vat, an export) or `o-12` (assigned by the
//! kernel, an import). The textual forms are the persisted representation,
//! so both types round-trip through `Display`/`FromStr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("empty slot string")]
    Empty,
    #[error("unknown slot kind '{0}'")]
    UnknownKind(char),
    #[error("malformed slot '{0}'")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotKind {
    Object,
    Promise,
    Device,
}

impl SlotKind {
    pub fn tag(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Device => 'd',
        }
    }

    fn from_tag(tag: char) -> Result<Self, SlotError> {
        match tag {
            'o' => Ok(SlotKind::Object),
            'p' => Ok(SlotKind::Promise),
            'd' => Ok(SlotKind::Device),
            other => Err(SlotError::UnknownKind(other)),
        }
    }
}

/// Globally unique kernel-level identifier, never reused after retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelSlot {
    pub kind: SlotKind,
    pub id: u64,
}

impl KernelSlot {
    pub fn object(id: u64) -> Self {
        Self { kind: SlotKind::Object, id }
    }

    pub fn promise(id: u64) -> Self {
        Self { kind: SlotKind::Promise, id }
    }

    pub fn device(id: u64) -> Self {
        Self { kind: SlotKind::Device, id }
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}{}", self.kind.tag(), self.id)
    }
}

impl FromStr for KernelSlot {
    type Err = SlotError;

    fn from_str(s: &str) -> Result<Self, SlotError> {
        let mut chars = s.chars();
        match chars.next() {
            Some('k') => {}
            Some(_) => return Err(SlotError::Malformed(s.to_string())),
            None => return Err(SlotError::Empty),
        }
        let kind = SlotKind::from_tag(chars.next().ok_or_else(|| SlotError::Malformed(s.to_string()))?)?;
        let id = chars
            .as_str()
            .parse::<u64>()
            .map_err(|_| SlotError::Malformed(s.to_string()))?;
        Ok(KernelSlot { kind, id })
    }
}

/// Vat-local identifier. `allocated_by_vat` distinguishes exports (the vat
/// minted the id) from imports (the kernel assigned it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatSlot {
    pub kind: SlotKind,
    pub allocated_by_vat: bool,
    pub id: u64,
}

impl VatSlot {
    pub fn export(kind: SlotKind, id: u64) -> Self {
        Self { kind, allocated_by_vat: true, id }
    }

    pub fn import(kind: SlotKind, id: u64) -> Self {
        Self { kind, allocated_by_vat: false, id }
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        write!(f, "{}{}{}", self.kind.tag(), sign, self.id)
    }
}

impl FromStr for VatSlot {
    type Err = SlotError;

    fn from_str(s: &str) -> Result<Self, SlotError> {
        let mut chars = s.chars();
        let kind = SlotKind::from_tag(chars.next().ok_or(SlotError::Empty)?)?;
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(SlotError::Malformed(s.to_string())),
        };
        let id = chars
            .as_str()
            .parse::<u64>()
            .map_err(|_| SlotError::Malformed(s.to_string()))?;
        Ok(VatSlot { kind, allocated_by_vat, id })
    }
}

/// Identifier of a vat, e.g. `v1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VatId(String);

impl VatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! string_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(KernelSlot);
string_serde!(VatSlot);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_slot_round_trip() {
        for (s, slot) in [
            ("ko20", KernelSlot::object(20)),
            ("kp61", KernelSlot::promise(61)),
            ("kd70", KernelSlot::device(70)),
        ] {
            assert_eq!(s.parse::<KernelSlot>().unwrap(), slot);
            assert_eq!(slot.to_string(), s);
        }
    }

    #[test]
    fn vat_slot_round_trip() {
        assert_eq!(
            "o+12".parse::<VatSlot>().unwrap(),
            VatSlot::export(SlotKind::Object, 12)
        );
        assert_eq!(
            "p-60".parse::<VatSlot>().unwrap(),
            VatSlot::import(SlotKind::Promise, 60)
        );
        assert_eq!(VatSlot::import(SlotKind::Device, 70).to_string(), "d-70");
    }

    #[test]
    fn malformed_slots_are_rejected() {
        assert_eq!("".parse::<KernelSlot>().unwrap_err(), SlotError::Empty);
        assert_eq!(
            "kx1".parse::<KernelSlot>().unwrap_err(),
            SlotError::UnknownKind('x')
        );
        assert!(matches!(
            "o12".parse::<VatSlot>().unwrap_err(),
            SlotError::Malformed(_)
        ));
        assert!(matches!(
            "ko".parse::<KernelSlot>().unwrap_err(),
            SlotError::Malformed(_)
        ));
        assert!(matches!(
            "o+".parse::<VatSlot>().unwrap_err(),
            SlotError::Malformed(_)
        ));
    }

    #[test]
    fn slots_serialize_as_strings() {
        let json = serde_json::to_string(&KernelSlot::object(50)).unwrap();
        assert_eq!(json, "\"ko50\"");
        let back: VatSlot = serde_json::from_str("\"o-51\"").unwrap();
        assert_eq!(back, VatSlot::import(SlotKind::Object, 51));
    }
}
