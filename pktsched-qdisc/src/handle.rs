//! Qdisc handles.
//!
//! Handles are 32-bit values split into major:minor (16:16 bits). A qdisc's own handle always has
//! minor 0; the minor selects a class below it.

use std::{fmt, str::FromStr};

use crate::QdiscError;

/// First major number handed out by automatic allocation.
pub const AUTOHANDLE_FIRST_MAJOR: u32 = 0x8000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Unspecified handle, e.g. a default qdisc nobody has named.
    pub const UNSPEC: Self = Self(0);
    /// Parent of a root qdisc.
    pub const ROOT: Self = Self(0xFFFF_FFFF);
    /// Parent of an ingress qdisc.
    pub const INGRESS: Self = Self(0xFFFF_FFF1);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self(((major as u32) << 16) | minor as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn minor(self) -> u16 {
        self.0 as u16
    }

    /// The `major:0` handle of the qdisc owning this class.
    pub const fn qdisc(self) -> Self {
        Self(self.0 & 0xFFFF_0000)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ROOT => f.write_str("root"),
            Self::INGRESS => f.write_str("ingress"),
            Self::UNSPEC => f.write_str("none"),
            h => write!(f, "{:x}:{:x}", h.major(), h.minor()),
        }
    }
}

impl FromStr for Handle {
    type Err = QdiscError;

    /// Parses `major:minor` or `major:` with hexadecimal numbers, as `tc` writes them.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => return Ok(Self::ROOT),
            "ingress" => return Ok(Self::INGRESS),
            "none" => return Ok(Self::UNSPEC),
            _ => {}
        }

        let invalid = || QdiscError::InvalidHandle(s.to_string());
        let (major, minor) = s.split_once(':').ok_or_else(invalid)?;
        let major = u16::from_str_radix(major, 16).map_err(|_| invalid())?;
        let minor = match minor {
            "" => 0,
            minor => u16::from_str_radix(minor, 16).map_err(|_| invalid())?,
        };

        Ok(Self::new(major, minor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_minor_split() {
        let h = Handle::new(1, 0xC);
        assert_eq!(h.as_raw(), 0x0001_000C);
        assert_eq!((h.major(), h.minor()), (1, 12));
        assert_eq!(h.qdisc(), Handle::new(1, 0));
    }

    #[test]
    fn display_and_parse() {
        assert_eq!(Handle::new(0x8001, 0).to_string(), "8001:0");
        assert_eq!(Handle::ROOT.to_string(), "root");

        assert_eq!("1:c".parse::<Handle>().unwrap(), Handle::new(1, 12));
        assert_eq!("8000:".parse::<Handle>().unwrap(), Handle::new(0x8000, 0));
        assert_eq!("ingress".parse::<Handle>().unwrap(), Handle::INGRESS);
        assert!("1".parse::<Handle>().is_err());
        assert!("x:1".parse::<Handle>().is_err());
    }
}
