use crate::IpError;

const IPOPT_END: u8 = 0;
const IPOPT_NOOP: u8 = 1;

/// One option of an IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpOption {
    /// Option type octet, copy flag included.
    pub kind: u8,
    /// Offset of the type octet from the start of the option area.
    pub offset: usize,
    /// Total length, type and length octets included. 1 for NOP.
    pub len: usize,
}

impl IpOption {
    /// Whether the option is copied into every fragment.
    #[inline]
    pub fn copied(&self) -> bool {
        self.kind & 0x80 != 0
    }
}

/// Walks the option area of a header (the bytes between the fixed header and `ihl`).
///
/// Stops at End of Options. Every TLV option must carry a length of at least 2 that stays
/// inside the area.
pub fn parse_options(area: &[u8]) -> Result<Vec<IpOption>, IpError> {
    let mut options = Vec::new();
    let mut offset = 0;

    while offset < area.len() {
        match area[offset] {
            IPOPT_END => break,
            IPOPT_NOOP => {
                options.push(IpOption { kind: IPOPT_NOOP, offset, len: 1 });
                offset += 1;
            }
            kind => {
                let len = *area.get(offset + 1).ok_or(IpError::BadOption { offset })? as usize;
                if len < 2 || offset + len > area.len() {
                    return Err(IpError::BadOption { offset });
                }
                options.push(IpOption { kind, offset, len });
                offset += len;
            }
        }
    }

    Ok(options)
}
