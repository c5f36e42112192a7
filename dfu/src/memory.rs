use std::sync::LazyLock;

use nonempty::NonEmpty;
use regex::Regex;

use crate::error::DfuError;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*0x([\da-fA-F]{1,8})U?\s*$").expect("address regex")
});

static GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s*\*\s*(\d+)\s?([ BKM])\s*([a-g])$")
        .expect("sector group regex")
});

/// DfuSe memory map, as advertised by the `iInterface` string of an
/// alternate setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMap {
    pub name: String,
    pub segments: NonEmpty<MemorySegment>,
}

/// One sector of a memory map. `end` is exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemorySegment {
    start: u32,
    end: u32,
    sector_size: u32,
    readable: bool,
    erasable: bool,
    writable: bool,
}

/// Sector scheduled for erase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sector {
    pub address: u32,
    pub size: u32,
}

impl MemoryMap {
    /// Segment containing `addr`.
    pub fn segment(&self, addr: u32) -> Option<&MemorySegment> {
        let (mut lo, mut hi) = (0, self.segments.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let segment = self.segments.get(mid)?;
            if segment.end <= addr {
                lo = mid + 1;
            } else if segment.start > addr {
                hi = mid;
            } else {
                return Some(segment);
            }
        }
        None
    }

    pub fn first_writable_segment(&self) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.writable)
    }

    /// Number of bytes that can be read from `addr` to the end of its
    /// segment. 0 when the address is unmapped or not readable.
    pub fn max_read_size(&self, addr: u32) -> u32 {
        match self.segment(addr) {
            Some(segment) if segment.readable => segment.end - addr,
            _ => 0,
        }
    }

    fn erasable_segment(&self, addr: u32) -> Result<&MemorySegment, DfuError> {
        let segment = self
            .segment(addr)
            .ok_or(DfuError::AddressOutOfRange { address: addr })?;
        if !segment.erasable {
            return Err(DfuError::SegmentNotErasable { address: addr });
        }
        Ok(segment)
    }

    /// Start of the sector containing `addr`.
    pub fn sector_start(&self, addr: u32) -> Result<u32, DfuError> {
        Ok(self.erasable_segment(addr)?.sector_start(addr))
    }

    /// End (exclusive) of the sector containing `addr`.
    pub fn sector_end(&self, addr: u32) -> Result<u32, DfuError> {
        Ok(self.erasable_segment(addr)?.sector_end(addr))
    }

    /// Sectors to erase before writing `length` bytes at `start`, in
    /// ascending order, each sector once.
    pub fn erase_plan(
        &self,
        start: u32,
        length: u32,
    ) -> Result<Vec<Sector>, DfuError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let last = start
            .checked_add(length - 1)
            .ok_or(DfuError::AddressOutOfRange { address: u32::MAX })?;
        let mut addr = self.sector_start(start)?;
        let end = self.sector_end(last)?;

        let mut sectors: Vec<Sector> = Vec::new();
        while addr < end {
            let segment = self.erasable_segment(addr)?;
            let sector = Sector {
                address: segment.sector_start(addr),
                size: segment.sector_size,
            };
            if sectors.last() != Some(&sector) {
                sectors.push(sector);
            }
            addr = segment.sector_end(addr);
        }
        Ok(sectors)
    }
}

impl MemorySegment {
    pub fn start_addr(&self) -> u32 {
        self.start
    }
    pub fn end_addr(&self) -> u32 {
        self.end
    }
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }
    pub fn sectors(&self) -> u32 {
        (self.end - self.start) / self.sector_size
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }
    pub fn readable(&self) -> bool {
        self.readable
    }
    pub fn erasable(&self) -> bool {
        self.erasable
    }
    pub fn writable(&self) -> bool {
        self.writable
    }

    fn sector_start(&self, addr: u32) -> u32 {
        self.start + (addr - self.start) / self.sector_size * self.sector_size
    }

    fn sector_end(&self, addr: u32) -> u32 {
        self.sector_start(addr).saturating_add(self.sector_size)
    }
}

fn invalid(desc: &str) -> DfuError {
    DfuError::InvalidMemoryLayout(desc.to_string())
}

/// Parse a DfuSe memory layout string such as
/// `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`.
///
/// Each `count*size` group expands into `count` segments of `size` bytes.
/// Several address blocks may follow each other, separated by `/`.
pub fn parse_memory_descriptor(desc: &str) -> Result<MemoryMap, DfuError> {
    let body = desc.strip_prefix('@').ok_or_else(|| invalid(desc))?;
    let mut parts = body.split('/');
    let name = parts.next().unwrap_or_default().trim().to_string();
    let parts: Vec<&str> = parts.collect();
    if parts.is_empty() || parts.len() % 2 != 0 {
        return Err(invalid(desc));
    }

    let mut segments = Vec::new();
    for block in parts.chunks(2) {
        let captures =
            ADDRESS_RE.captures(block[0]).ok_or_else(|| invalid(desc))?;
        let mut addr = u32::from_str_radix(&captures[1], 16)
            .map_err(|_| invalid(desc))?;

        let groups: Vec<&str> = block[1]
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .collect();
        if groups.is_empty() {
            return Err(invalid(desc));
        }

        for group in groups {
            let captures =
                GROUP_RE.captures(group).ok_or_else(|| invalid(desc))?;
            let count: u32 = captures[1].parse().map_err(|_| invalid(desc))?;
            let size: u32 = captures[2].parse().map_err(|_| invalid(desc))?;
            let multiplier = match &captures[3] {
                "K" => 1024,
                "M" => 1024 * 1024,
                _ => 1,
            };
            let sector_size = size
                .checked_mul(multiplier)
                .filter(|s| *s > 0)
                .ok_or_else(|| invalid(desc))?;
            if count == 0 {
                return Err(invalid(desc));
            }
            let flags = captures[4].as_bytes()[0] - b'a' + 1;

            for _ in 0..count {
                let end =
                    addr.checked_add(sector_size).ok_or_else(|| invalid(desc))?;
                segments.push(MemorySegment {
                    start: addr,
                    end,
                    sector_size,
                    readable: flags & 0x1 != 0,
                    erasable: flags & 0x2 != 0,
                    writable: flags & 0x4 != 0,
                });
                addr = end;
            }
        }
    }

    segments.sort_by_key(|s| s.start);
    if segments.windows(2).any(|pair| pair[0].end > pair[1].start) {
        return Err(invalid(desc));
    }

    NonEmpty::from_vec(segments)
        .map(|segments| MemoryMap { name, segments })
        .ok_or_else(|| invalid(desc))
}
