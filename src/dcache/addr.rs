use anyhow::{bail, Result};

pub const LINE_BYTES: u64 = 64;
pub const MIN_GRANULARITY: u64 = 4096;

/// Address decomposition for a page-granularity cache that tracks footprints in 64-bit masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FootprintGeometry {
    lines_per_page: u64,
    footprint_size: u64,
    num_sets: u64,
    channels: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineLocation {
    pub tag: u64,
    pub set: usize,
    pub block: u32,
    pub access_bit: u64,
    pub channel: usize,
    pub channel_addr: u64,
}

impl FootprintGeometry {
    pub fn new(granularity: u64, footprint_size: u64, num_sets: u64, channels: u64) -> Result<Self> {
        if granularity < MIN_GRANULARITY || granularity % LINE_BYTES != 0 {
            bail!(
                "page granularity {} must be a multiple of {} and at least {} bytes",
                granularity,
                LINE_BYTES,
                MIN_GRANULARITY
            );
        }
        if footprint_size == 0 {
            bail!("footprint_size must be > 0");
        }
        let lines_per_page = granularity / LINE_BYTES;
        let blocks = lines_per_page.div_ceil(footprint_size);
        if blocks > 64 {
            bail!(
                "{} lines per page with footprint size {} needs {} sub-blocks, at most 64 fit a footprint mask",
                lines_per_page,
                footprint_size,
                blocks
            );
        }
        if num_sets == 0 {
            bail!("cache geometry yields zero sets");
        }
        if channels == 0 {
            bail!("channels must be > 0");
        }
        Ok(Self {
            lines_per_page,
            footprint_size,
            num_sets,
            channels,
        })
    }

    pub fn lines_per_page(&self) -> u64 {
        self.lines_per_page
    }

    pub fn footprint_size(&self) -> u64 {
        self.footprint_size
    }

    pub fn blocks_per_page(&self) -> u32 {
        self.lines_per_page.div_ceil(self.footprint_size) as u32
    }

    pub fn num_sets(&self) -> u64 {
        self.num_sets
    }

    pub fn channels(&self) -> u64 {
        self.channels
    }

    pub fn tag(&self, line_addr: u64) -> u64 {
        line_addr / self.lines_per_page
    }

    pub fn block(&self, line_addr: u64) -> u32 {
        let offset = line_addr - self.tag(line_addr) * self.lines_per_page;
        let block = offset / self.footprint_size;
        assert!(block < 64, "sub-block index {} out of range", block);
        block as u32
    }

    pub fn access_bit(&self, line_addr: u64) -> u64 {
        1u64 << self.block(line_addr)
    }

    pub fn set_index(&self, tag: u64) -> usize {
        (tag % self.num_sets) as usize
    }

    pub fn channel(&self, line_addr: u64) -> usize {
        (line_addr % self.channels) as usize
    }

    /// Address within the selected channel, with the channel-index digits removed.
    pub fn channel_addr(&self, line_addr: u64) -> u64 {
        line_addr / self.channels
    }

    /// First line of the page named by `tag`.
    pub fn page_base(&self, tag: u64) -> u64 {
        tag * self.lines_per_page
    }

    /// Number of lines covered by the sub-blocks set in `bits`.
    pub fn lines_in(&self, bits: u64) -> u64 {
        bits.count_ones() as u64 * self.footprint_size
    }

    pub fn locate(&self, line_addr: u64) -> LineLocation {
        let tag = self.tag(line_addr);
        let block = self.block(line_addr);
        LineLocation {
            tag,
            set: self.set_index(tag),
            block,
            access_bit: 1u64 << block,
            channel: self.channel(line_addr),
            channel_addr: self.channel_addr(line_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> FootprintGeometry {
        FootprintGeometry::new(4096, 4, 8, 4).expect("valid geometry")
    }

    #[test]
    fn tag_and_block_for_4k_pages() {
        let geo = small();
        assert_eq!(geo.lines_per_page(), 64);
        assert_eq!(geo.blocks_per_page(), 16);
        assert_eq!(geo.tag(0), 0);
        assert_eq!(geo.tag(63), 0);
        assert_eq!(geo.tag(64), 1);
        assert_eq!(geo.block(4), 1);
        assert_eq!(geo.block(64 + 63), 15);
        assert_eq!(geo.access_bit(4), 0b10);
    }

    #[test]
    fn set_and_channel_selection() {
        let geo = small();
        let loc = geo.locate(9 * 64 + 5);
        assert_eq!(loc.tag, 9);
        assert_eq!(loc.set, 1);
        assert_eq!(loc.block, 1);
        assert_eq!(loc.channel, ((9 * 64 + 5) % 4) as usize);
        assert_eq!(loc.channel_addr, (9 * 64 + 5) / 4);
    }

    #[test]
    fn large_pages_scale_the_tag() {
        let geo = FootprintGeometry::new(8192, 2, 1, 1).expect("valid geometry");
        assert_eq!(geo.lines_per_page(), 128);
        assert_eq!(geo.tag(200), 1);
        assert_eq!(geo.block(200), 36);
        assert_eq!(geo.page_base(1), 128);
        assert_eq!(geo.lines_in(0b1011), 6);
    }

    #[test]
    fn too_many_sub_blocks_is_a_config_error() {
        assert!(FootprintGeometry::new(8192, 1, 1, 1).is_err());
        assert!(FootprintGeometry::new(4096, 1, 1, 1).is_ok());
    }

    #[test]
    fn small_or_ragged_pages_are_rejected() {
        assert!(FootprintGeometry::new(2048, 1, 1, 1).is_err());
        assert!(FootprintGeometry::new(4100, 4, 1, 1).is_err());
        assert!(FootprintGeometry::new(4096, 0, 1, 1).is_err());
        assert!(FootprintGeometry::new(4096, 4, 0, 1).is_err());
        assert!(FootprintGeometry::new(4096, 4, 1, 0).is_err());
    }
}
