//! Bucket-level options (§6, "Bucket options recognized").

/// Immutable options fixed at bucket creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOptions {
    /// Tree fanout degree. Carried for manifest round-tripping and parity
    /// with the historical format; this crate's `BTreeMap`-backed trees do
    /// not use it to size internal nodes.
    pub btdeg: u32,
    /// Reserved-name system bucket (`_sys` / `_sysperf`).
    pub system: bool,
    /// Spatial indexing enabled.
    pub geo: bool,
    /// Radius queries include points at exactly `d == r`.
    pub georincl: bool,
    /// Reserved for future time-series support; unused today.
    pub time: bool,
    /// Spatial dimensionality; meaningful only when `geo`.
    pub dims: usize,
}

impl Default for BucketOptions {
    fn default() -> BucketOptions {
        BucketOptions {
            btdeg: 32,
            system: false,
            geo: false,
            georincl: false,
            time: false,
            dims: 2,
        }
    }
}

impl BucketOptions {
    pub fn new() -> BucketOptions {
        BucketOptions::default()
    }

    pub fn set_btdeg(mut self, btdeg: u32) -> Self {
        self.btdeg = btdeg.max(2);
        self
    }

    pub fn set_system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    pub fn set_geo(mut self, geo: bool) -> Self {
        self.geo = geo;
        self
    }

    pub fn set_georincl(mut self, inclusive: bool) -> Self {
        self.georincl = inclusive;
        self
    }

    pub fn set_time(mut self, time: bool) -> Self {
        self.time = time;
        self
    }

    pub fn set_dims(mut self, dims: usize) -> Self {
        self.dims = dims;
        self
    }
}
