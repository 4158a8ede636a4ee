//! # Device buffer budget
//!
//! The expander buffers master transfers in two independent memory
//! regions. The write and read halves of one transfer can land in the
//! same region or be split across both, in either order. The host keeps
//! a prediction of the free space so it can refuse transfers locally
//! instead of having the device answer with `NoSpace`.
//!
//! The prediction is overwritten whenever the device reports its real
//! numbers in a status that is not older than our last request.

/// Free queue slots and buffer bytes on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBudget {
    /// Free slots in the master request queue.
    pub queue_space: usize,
    /// Free bytes in the first master buffer region.
    pub region1: usize,
    /// Free bytes in the second master buffer region.
    pub region2: usize,
    /// Free slots in the slave request queue.
    pub slave_queue_space: usize,
}

/// Master queue depth after a configuration.
pub const DEFAULT_QUEUE_SPACE: usize = 4;

/// First region size after a configuration.
pub const DEFAULT_REGION1: usize = 512;

/// Second region size after a configuration.
pub const DEFAULT_REGION2: usize = 0;

/// Slave queue depth after a configuration.
pub const DEFAULT_SLAVE_QUEUE_SPACE: usize = 4;

impl Default for BufferBudget {
    fn default() -> Self {
        Self {
            queue_space: DEFAULT_QUEUE_SPACE,
            region1: DEFAULT_REGION1,
            region2: DEFAULT_REGION2,
            slave_queue_space: DEFAULT_SLAVE_QUEUE_SPACE,
        }
    }
}

impl BufferBudget {
    /// Return true, if a master transfer with `write` bytes out and
    /// `read` bytes in fits.
    #[must_use]
    pub const fn fits_master(&self, write: usize, read: usize) -> bool {
        let total = write + read;

        self.queue_space > 0
            && (self.region1 >= total
                || (self.region1 >= write && self.region2 >= read)
                || (self.region1 >= read && self.region2 >= write)
                || self.region2 >= total)
    }

    /// Return true, if a slave request fits.
    #[must_use]
    pub const fn fits_slave(&self) -> bool {
        self.slave_queue_space > 0
    }

    /// Account for a master transfer that [`fits_master`](Self::fits_master).
    ///
    /// Exactly `write + read` bytes are taken from the two regions.
    /// Calling this for a transfer that does not fit leaves the regions
    /// untouched.
    pub fn reserve_master(&mut self, write: usize, read: usize) {
        let big = write.max(read);
        let small = write.min(read);

        if self.region1 >= big + small {
            self.region1 -= big + small;
        } else if self.region1 >= big && self.region2 >= small {
            self.region1 -= big;
            self.region2 -= small;
        } else if self.region2 >= big && self.region1 >= small {
            self.region2 -= big;
            self.region1 -= small;
        } else if self.region2 >= big + small {
            self.region2 -= big + small;
        } else {
            return;
        }

        self.queue_space = self.queue_space.saturating_sub(1);
    }

    /// Account for a slave request.
    pub fn reserve_slave(&mut self) {
        self.slave_queue_space = self.slave_queue_space.saturating_sub(1);
    }

    /// Take over the master numbers reported by the device.
    pub fn resync_master(&mut self, queue_space: usize, region1: usize, region2: usize) {
        self.queue_space = queue_space;
        self.region1 = region1;
        self.region2 = region2;
    }

    /// Take over the slave queue depth reported by the device.
    pub fn resync_slave(&mut self, slave_queue_space: usize) {
        self.slave_queue_space = slave_queue_space;
    }
}
