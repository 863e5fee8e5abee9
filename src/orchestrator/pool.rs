//! Processor and device slot allocation.
//!
//! A [`ResourcePool`] hands out slot indices from a fixed number of
//! hardware slots. Requests larger than what is free still succeed: slots are
//! handed out again in most-available order, so counts go negative and the
//! machine is oversubscribed. This lets an oversized test run alone once the
//! scheduler has nothing else to do.
//!
//! ```text
//!   total = 6, maxavail = 4      get(3)               put([0,1,2])
//!   slot:  0  1  2  3            slot:  0  1  2  3    slot:  0  1  2  3
//!   count: 2  2  1  1            count: 1  1  0  1    count: 2  2  1  1
//! ```

use crate::testcase::Size;

/// Counting allocator over `maxavail` distinct slot indices.
///
/// Initialized lazily on the first [`get`](Self::get): slot `i % maxavail`
/// receives one count for each `i` in `0..total`.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    total: usize,
    maxavail: usize,
    counts: Option<Vec<i64>>,
}

impl ResourcePool {
    pub fn new(total: usize, maxavail: usize) -> Self {
        Self {
            total,
            maxavail: maxavail.max(1),
            counts: None,
        }
    }

    pub fn num_total(&self) -> usize {
        self.total
    }

    pub fn max_available(&self) -> usize {
        self.maxavail
    }

    /// Sum of the non-negative counts, or the total before first use.
    pub fn num_available(&self) -> usize {
        match &self.counts {
            None => self.total,
            Some(counts) => counts.iter().map(|c| (*c).max(0) as usize).sum(),
        }
    }

    /// Takes `num` slot ids, most-available first, lowest index on ties.
    pub fn get(&mut self, num: usize) -> Vec<usize> {
        let mut ids = Vec::with_capacity(num);
        if num == 0 {
            return ids;
        }

        let maxavail = self.maxavail;
        let total = self.total;
        let counts = self.counts.get_or_insert_with(|| {
            let mut c = vec![0i64; maxavail];
            for i in 0..total {
                c[i % maxavail] += 1;
            }
            c
        });

        while ids.len() < num {
            let mut order: Vec<usize> = (0..counts.len()).collect();
            order.sort_by(|a, b| counts[*b].cmp(&counts[*a]).then(a.cmp(b)));

            for idx in order {
                ids.push(idx);
                counts[idx] -= 1;
                if ids.len() == num {
                    break;
                }
            }
        }

        ids
    }

    /// Returns slot ids taken by [`get`](Self::get).
    pub fn put(&mut self, ids: &[usize]) {
        if let Some(counts) = self.counts.as_mut() {
            for idx in ids {
                if let Some(c) = counts.get_mut(*idx) {
                    *c += 1;
                }
            }
        }
    }
}

/// Slots held by one running test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub procs: Vec<usize>,
    pub devices: Vec<usize>,

    /// Total and distinct processor slots of the machine.
    pub maxprocs: (usize, usize),
}

/// Processor pool plus an optional device pool.
#[derive(Debug, Clone)]
pub struct MachinePool {
    procs: ResourcePool,
    devices: Option<ResourcePool>,
}

impl MachinePool {
    /// `num_procs` processor slots over `max_procs` distinct indices, and
    /// likewise for devices. A device count of zero means no device pool.
    pub fn new(num_procs: usize, max_procs: usize, num_devices: usize, max_devices: usize) -> Self {
        let devices = (num_devices > 0 || max_devices > 0)
            .then(|| ResourcePool::new(num_devices, max_devices.max(num_devices)));
        Self {
            procs: ResourcePool::new(num_procs.max(1), max_procs.max(num_procs).max(1)),
            devices,
        }
    }

    /// Pool large enough for the given size and nothing more.
    pub fn sized_for(size: Size) -> Self {
        Self::new(size.0, size.0, size.1, size.1)
    }

    pub fn total_size(&self) -> Size {
        (
            self.procs.num_total(),
            self.devices.as_ref().map_or(0, ResourcePool::num_total),
        )
    }

    pub fn max_size(&self) -> Size {
        (
            self.procs.max_available(),
            self.devices.as_ref().map_or(0, ResourcePool::max_available),
        )
    }

    pub fn size_available(&self) -> Size {
        (
            self.procs.num_available(),
            self.devices.as_ref().map_or(0, ResourcePool::num_available),
        )
    }

    pub fn get_resources(&mut self, size: Size) -> Allocation {
        let (np, nd) = size;
        let procs = self.procs.get(np);
        let devices = match self.devices.as_mut() {
            Some(pool) => pool.get(nd),
            None => Vec::new(),
        };
        Allocation {
            procs,
            devices,
            maxprocs: (self.procs.num_total(), self.procs.max_available()),
        }
    }

    pub fn return_resources(&mut self, alloc: &Allocation) {
        self.procs.put(&alloc.procs);
        if let Some(pool) = self.devices.as_mut() {
            pool.put(&alloc.devices);
        }
    }
}
