//! Sector allocator: buckets, open buckets, the btree write point, and the
//! filesystem-wide disk reservation.
//!
//! Each device is divided into fixed-size buckets. An allocation opens a
//! bucket and carves sectors from it front to back; the open-bucket handle
//! pins the bucket against reuse until every holder has put it back. The
//! btree write point keeps one open bucket per device across allocations so
//! consecutive node writes pack densely.

use crate::{
    bkey::DiskPtr,
    config::Config,
    error::{Error, Result},
};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;

/// Tiered reserve classes. Topology changes may dip below the normal
/// watermark so the tree can make forward progress while the allocator
/// itself is constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReserveClass {
    None,
    Btree,
    Alloc,
}

impl ReserveClass {
    /// Free buckets a device must retain for an allocation of this class.
    fn watermark(self) -> usize {
        match self {
            ReserveClass::None => 8,
            ReserveClass::Btree => 4,
            ReserveClass::Alloc => 0,
        }
    }
}

struct Bucket {
    sectors_free: u32,
    pins: u32,
}

struct Dev {
    bucket_sectors: u32,
    buckets: Vec<Bucket>,
    free: VecDeque<u32>,
}

/// A pin on one allocator bucket, preventing its reuse while data written
/// there is not yet reachable.
#[derive(Debug)]
pub struct OpenBucket {
    pub dev: u8,
    pub bucket: u32,
}

/// One partially-filled bucket the write point carves from.
struct WpBucket {
    dev: u8,
    bucket: u32,
    /// Next sector to hand out, relative to the bucket start.
    fill: u32,
    sectors_free: u32,
}

struct AllocState {
    devs: Vec<Dev>,
    /// The btree write point: at most one open bucket per device.
    write_point: Vec<WpBucket>,
    next_dev: usize,
}

pub struct SectorAlloc {
    state: Mutex<AllocState>,
    free_cond: Condvar,
    total_sectors: u64,
    resv: Mutex<u64>,
    resv_cond: Condvar,
}

/// Reserved sectors, to be released exactly once.
#[derive(Debug)]
pub struct DiskReservation {
    pub sectors: u64,
}

impl SectorAlloc {
    pub fn new(config: &Config) -> Self {
        let devs: Vec<Dev> = config
            .devices
            .iter()
            .map(|d| Dev {
                bucket_sectors: d.bucket_sectors,
                buckets: (0..d.nr_buckets)
                    .map(|_| Bucket {
                        sectors_free: d.bucket_sectors,
                        pins: 0,
                    })
                    .collect(),
                free: (0..d.nr_buckets).collect(),
            })
            .collect();
        let total: u64 = devs
            .iter()
            .map(|d| d.free.len() as u64 * d.bucket_sectors as u64)
            .sum();
        SectorAlloc {
            state: Mutex::new(AllocState {
                devs,
                write_point: Vec::new(),
                next_dev: 0,
            }),
            free_cond: Condvar::new(),
            total_sectors: total,
            resv: Mutex::new(total),
            resv_cond: Condvar::new(),
        }
    }

    /// Reserve `sectors` against the filesystem-wide free pool.
    pub fn disk_reservation_get(&self, sectors: u64, nowait: bool) -> Result<DiskReservation> {
        if sectors > self.total_sectors {
            return Err(Error::NoSpaceDisk);
        }
        let mut avail = self.resv.lock();
        while *avail < sectors {
            if nowait {
                return Err(Error::WouldBlock);
            }
            self.resv_cond.wait(&mut avail);
        }
        *avail -= sectors;
        Ok(DiskReservation { sectors })
    }

    pub fn disk_reservation_put(&self, res: DiskReservation) {
        let mut avail = self.resv.lock();
        *avail += res.sectors;
        drop(avail);
        self.resv_cond.notify_all();
    }

    /// Allocate `sectors` at `nr_replicas`, one pointer per replica, all
    /// replicas on distinct devices. Returns the pointers and one bucket
    /// pin per replica.
    ///
    /// A write-point bucket with fewer than `sectors` free is marked
    /// zero-free and the allocation retried, so a node never straddles a
    /// bucket boundary and short buckets do not cause repeated partial
    /// fills.
    pub fn alloc_sectors(
        &self,
        sectors: u32,
        nr_replicas: usize,
        reserve: ReserveClass,
        nowait: bool,
    ) -> Result<(Vec<DiskPtr>, Vec<OpenBucket>)> {
        let mut s = self.state.lock();
        assert!(nr_replicas <= s.devs.len(), "more replicas than devices");
        loop {
            self.fill_write_point(&mut s, nr_replicas, reserve, nowait)?;

            let short: Vec<usize> = s
                .write_point
                .iter()
                .enumerate()
                .filter(|(_, wb)| wb.sectors_free < sectors)
                .map(|(i, _)| i)
                .collect();
            if !short.is_empty() {
                // Retire short buckets rather than splitting the write.
                for i in short.into_iter().rev() {
                    let wb = s.write_point.remove(i);
                    trace!(
                        "write point: retiring short bucket {}:{} ({} free)",
                        wb.dev,
                        wb.bucket,
                        wb.sectors_free
                    );
                    s.devs[wb.dev as usize].buckets[wb.bucket as usize].sectors_free = 0;
                }
                continue;
            }

            let mut ptrs = Vec::with_capacity(nr_replicas);
            let mut obs = Vec::with_capacity(nr_replicas);
            let dev_bucket_sectors: Vec<u64> =
                s.devs.iter().map(|d| d.bucket_sectors as u64).collect();
            for wb in s.write_point.iter_mut().take(nr_replicas) {
                let offset =
                    wb.bucket as u64 * dev_bucket_sectors[wb.dev as usize] + wb.fill as u64;
                wb.fill += sectors;
                wb.sectors_free -= sectors;
                ptrs.push(DiskPtr {
                    dev: wb.dev,
                    offset,
                });
                obs.push(OpenBucket {
                    dev: wb.dev,
                    bucket: wb.bucket,
                });
            }
            for ob in &obs {
                let b = &mut s.devs[ob.dev as usize].buckets[ob.bucket as usize];
                b.pins += 1;
                b.sectors_free -= sectors;
            }
            trace!("alloc_sectors: {} sectors at {:?}", sectors, ptrs);
            return Ok((ptrs, obs));
        }
    }

    /// Ensure the write point holds `nr` open buckets on distinct devices.
    fn fill_write_point(
        &self,
        s: &mut MutexGuard<'_, AllocState>,
        nr: usize,
        reserve: ReserveClass,
        nowait: bool,
    ) -> Result<()> {
        while s.write_point.len() < nr {
            let nr_devs = s.devs.len();
            let mut picked = None;
            for i in 0..nr_devs {
                let dev = (s.next_dev + i) % nr_devs;
                if s.write_point.iter().any(|wb| wb.dev as usize == dev) {
                    continue;
                }
                if s.devs[dev].free.len() > reserve.watermark() {
                    picked = Some(dev);
                    break;
                }
            }
            let dev = match picked {
                Some(dev) => dev,
                None => {
                    if s.devs.iter().all(|d| d.free.is_empty()) {
                        if nowait {
                            return Err(Error::WouldBlock);
                        }
                        warn!("allocator: no free buckets, waiting");
                        self.free_cond.wait(s);
                        continue;
                    }
                    debug!("allocator: below {:?} watermark", reserve);
                    return Err(Error::NoSpaceAlloc);
                }
            };
            s.next_dev = (dev + 1) % nr_devs;
            let bucket = s.devs[dev].free.pop_front().expect("watermark checked");
            let sectors = s.devs[dev].bucket_sectors;
            s.write_point.push(WpBucket {
                dev: dev as u8,
                bucket,
                fill: 0,
                sectors_free: sectors,
            });
        }
        Ok(())
    }

    /// Drop one bucket pin.
    pub fn open_bucket_put(&self, ob: OpenBucket) {
        let mut s = self.state.lock();
        let b = &mut s.devs[ob.dev as usize].buckets[ob.bucket as usize];
        assert!(b.pins > 0);
        b.pins -= 1;
        self.maybe_requeue(&mut s, ob.dev, ob.bucket);
        drop(s);
        self.free_cond.notify_all();
    }

    pub fn open_buckets_put(&self, obs: impl IntoIterator<Item = OpenBucket>) {
        for ob in obs {
            self.open_bucket_put(ob);
        }
    }

    /// Return the sectors of an extent that is no longer reachable.
    pub fn release_sectors(&self, ptr: DiskPtr, sectors: u32) {
        let mut s = self.state.lock();
        let bucket_sectors = s.devs[ptr.dev as usize].bucket_sectors;
        let bucket = (ptr.offset / bucket_sectors as u64) as u32;
        let b = &mut s.devs[ptr.dev as usize].buckets[bucket as usize];
        b.sectors_free += sectors;
        assert!(b.sectors_free <= bucket_sectors);
        self.maybe_requeue(&mut s, ptr.dev, bucket);
        drop(s);
        self.free_cond.notify_all();
        let mut avail = self.resv.lock();
        *avail += sectors as u64;
        drop(avail);
        self.resv_cond.notify_all();
    }

    fn maybe_requeue(&self, s: &mut AllocState, dev: u8, bucket: u32) {
        let in_wp = s
            .write_point
            .iter()
            .any(|wb| wb.dev == dev && wb.bucket == bucket);
        let d = &mut s.devs[dev as usize];
        let b = &d.buckets[bucket as usize];
        if b.pins == 0 && b.sectors_free == d.bucket_sectors && !in_wp && !d.free.contains(&bucket)
        {
            d.free.push_back(bucket);
        }
    }

    pub fn free_buckets(&self, dev: u8) -> usize {
        self.state.lock().devs[dev as usize].free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DeviceConfig};

    fn alloc() -> SectorAlloc {
        SectorAlloc::new(&Config {
            devices: vec![DeviceConfig {
                nr_buckets: 32,
                bucket_sectors: 256,
            }],
            ..Config::default()
        })
    }

    #[test]
    fn sequential_allocations_pack_one_bucket() {
        let a = alloc();
        let (p1, ob1) = a.alloc_sectors(64, 1, ReserveClass::None, false).unwrap();
        let (p2, ob2) = a.alloc_sectors(64, 1, ReserveClass::None, false).unwrap();
        assert_eq!(p1[0].offset + 64, p2[0].offset);
        a.open_buckets_put(ob1);
        a.open_buckets_put(ob2);
    }

    #[test]
    fn short_bucket_is_retired_not_split() {
        let a = alloc();
        let mut obs = vec![];
        for _ in 0..3 {
            let (_, ob) = a.alloc_sectors(64, 1, ReserveClass::None, false).unwrap();
            obs.extend(ob);
        }
        // 64 sectors left in the open bucket; a 128-sector ask must come
        // from a fresh bucket at a bucket-aligned offset.
        let (p, ob) = a.alloc_sectors(128, 1, ReserveClass::None, false).unwrap();
        assert_eq!(p[0].offset % 256, 0);
        assert_ne!(p[0].offset, 192);
        obs.extend(ob);
        a.open_buckets_put(obs);
    }

    #[test]
    fn reservation_nowait_fails_when_exhausted() {
        let a = alloc();
        let total = 32 * 256;
        let r = a.disk_reservation_get(total, true).unwrap();
        assert!(matches!(
            a.disk_reservation_get(64, true),
            Err(Error::WouldBlock)
        ));
        a.disk_reservation_put(r);
        let r = a.disk_reservation_get(64, true).unwrap();
        a.disk_reservation_put(r);
    }

    #[test]
    fn oversize_reservation_is_no_space() {
        let a = alloc();
        assert!(matches!(
            a.disk_reservation_get(u64::MAX, false),
            Err(Error::NoSpaceDisk)
        ));
    }
}
