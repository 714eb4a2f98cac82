//! Savestate-bound clustered filesystem.
//!
//! A single append-growable backing file is tiled into 8 KiB clusters;
//! 2048 clusters form a 16 MiB supercluster whose first cluster holds the
//! allocation table for the whole supercluster (2048 big-endian u32 chain
//! entries). Entry values: 0 = free, 1 = end of chain, 0xFFFFFFFF =
//! system/reserved, anything else = next cluster in the chain.
//!
//! Cluster 0 is the first table, cluster 1 the superblock (16-byte magic),
//! cluster 2 the root file's first cluster.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub const CLUSTER_SIZE: u32 = 8192;
pub const CLUSTERS_PER_SUPER: u32 = CLUSTER_SIZE / 4;
pub const SUPERCLUSTER_SIZE: u64 = CLUSTER_SIZE as u64 * CLUSTERS_PER_SUPER as u64;
pub const SUPERBLOCK_CLUSTER: u32 = 1;
pub const ROOT_CLUSTER: u32 = 2;

const END_OF_CHAIN: u32 = 1;
const SYSTEM: u32 = 0xFFFF_FFFF;
const MAGIC: &[u8; 11] = b"sefs-magic\0";

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("bad filesystem magic")]
    BadMagic,
    #[error("cluster {cluster} is free or reserved")]
    DoubleFree { cluster: u32 },
    #[error("cluster 2 can't be freed")]
    RootCluster,
    #[error("bad cluster {cluster}")]
    BadCluster { cluster: u32 },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

struct Supercluster {
    free_clusters: u32,
    clusters: Vec<u32>,
}

impl Supercluster {
    fn load(backing: &mut File, index: u32) -> Result<Self, VfsError> {
        let mut buffer = vec![0u8; CLUSTER_SIZE as usize];
        backing.seek(SeekFrom::Start(SUPERCLUSTER_SIZE * index as u64))?;
        backing.read_exact(&mut buffer)?;
        let mut clusters = Vec::with_capacity(CLUSTERS_PER_SUPER as usize);
        let mut free_clusters = 0;
        for i in 0..CLUSTERS_PER_SUPER as usize {
            let entry = u32::from_be_bytes([
                buffer[4 * i],
                buffer[4 * i + 1],
                buffer[4 * i + 2],
                buffer[4 * i + 3],
            ]);
            if entry == 0 {
                free_clusters += 1;
            }
            clusters.push(entry);
        }
        Ok(Self {
            free_clusters,
            clusters,
        })
    }
}

/// The filesystem proper. Not internally synchronized; see [`FsHandle`]
/// for the shared, locked form.
pub struct ClusterFs {
    backing: File,
    superclusters: Vec<Supercluster>,
}

impl ClusterFs {
    /// Open an existing filesystem or create one in an empty backing file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VfsError> {
        let mut backing = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let backing_size = backing.seek(SeekFrom::End(0))?;
        let supercluster_count = backing_size.div_ceil(SUPERCLUSTER_SIZE) as u32;
        let mut superclusters = Vec::with_capacity(supercluster_count as usize);
        for i in 0..supercluster_count {
            superclusters.push(Supercluster::load(&mut backing, i)?);
        }
        let mut fs = Self {
            backing,
            superclusters,
        };
        if supercluster_count == 0 {
            // Fresh backing: growing allocates cluster 2 (the root file).
            fs.allocate_cluster()?;
            let mut superblock = vec![0u8; CLUSTER_SIZE as usize];
            superblock[..MAGIC.len()].copy_from_slice(MAGIC);
            let mut cluster = SUPERBLOCK_CLUSTER;
            let mut ptr = 0;
            fs.write_data(&mut cluster, &mut ptr, &superblock)?;
            tracing::info!(path = %path.as_ref().display(), "created clustered filesystem");
        } else {
            let mut superblock = [0u8; 16];
            let mut cluster = SUPERBLOCK_CLUSTER;
            let mut ptr = 0;
            fs.read_data(&mut cluster, &mut ptr, &mut superblock)?;
            if &superblock[..MAGIC.len()] != MAGIC {
                return Err(VfsError::BadMagic);
            }
        }
        Ok(fs)
    }

    fn entry(&self, cluster: u32) -> u32 {
        self.superclusters[(cluster / CLUSTERS_PER_SUPER) as usize].clusters
            [(cluster % CLUSTERS_PER_SUPER) as usize]
    }

    fn set_entry(&mut self, cluster: u32, value: u32) {
        let sc = &mut self.superclusters[(cluster / CLUSTERS_PER_SUPER) as usize];
        let slot = &mut sc.clusters[(cluster % CLUSTERS_PER_SUPER) as usize];
        match (*slot, value) {
            (0, v) if v != 0 => sc.free_clusters -= 1,
            (e, 0) if e != 0 => sc.free_clusters += 1,
            _ => {}
        }
        *slot = value;
    }

    fn save_table(&mut self, supercluster: u32) -> Result<(), VfsError> {
        let sc = &self.superclusters[supercluster as usize];
        let mut buffer = vec![0u8; CLUSTER_SIZE as usize];
        for (i, entry) in sc.clusters.iter().enumerate() {
            buffer[4 * i..4 * i + 4].copy_from_slice(&entry.to_be_bytes());
        }
        self.backing
            .seek(SeekFrom::Start(SUPERCLUSTER_SIZE * supercluster as u64))?;
        self.backing.write_all(&buffer)?;
        Ok(())
    }

    /// Check that a cluster may appear inside a chain: in range, not a
    /// table cluster, not free.
    fn validate_chain_cluster(&self, cluster: u32) -> Result<(), VfsError> {
        if (cluster / CLUSTERS_PER_SUPER) as usize >= self.superclusters.len()
            || cluster % CLUSTERS_PER_SUPER == 0
            || self.entry(cluster) == 0
        {
            return Err(VfsError::BadCluster { cluster });
        }
        Ok(())
    }

    /// Allocate one cluster, marked end-of-chain and zeroed on disk.
    /// Returns its global index. Grows the backing by a supercluster when
    /// everything is full.
    pub fn allocate_cluster(&mut self) -> Result<u32, VfsError> {
        for i in 0..self.superclusters.len() {
            if self.superclusters[i].free_clusters == 0 {
                continue;
            }
            let Some(j) = self.superclusters[i].clusters.iter().position(|&e| e == 0) else {
                continue;
            };
            let cluster = i as u32 * CLUSTERS_PER_SUPER + j as u32;
            self.set_entry(cluster, END_OF_CHAIN);
            self.save_table(i as u32)?;
            self.zero_cluster(cluster)?;
            return Ok(cluster);
        }

        // Everything in use: append a fresh supercluster.
        let index = self.superclusters.len() as u32;
        let first = index == 0;
        let mut sc = Supercluster {
            free_clusters: 0,
            clusters: vec![0; CLUSTERS_PER_SUPER as usize],
        };
        sc.clusters[0] = SYSTEM; // Cluster table.
        if first {
            sc.clusters[1] = SYSTEM; // Superblock.
        }
        let slot = if first { 2 } else { 1 };
        sc.clusters[slot] = END_OF_CHAIN;
        sc.free_clusters = sc.clusters.iter().filter(|&&e| e == 0).count() as u32;
        self.superclusters.push(sc);
        self.save_table(index)?;
        // Zero the reserved and newly allocated clusters on disk.
        for c in 1..=slot as u32 {
            self.zero_cluster(index * CLUSTERS_PER_SUPER + c)?;
        }
        tracing::debug!(supercluster = index, "grew clustered filesystem");
        Ok(index * CLUSTERS_PER_SUPER + slot as u32)
    }

    fn zero_cluster(&mut self, cluster: u32) -> Result<(), VfsError> {
        let zeros = vec![0u8; CLUSTER_SIZE as usize];
        self.backing
            .seek(SeekFrom::Start(cluster as u64 * CLUSTER_SIZE as u64))?;
        self.backing.write_all(&zeros)?;
        Ok(())
    }

    /// Extend a chain: `cluster` must currently be an end-of-chain marker.
    pub fn link_cluster(&mut self, cluster: u32, linkto: u32) -> Result<(), VfsError> {
        let count = self.superclusters.len() as u32;
        if cluster / CLUSTERS_PER_SUPER >= count {
            return Err(VfsError::BadCluster { cluster });
        }
        if linkto / CLUSTERS_PER_SUPER >= count {
            return Err(VfsError::BadCluster { cluster: linkto });
        }
        if self.entry(cluster) != END_OF_CHAIN {
            return Err(VfsError::BadCluster { cluster });
        }
        self.set_entry(cluster, linkto);
        self.save_table(cluster / CLUSTERS_PER_SUPER)
    }

    /// Free a whole chain starting at `head`. The root cluster and
    /// system/free clusters are refused.
    pub fn free_cluster_chain(&mut self, head: u32) -> Result<(), VfsError> {
        if head == ROOT_CLUSTER {
            return Err(VfsError::RootCluster);
        }
        let mut cluster = head;
        loop {
            if (cluster / CLUSTERS_PER_SUPER) as usize >= self.superclusters.len() {
                return Err(VfsError::BadCluster { cluster });
            }
            let next = self.entry(cluster);
            if next == 0 || next == SYSTEM {
                return Err(VfsError::DoubleFree { cluster });
            }
            self.set_entry(cluster, 0);
            // Persist the table when the chain leaves this supercluster or
            // ends.
            if next == END_OF_CHAIN || next / CLUSTERS_PER_SUPER != cluster / CLUSTERS_PER_SUPER
            {
                self.save_table(cluster / CLUSTERS_PER_SUPER)?;
            }
            if next == END_OF_CHAIN {
                return Ok(());
            }
            cluster = next;
        }
    }

    /// Read up to `buf.len()` bytes starting at `(cluster, ptr)`, following
    /// the chain. Returns the bytes read, short only at end of chain, in
    /// which case `cluster`/`ptr` are left at the last valid position with
    /// `ptr` pinned to [`CLUSTER_SIZE`].
    pub fn read_data(
        &mut self,
        cluster: &mut u32,
        ptr: &mut u32,
        buf: &mut [u8],
    ) -> Result<usize, VfsError> {
        let mut done = 0;
        loop {
            self.validate_chain_cluster(*cluster)?;
            let maxread = (buf.len() - done).min((CLUSTER_SIZE.max(*ptr) - *ptr) as usize);
            if maxread > 0 {
                self.backing.seek(SeekFrom::Start(
                    *cluster as u64 * CLUSTER_SIZE as u64 + *ptr as u64,
                ))?;
                self.backing.read_exact(&mut buf[done..done + maxread])?;
                done += maxread;
                *ptr += maxread as u32;
            }
            if *ptr >= CLUSTER_SIZE {
                let next = self.entry(*cluster);
                if next == 0 {
                    return Err(VfsError::BadCluster { cluster: *cluster });
                }
                if next == END_OF_CHAIN || next == SYSTEM {
                    *ptr = CLUSTER_SIZE;
                    return Ok(done);
                }
                *cluster = next;
                *ptr = 0;
            }
            if done == buf.len() {
                return Ok(done);
            }
        }
    }

    /// [`read_data`](Self::read_data) without a destination buffer.
    pub fn skip_data(
        &mut self,
        cluster: &mut u32,
        ptr: &mut u32,
        length: u32,
    ) -> Result<usize, VfsError> {
        let mut done = 0;
        loop {
            self.validate_chain_cluster(*cluster)?;
            let maxread = (length as usize - done).min((CLUSTER_SIZE.max(*ptr) - *ptr) as usize);
            done += maxread;
            *ptr += maxread as u32;
            if *ptr >= CLUSTER_SIZE {
                let next = self.entry(*cluster);
                if next == 0 {
                    return Err(VfsError::BadCluster { cluster: *cluster });
                }
                if next == END_OF_CHAIN || next == SYSTEM {
                    *ptr = CLUSTER_SIZE;
                    return Ok(done);
                }
                *cluster = next;
                *ptr = 0;
            }
            if done == length as usize {
                return Ok(done);
            }
        }
    }

    /// Write `data` starting at `(cluster, ptr)`, allocating and linking
    /// clusters to extend the chain as needed. Returns the position where
    /// the write actually began, so callers can record a file's head.
    pub fn write_data(
        &mut self,
        cluster: &mut u32,
        ptr: &mut u32,
        data: &[u8],
    ) -> Result<(u32, u32), VfsError> {
        let mut done = 0;
        let mut real: Option<(u32, u32)> = None;
        loop {
            self.validate_chain_cluster(*cluster)?;
            let maxwrite = (data.len() - done).min((CLUSTER_SIZE.max(*ptr) - *ptr) as usize);
            if maxwrite > 0 {
                if real.is_none() {
                    real = Some((*cluster, *ptr));
                }
                self.backing.seek(SeekFrom::Start(
                    *cluster as u64 * CLUSTER_SIZE as u64 + *ptr as u64,
                ))?;
                self.backing.write_all(&data[done..done + maxwrite])?;
                done += maxwrite;
                *ptr += maxwrite as u32;
            }
            if *ptr >= CLUSTER_SIZE {
                let next = self.entry(*cluster);
                match next {
                    0 => return Err(VfsError::BadCluster { cluster: *cluster }),
                    SYSTEM => {
                        if done < data.len() {
                            return Err(VfsError::BadCluster { cluster: *cluster });
                        }
                        return Ok(real.unwrap_or((*cluster, *ptr)));
                    }
                    END_OF_CHAIN => {
                        if done == data.len() {
                            *ptr = CLUSTER_SIZE;
                            return Ok(real.unwrap_or((*cluster, *ptr)));
                        }
                        let fresh = self.allocate_cluster()?;
                        self.link_cluster(*cluster, fresh)?;
                        *cluster = fresh;
                        *ptr = 0;
                    }
                    _ => {
                        *cluster = next;
                        *ptr = 0;
                    }
                }
            }
            if done == data.len() {
                return Ok(real.unwrap_or((*cluster, *ptr)));
            }
        }
    }

    #[cfg(test)]
    fn table_entry(&self, cluster: u32) -> u32 {
        self.entry(cluster)
    }

    #[cfg(test)]
    fn free_count(&self, supercluster: u32) -> u32 {
        self.superclusters[supercluster as usize].free_clusters
    }
}

/// Shared, internally locked handle to a [`ClusterFs`]. Cloning the handle
/// is the reference-count operation; every filesystem call serializes on
/// the per-object lock.
#[derive(Clone)]
pub struct FsHandle {
    fs: Arc<Mutex<ClusterFs>>,
}

impl FsHandle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VfsError> {
        Ok(Self {
            fs: Arc::new(Mutex::new(ClusterFs::open(path)?)),
        })
    }

    pub fn allocate_cluster(&self) -> Result<u32, VfsError> {
        self.fs.lock().allocate_cluster()
    }

    pub fn link_cluster(&self, cluster: u32, linkto: u32) -> Result<(), VfsError> {
        self.fs.lock().link_cluster(cluster, linkto)
    }

    pub fn free_cluster_chain(&self, head: u32) -> Result<(), VfsError> {
        self.fs.lock().free_cluster_chain(head)
    }

    pub fn read_data(
        &self,
        cluster: &mut u32,
        ptr: &mut u32,
        buf: &mut [u8],
    ) -> Result<usize, VfsError> {
        self.fs.lock().read_data(cluster, ptr, buf)
    }

    pub fn skip_data(&self, cluster: &mut u32, ptr: &mut u32, length: u32) -> Result<usize, VfsError> {
        self.fs.lock().skip_data(cluster, ptr, length)
    }

    pub fn write_data(
        &self,
        cluster: &mut u32,
        ptr: &mut u32,
        data: &[u8],
    ) -> Result<(u32, u32), VfsError> {
        self.fs.lock().write_data(cluster, ptr, data)
    }
}
