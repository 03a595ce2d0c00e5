//! The filesystem context: collaborator wiring and lifecycle.
//!
//! Every entry point of the engine takes the mounted [Filesystem]; the
//! process-wide singletons (reserve cache, update table, root registry,
//! journal, allocator, node cache) live here and are initialised at mount.

use crate::{
    bkey::PtrKey,
    cache::NodeCache,
    config::Config,
    error::{Error, Result},
    io::IoEngine,
    journal::Journal,
    node::{flags, Node, NodeImage},
    replicas::Replicas,
    root::RootRegistry,
    update::InteriorUpdates,
    BtreeId,
};
use log::{debug, info};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

pub struct Filesystem {
    pub config: Config,
    pub journal: Journal,
    pub alloc: crate::alloc::SectorAlloc,
    pub cache: NodeCache,
    pub replicas: Replicas,
    pub roots: RootRegistry,
    pub interior: InteriorUpdates,
    pub io: IoEngine,
    node_seq: AtomicU64,
}

impl Filesystem {
    /// Initialise all collaborators and start the background workers.
    pub fn mount(config: Config) -> Arc<Filesystem> {
        #[cfg(feature = "init_env_logger")]
        let _ = env_logger::try_init();

        let fs = Arc::new(Filesystem {
            journal: Journal::new(config.journal_u64s),
            alloc: crate::alloc::SectorAlloc::new(&config),
            cache: NodeCache::new(config.cache_capacity),
            replicas: Replicas::default(),
            roots: RootRegistry::default(),
            interior: InteriorUpdates::new(),
            io: IoEngine::new(config.devices.len(), config.inline_io),
            node_seq: AtomicU64::new(1),
            config,
        });
        InteriorUpdates::start(&fs);
        IoEngine::start(&fs);
        info!("mounted: {} devices", fs.config.devices.len());
        fs
    }

    /// Quiesce pending updates, drain the reserve cache and stop workers.
    pub fn unmount(&self) {
        self.interior.wait_quiesce();
        self.interior.drain_reserve(self);
        self.interior.stop();
        self.io.stop();
        info!("unmounted");
    }

    pub fn next_node_seq(&self) -> u64 {
        self.node_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether any pending update defers this node's next write.
    pub fn interior_write_blocked(&self, nid: u64) -> bool {
        self.interior
            .state
            .lock()
            .write_blocked
            .get(&nid)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Seal the open journal entry with a complete root snapshot.
    pub fn journal_flush(&self) -> Result<u64> {
        self.journal.commit(self.roots.roots_to_journal_entries())
    }

    /// Find a node by pointer key, faulting it in from disk on a cache
    /// miss.
    pub fn node_get(&self, btree_id: BtreeId, level: u8, ptr: &PtrKey) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.lookup(ptr) {
            return Ok(node);
        }
        let first = ptr.ptrs().first().ok_or(Error::Interrupted)?;
        let bytes = self
            .io
            .read_sector(first.dev, first.offset)
            .ok_or(Error::Interrupted)?;
        let image = NodeImage::unpack(&bytes).ok_or(Error::Interrupted)?;
        assert_eq!(image.btree_id, btree_id);
        assert_eq!(image.level, level);

        let node = self.cache.mem_alloc(btree_id, level, ptr.clone());
        {
            let mut data = node.data.lock();
            data.min_key = image.min_key;
            data.max_key = image.max_key;
            data.seq = image.seq;
            data.bset_journal_seq = image.bset_journal_seq;
            data.keys = image.keys;
            data.recount();
        }
        node.flag_clear(flags::FAKE);
        node.flag_set(flags::DATA_WRITTEN);
        self.cache.hash_insert(&node);
        node.lock.unlock_write();
        node.lock.unlock_intent();
        debug!("faulted in node {} at level {}", node.nid, level);
        Ok(node)
    }
}
