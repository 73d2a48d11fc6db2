use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use maxminddb::Reader;
use rustc_hash::FxHashMap;

use crate::address;
use crate::config::ModuleConfig;
use crate::error::{Error, Result};
use crate::record::{LocatedEntry, RecordNode};

/// Read-only access to a geolocation database.
///
/// Implementations must be safe to share between request threads; a lookup
/// keeps all traversal state local to the call.
pub trait GeoDatabase: fmt::Debug + Send + Sync {
    /// Find the record for a normalized address key.
    ///
    /// `Ok(None)` means the address is not covered by the database.
    fn lookup(&self, key: Ipv6Addr) -> Result<Option<LocatedEntry>>;
}

/// A MaxMind DB file loaded into memory.
#[derive(Debug)]
pub struct MaxMindDatabase {
    path: Utf8PathBuf,
    reader: Reader<Vec<u8>>,
}

impl MaxMindDatabase {
    /// Read and validate a database file.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| Error::DatabaseRead {
            path: path.to_owned(),
            source,
        })?;
        let reader = Reader::from_source(bytes).map_err(|source| Error::DatabaseInvalid {
            path: path.to_owned(),
            source,
        })?;
        debug!(
            "opened {path} ({}, built {})",
            reader.metadata.database_type, reader.metadata.build_epoch
        );
        Ok(Self {
            path: path.to_owned(),
            reader,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl GeoDatabase for MaxMindDatabase {
    fn lookup(&self, key: Ipv6Addr) -> Result<Option<LocatedEntry>> {
        // IPv4-mapped keys go back to IPv4 so the reader walks its IPv4 subtree
        let ip = address::canonical(key);
        let found = self.reader.lookup(ip).map_err(|source| Error::Lookup {
            ip: ip.to_string(),
            source,
        })?;
        if !found.has_data() {
            return Ok(None);
        }
        let root: Option<RecordNode> = found.decode().map_err(|source| Error::Lookup {
            ip: ip.to_string(),
            source,
        })?;
        Ok(root.map(LocatedEntry::new))
    }
}

/// An in-memory table of networks, answered by longest prefix match.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    networks: Vec<(u128, u8, RecordNode)>,
}

fn prefix_mask(bits: u8) -> u128 {
    match bits {
        0 => 0,
        b => u128::MAX << (128 - u32::from(b.min(128))),
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a network. IPv4 networks are stored in the IPv4-mapped range.
    pub fn insert(&mut self, network: IpAddr, prefix_len: u8, record: RecordNode) -> &mut Self {
        let (key, bits) = match network {
            IpAddr::V4(v4) => (v4.to_ipv6_mapped(), prefix_len.min(32) + 96),
            IpAddr::V6(v6) => (v6, prefix_len.min(128)),
        };
        let mask = prefix_mask(bits);
        self.networks.push((u128::from(key) & mask, bits, record));
        self
    }
}

impl GeoDatabase for MemoryDatabase {
    fn lookup(&self, key: Ipv6Addr) -> Result<Option<LocatedEntry>> {
        let key = u128::from(key);
        let best = self
            .networks
            .iter()
            .filter(|(net, bits, _)| key & prefix_mask(*bits) == *net)
            .max_by_key(|(_, bits, _)| *bits);
        Ok(best.map(|(_, _, record)| LocatedEntry::new(record.clone())))
    }
}

type Opener = dyn Fn(&Utf8Path) -> Result<Arc<dyn GeoDatabase>> + Send + Sync;

#[derive(Clone)]
enum Slot {
    Ready(Arc<dyn GeoDatabase>),
    Unavailable,
}

/// Process-lifetime owner of every opened database, keyed by path.
///
/// Built at startup, shared with request handling through an `Arc` and
/// dropped at shutdown. A path that fails to open is remembered as
/// unavailable and logged once; requests using it carry on without it.
pub struct DatabaseRegistry {
    opener: Box<Opener>,
    slots: RwLock<FxHashMap<Utf8PathBuf, Slot>>,
}

impl fmt::Debug for DatabaseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseRegistry")
            .field("databases", &self.status())
            .finish()
    }
}

impl Default for DatabaseRegistry {
    fn default() -> Self {
        Self::with_opener(|path| {
            let db: Arc<dyn GeoDatabase> = Arc::new(MaxMindDatabase::open(path)?);
            Ok(db)
        })
    }
}

impl DatabaseRegistry {
    /// A registry that opens databases with `opener`.
    pub fn with_opener<F>(opener: F) -> Self
    where
        F: Fn(&Utf8Path) -> Result<Arc<dyn GeoDatabase>> + Send + Sync + 'static,
    {
        Self {
            opener: Box::new(opener),
            slots: RwLock::new(FxHashMap::default()),
        }
    }

    /// Install an already opened database under `path`.
    pub fn insert(&self, path: impl Into<Utf8PathBuf>, db: Arc<dyn GeoDatabase>) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), Slot::Ready(db));
    }

    /// Open every database an enabled scope refers to. Returns how many are
    /// usable.
    pub fn preload(&self, config: &ModuleConfig) -> usize {
        config
            .database_paths()
            .into_iter()
            .filter(|path| self.get(path).is_some())
            .count()
    }

    /// The database for `path`, opening it on first use.
    pub fn get(&self, path: &Utf8Path) -> Option<Arc<dyn GeoDatabase>> {
        let cached = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned();
        if let Some(slot) = cached {
            return match slot {
                Slot::Ready(db) => Some(db),
                Slot::Unavailable => None,
            };
        }

        let opened = (self.opener)(path);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        // another thread may have opened it meanwhile; the first result stays
        if let Some(slot) = slots.get(path) {
            return match slot {
                Slot::Ready(db) => Some(Arc::clone(db)),
                Slot::Unavailable => None,
            };
        }
        match opened {
            Ok(db) => {
                slots.insert(path.to_owned(), Slot::Ready(Arc::clone(&db)));
                Some(db)
            }
            Err(err) => {
                debug!("geolocation database unavailable: {:#}", anyhow::Error::new(err));
                slots.insert(path.to_owned(), Slot::Unavailable);
                None
            }
        }
    }

    /// Every known path and whether it opened, sorted by path.
    pub fn status(&self) -> Vec<(Utf8PathBuf, bool)> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut status: Vec<_> = slots
            .iter()
            .map(|(path, slot)| (path.clone(), matches!(slot, Slot::Ready(_))))
            .collect();
        status.sort();
        status
    }
}
