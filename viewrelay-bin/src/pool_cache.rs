use std::path::Path;

use anyhow::Result;
use viewrelay_lib::proxy::{Protocol, ProxyCandidate, ProxyPool, ProxyState};

/// The addresses of a pool, as written to and read from disk
pub(crate) type PoolSnapshot = Vec<ProxyCandidate>;

pub(crate) trait StoreExt {
    fn store<T: AsRef<Path>>(&self, path: T) -> Result<usize>;
    fn load<T: AsRef<Path>>(path: T) -> Result<PoolSnapshot>;
}

/// Take every proxy that is not dead
pub(crate) fn snapshot(pool: &ProxyPool) -> PoolSnapshot {
    pool.snapshot()
        .into_iter()
        .filter(|record| record.state != ProxyState::Dead)
        .map(|record| record.candidate())
        .collect()
}

impl StoreExt for PoolSnapshot {
    fn store<T: AsRef<Path>>(&self, path: T) -> Result<usize> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        for candidate in self {
            wtr.serialize((&candidate.address, candidate.port, candidate.protocol))?;
        }
        wtr.flush()?;
        Ok(self.len())
    }

    fn load<T: AsRef<Path>>(path: T) -> Result<PoolSnapshot> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        let mut snapshot = Vec::new();
        for result in rdr.deserialize() {
            let (address, port, protocol): (String, u16, Protocol) = result?;
            snapshot.push(ProxyCandidate {
                address,
                port,
                protocol,
            });
        }
        Ok(snapshot)
    }
}
