use std::path::Path;

use prost::Message;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    SledError(#[from] sled::Error),
    #[error(transparent)]
    ProstDecodeError(#[from] prost::DecodeError),
    #[error(transparent)]
    ProstEncodeError(#[from] prost::EncodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A [sled::Db] that stores protobuf encoded values.
///
/// [ProtoDb] provides methods to make it easier store and retrieve protobuf
/// encoded data in a Sled database. Cloning is cheap, clones share the same
/// underlying database.
#[derive(Clone, Debug)]
pub struct ProtoDb(sled::Db);

impl From<sled::Db> for ProtoDb {
    fn from(db: sled::Db) -> Self {
        Self(db)
    }
}

fn encode<T: Message>(msg: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)?;
    Ok(buf)
}

impl ProtoDb {
    /// Open (or create) the database rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self(sled::open(path)?))
    }

    /// Open a database that is deleted when the last clone is dropped.
    pub fn temporary() -> Result<Self> {
        Ok(Self(sled::Config::new().temporary(true).open()?))
    }

    /// Get a value by its key.
    pub fn get<K, T>(&self, key: K) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        T: Message + Default,
    {
        let maybe_data = self.0.get(key)?;
        if let Some(data) = maybe_data {
            let msg = T::decode(&*data)?;
            Ok(Some(msg))
        } else {
            Ok(None)
        }
    }

    /// Atomically retrieve then update a value.
    ///
    /// Returning `None` from `f` removes the value.
    pub fn update_and_fetch<K, V, F, T>(
        &self,
        key: K,
        mut f: F,
    ) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        F: FnMut(Option<T>) -> Option<V>,
        V: Into<T>,
        T: Message + Default,
    {
        // Escape the scoping of the closure so we can report the error.
        let mut err: Option<Error> = None;
        let maybe_data = self.0.update_and_fetch(key, |maybe_data| {
            let maybe_msg = match maybe_data.map(T::decode) {
                Some(Ok(value)) => Some(value),
                Some(Err(e)) => {
                    err = Some(e.into());
                    None
                }
                None => None,
            };
            let inserted: T = f(maybe_msg)?.into();
            match encode(&inserted) {
                Ok(buf) => Some(buf),
                Err(e) => {
                    err = Some(e);
                    None
                }
            }
        })?;

        if let Some(e) = err {
            return Err(e);
        }

        if let Some(data) = maybe_data {
            let msg = T::decode(&*data)?;
            Ok(Some(msg))
        } else {
            Ok(None)
        }
    }

    /// Insert a value into the database, returning the previous value.
    ///
    /// The swap is atomic so of two concurrent inserts on the same key exactly
    /// one observes `None`.
    pub fn insert<K, V, T>(&self, key: K, value: V) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        V: Into<T>,
        T: Message + Default,
    {
        let msg: T = value.into();
        let maybe_inserted = self.0.insert(key, encode(&msg)?)?;
        if let Some(inserted) = maybe_inserted {
            let msg = T::decode(&*inserted)?;
            Ok(Some(msg))
        } else {
            Ok(None)
        }
    }

    /// Remove a value, returning it if it was present.
    ///
    /// Removal is atomic, a value can only be taken once.
    pub fn remove<K, T>(&self, key: K) -> Result<Option<T>>
    where
        K: AsRef<[u8]>,
        T: Message + Default,
    {
        match self.0.remove(key)? {
            Some(data) => Ok(Some(T::decode(&*data)?)),
            None => Ok(None),
        }
    }

    /// Decode every value whose key starts with `prefix`.
    pub fn scan_prefix<K, T>(&self, prefix: K) -> Result<Vec<T>>
    where
        K: AsRef<[u8]>,
        T: Message + Default,
    {
        self.0
            .scan_prefix(prefix)
            .values()
            .map(|data| -> Result<T> { Ok(T::decode(&*data?)?) })
            .collect()
    }

    /// Remove the values under `prefix` that `keep` rejects, returning how
    /// many were removed.
    ///
    /// A value that changes between the scan and the removal is left alone.
    pub fn retain_prefix<K, T, F>(&self, prefix: K, mut keep: F) -> Result<usize>
    where
        K: AsRef<[u8]>,
        T: Message + Default,
        F: FnMut(&T) -> bool,
    {
        let mut removed = 0;
        for entry in self.0.scan_prefix(prefix) {
            let (key, data) = entry?;
            if keep(&T::decode(&*data)?) {
                continue;
            }
            if self
                .0
                .compare_and_swap(&key, Some(&data), None::<sled::IVec>)?
                .is_ok()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
