#![forbid(unsafe_code)]
//! Transaction collaborator: credit reservation and region capture.
//!
//! A [`Tx`] is prepared with the credit its operations need, opened, fed
//! capture calls while mutations run, and closed into a [`TxRecord`] that
//! carries the after-image of every captured byte. Applying a record to the
//! segment image taken before the transaction reproduces the image after it.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::primitives::seg::Segment;
use crate::types::{fatal, Result, StoreError};

mod credit;
mod regmap;

pub use credit::Credit;
pub use regmap::{Region, RegionMap};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle states of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    /// Accumulating credit.
    Prepare,
    /// Accepting captures.
    Active,
    /// Closed into a record.
    Closed,
}

/// Limits applied when a transaction opens.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    /// Largest number of regions a single transaction may reserve.
    pub max_reg_nr: u64,
    /// Largest number of bytes a single transaction may reserve.
    pub max_reg_size: u64,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            max_reg_nr: 1 << 20,
            max_reg_size: 1 << 30,
        }
    }
}

impl TxOptions {
    /// Limit expressed as a credit.
    pub fn max_credit(&self) -> Credit {
        Credit::new(self.max_reg_nr, self.max_reg_size)
    }
}

struct TxInner {
    state: TxState,
    prepared: Credit,
    captured: Credit,
    regions: RegionMap,
}

/// A single transaction.
pub struct Tx {
    id: u64,
    options: TxOptions,
    inner: Mutex<TxInner>,
}

impl Default for Tx {
    fn default() -> Self {
        Self::new()
    }
}

impl Tx {
    /// Creates a transaction in the prepare state with default limits.
    pub fn new() -> Self {
        Self::with_options(TxOptions::default())
    }

    /// Creates a transaction in the prepare state.
    pub fn with_options(options: TxOptions) -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            options,
            inner: Mutex::new(TxInner {
                state: TxState::Prepare,
                prepared: Credit::ZERO,
                captured: Credit::ZERO,
                regions: RegionMap::new(),
            }),
        }
    }

    /// Identifier unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    /// Adds `credit` to the reservation.
    pub fn prep(&self, credit: Credit) {
        let mut inner = self.inner.lock();
        if inner.state != TxState::Prepare {
            drop(inner);
            fatal("credit prepared outside the prepare state");
        }
        inner.prepared += credit;
    }

    /// Moves the transaction to the active state.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TxState::Prepare {
            drop(inner);
            fatal("transaction opened twice");
        }
        let limit = self.options.max_credit();
        if !inner.prepared.fits(&limit) {
            tracing::warn!(
                target: "segstore::tx",
                tx = self.id,
                reg_nr = inner.prepared.reg_nr,
                reg_size = inner.prepared.reg_size,
                "transaction credit exceeds limit"
            );
            return Err(StoreError::TxTooLarge {
                reg_nr: inner.prepared.reg_nr,
                reg_size: inner.prepared.reg_size,
            });
        }
        inner.state = TxState::Active;
        tracing::debug!(
            target: "segstore::tx",
            tx = self.id,
            reg_nr = inner.prepared.reg_nr,
            reg_size = inner.prepared.reg_size,
            "transaction opened"
        );
        Ok(())
    }

    /// Registers a changed byte range.
    ///
    /// Every call consumes `(1, len)` of the reservation even when the range
    /// was captured before; exceeding the reservation is fatal.
    pub fn capture(&self, region: Region) {
        if region.len == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state != TxState::Active {
            drop(inner);
            fatal("capture on a transaction that is not active");
        }
        inner.captured += Credit::region(region.len);
        if !inner.captured.fits(&inner.prepared) {
            let (captured, prepared) = (inner.captured, inner.prepared);
            drop(inner);
            tracing::error!(
                target: "segstore::tx",
                tx = self.id,
                captured_nr = captured.reg_nr,
                captured_size = captured.reg_size,
                prepared_nr = prepared.reg_nr,
                prepared_size = prepared.reg_size,
                "credit under-reservation"
            );
            fatal("transaction credit under-reservation");
        }
        inner.regions.insert(region);
    }

    /// Credit reserved so far.
    pub fn prepared(&self) -> Credit {
        self.inner.lock().prepared
    }

    /// Credit consumed by capture calls so far.
    pub fn captured(&self) -> Credit {
        self.inner.lock().captured
    }

    /// Merged captured ranges.
    pub fn regions(&self) -> Vec<Region> {
        self.inner.lock().regions.iter().collect()
    }

    /// Reports whether `region` has been captured in full.
    pub fn covers(&self, region: Region) -> bool {
        self.inner.lock().regions.covers(region)
    }

    /// Closes the transaction and snapshots every captured range.
    pub fn close(&self, seg: &Segment) -> TxRecord {
        let mut inner = self.inner.lock();
        if inner.state != TxState::Active {
            drop(inner);
            fatal("closing a transaction that is not active");
        }
        inner.state = TxState::Closed;
        let pin = seg.pin_read();
        let regions = inner
            .regions
            .iter()
            .map(|region| (region, pin.bytes(region.addr, region.len).to_vec()))
            .collect();
        tracing::debug!(
            target: "segstore::tx",
            tx = self.id,
            captured_nr = inner.captured.reg_nr,
            captured_size = inner.captured.reg_size,
            spans = inner.regions.len(),
            "transaction closed"
        );
        TxRecord {
            tx: self.id,
            regions,
        }
    }
}

/// After-image of every range captured by one transaction.
#[derive(Clone, Debug)]
pub struct TxRecord {
    tx: u64,
    regions: Vec<(Region, Vec<u8>)>,
}

impl TxRecord {
    /// Transaction identifier.
    pub fn tx(&self) -> u64 {
        self.tx
    }

    /// Captured ranges with their contents.
    pub fn regions(&self) -> &[(Region, Vec<u8>)] {
        &self.regions
    }

    /// Total captured bytes.
    pub fn bytes(&self) -> u64 {
        self.regions.iter().map(|(region, _)| region.len).sum()
    }

    /// Writes the recorded ranges over `image`.
    pub fn apply_to_image(&self, image: &mut [u8]) -> Result<()> {
        for (region, data) in &self.regions {
            let start = region.addr.get() as usize;
            let end = start + data.len();
            if end > image.len() {
                return Err(StoreError::Invalid("record region outside image"));
            }
            image[start..end].copy_from_slice(data);
        }
        Ok(())
    }

    /// Writes the recorded ranges into `seg`.
    pub fn apply(&self, seg: &Segment) -> Result<()> {
        if let Some((region, _)) = self
            .regions
            .iter()
            .find(|(region, _)| !seg.contains(region.addr, region.len))
        {
            tracing::warn!(target: "segstore::tx", addr = %region.addr, len = region.len, "record region outside segment");
            return Err(StoreError::Invalid("record region outside segment"));
        }
        let mut pin = seg.pin_write();
        for (region, data) in &self.regions {
            pin.write(region.addr, data);
        }
        Ok(())
    }
}
