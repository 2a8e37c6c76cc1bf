use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;
use crate::primitives::seg::Segment;
use crate::primitives::tx::{Credit, Tx, TxRecord};
use crate::storage::alloc::Allocator;
use crate::storage::btree::{BTree, KvOps};
use crate::storage::credit;
use crate::storage::dict::SegDict;
use crate::types::StoreError;

/// A segment loaded from an image file, with its allocator and dictionary.
///
/// Changes are made in memory under a transaction and reach the file when
/// the transaction is committed.
pub struct SegImage {
    path: PathBuf,
    seg: Arc<Segment>,
    alloc: Arc<Allocator>,
    dict: SegDict,
    options: AdminOpenOptions,
}

/// Creates a new image file holding an empty allocator and dictionary.
pub fn format_image(path: impl AsRef<Path>, size: u64, options: &AdminOpenOptions) -> Result<SegImage> {
    let path = path.as_ref();
    if path.exists() {
        return Err(AdminError::ImageExists(path.to_path_buf()));
    }
    let seg = Arc::new(Segment::format(size)?);
    let alloc = Arc::new(Allocator::init(seg.clone(), options.allocator.clone()));
    alloc.create(None).wait()?;
    let dict = SegDict::create(seg.clone(), alloc.clone(), None, options.btree.clone())?;
    let image = SegImage {
        path: path.to_path_buf(),
        seg,
        alloc,
        dict,
        options: options.clone(),
    };
    image.save()?;
    tracing::info!(target: "segstore::admin", path = %path.display(), size, "formatted segment image");
    Ok(image)
}

/// Loads an existing image file.
pub fn open_image(path: impl AsRef<Path>, options: &AdminOpenOptions) -> Result<SegImage> {
    let path = path.as_ref();
    let seg = Arc::new(load_segment(path)?);
    let alloc = Arc::new(Allocator::init(seg.clone(), options.allocator.clone()));
    if !alloc.is_created() {
        return Err(AdminError::Message(format!(
            "{} has no allocator",
            path.display()
        )));
    }
    let dict = SegDict::open(seg.clone(), alloc.clone(), options.btree.clone()).map_err(|err| match err {
        StoreError::NotFound => AdminError::Message(format!("{} has no dictionary", path.display())),
        other => other.into(),
    })?;
    tracing::debug!(target: "segstore::admin", path = %path.display(), entries = dict.len(), "opened segment image");
    Ok(SegImage {
        path: path.to_path_buf(),
        seg,
        alloc,
        dict,
        options: options.clone(),
    })
}

pub(crate) fn load_segment(path: &Path) -> Result<Segment> {
    if !path.exists() {
        return Err(AdminError::missing_image(path));
    }
    let bytes = fs::read(path)?;
    Ok(Segment::from_image(bytes)?)
}

impl SegImage {
    /// File the image is saved to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// In-memory segment.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.seg
    }

    /// Allocator bound to the segment.
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    /// Segment dictionary.
    pub fn dict(&self) -> &SegDict {
        &self.dict
    }

    /// Options the image was opened with.
    pub fn options(&self) -> &AdminOpenOptions {
        &self.options
    }

    /// Starts a transaction reserving `credit` and opens it.
    pub fn begin_tx(&self, credit: Credit) -> Result<Tx> {
        let tx = Tx::with_options(self.options.tx.clone());
        tx.prep(credit);
        tx.open()?;
        Ok(tx)
    }

    /// Closes `tx` and writes the image file.
    pub fn commit(&self, tx: &Tx) -> Result<TxRecord> {
        let record = tx.close(&self.seg);
        self.save()?;
        tracing::debug!(
            target: "segstore::admin",
            tx = record.tx(),
            bytes = record.bytes(),
            spans = record.regions().len(),
            "committed transaction"
        );
        Ok(record)
    }

    /// Writes the whole segment to the image file through a temporary file
    /// in the same directory, then renames it into place.
    pub fn save(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&self.seg.to_image())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Opens the tree registered under `name`.
    pub fn open_tree(&self, name: &str, ops: Arc<dyn KvOps>) -> Result<BTree> {
        let header = self.dict.lookup(name)?;
        let tree = BTree::init(self.seg.clone(), self.alloc.clone(), ops, self.options.btree.clone())?;
        tree.open(header)?;
        Ok(tree)
    }

    /// Creates a tree and registers it under `name`.
    pub fn create_tree(&self, tx: Option<&Tx>, name: &str, ops: Arc<dyn KvOps>) -> Result<BTree> {
        match self.dict.lookup(name) {
            Ok(_) => return Err(StoreError::Exists.into()),
            Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        let tree = BTree::init(self.seg.clone(), self.alloc.clone(), ops, self.options.btree.clone())?;
        let header = tree.create(tx).wait()?;
        self.dict.insert(tx, name, header)?;
        tracing::debug!(target: "segstore::admin", name, header = %header, "registered tree");
        Ok(tree)
    }

    /// Credit for [`SegImage::create_tree`].
    pub fn create_tree_credit(&self, name: &str) -> Credit {
        credit::create_credit(self.options.btree.fanout) + self.dict.insert_credit(1, name.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::BytewiseOps;

    #[test]
    fn format_commit_and_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seg.img");
        let options = AdminOpenOptions::default();
        let image = format_image(&path, 1 << 16, &options)?;
        assert!(matches!(
            format_image(&path, 1 << 16, &options),
            Err(AdminError::ImageExists(_))
        ));

        let ops: Arc<dyn KvOps> = Arc::new(BytewiseOps);
        let tx = image.begin_tx(image.create_tree_credit("kv"))?;
        let tree = image.create_tree(Some(&tx), "kv", ops.clone())?;
        tree.fini();
        image.commit(&tx)?;

        let reopened = open_image(&path, &options)?;
        assert_eq!(reopened.dict().list("")?.len(), 1);
        let tree = reopened.open_tree("kv", ops.clone())?;
        assert!(tree.is_empty());
        assert!(matches!(
            reopened.create_tree(None, "kv", ops),
            Err(AdminError::Core(StoreError::Exists))
        ));
        Ok(())
    }

    #[test]
    fn missing_image_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = open_image(dir.path().join("nope.img"), &AdminOpenOptions::default()).err();
        assert!(matches!(err, Some(AdminError::MissingImage(_))));
    }
}
