use std::sync::Arc;

use crate::{
    database::Database,
    storage::page_id::NULL_PAGE_ID,
    transaction::Transaction,
    types::TreeResult,
};

use super::{
    descriptor::BTreeDescriptor,
    node::DupSeek,
    reader::BTreeReader,
    tuple::{Cell, Tuple},
};

/// The cursor surface handed to execution streams. `open` re-reads the root
/// from the owner map, so a scan survives root relocation between batches;
/// `close` drops the position and the stale root reference.
pub struct BTreeScan {
    db: Arc<Database>,
    descriptor: BTreeDescriptor,
    reader: Option<BTreeReader>,
}

impl BTreeScan {
    pub fn new(db: &Arc<Database>, descriptor: BTreeDescriptor) -> Self {
        Self {
            db: Arc::clone(db),
            descriptor,
            reader: None,
        }
    }

    pub fn open(&mut self, txn: &Transaction, restart: bool) -> TreeResult<()> {
        if restart {
            if let Some(reader) = &mut self.reader {
                reader.end_search()?;
            }
            return Ok(());
        }
        self.descriptor.root_page_id = self.db.root_map().get_root(self.descriptor.owner_id)?;
        match &mut self.reader {
            Some(reader) => reader.set_root_page_id(self.descriptor.root_page_id),
            None => self.reader = Some(BTreeReader::new(&self.db, &self.descriptor, txn)),
        }
        Ok(())
    }

    pub fn close(&mut self) -> TreeResult<()> {
        if let Some(reader) = &mut self.reader {
            reader.end_search()?;
        }
        self.reader = None;
        self.descriptor.root_page_id = NULL_PAGE_ID;
        Ok(())
    }

    fn reader_mut(&mut self) -> &mut BTreeReader {
        self.reader.as_mut().expect("scan is not open")
    }

    pub fn search_first(&mut self) -> TreeResult<bool> {
        self.reader_mut().search_first()
    }

    pub fn search_last(&mut self) -> TreeResult<bool> {
        self.reader_mut().search_last()
    }

    pub fn search_for_key(
        &mut self,
        search_key: &[Cell],
        dup_seek: DupSeek,
        least_upper: bool,
    ) -> TreeResult<bool> {
        self.reader_mut().search_for_key(search_key, dup_seek, least_upper)
    }

    pub fn search_next(&mut self) -> TreeResult<bool> {
        self.reader_mut().search_next()
    }

    pub fn end_search(&mut self) -> TreeResult<()> {
        self.reader_mut().end_search()
    }

    pub fn is_singular(&self) -> bool {
        self.reader.as_ref().map(|r| r.is_singular()).unwrap_or(true)
    }

    pub fn current_tuple(&self) -> TreeResult<Tuple> {
        self.reader.as_ref().expect("scan is not open").current_tuple()
    }
}
