use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use bit_vec::BitVec;
use log::debug;

use crate::{error::TreeError, types::TreeResult};

use super::page_id::{BlockId, PageId, SegmentId};

/// File-backed page store. Pages are allocated densely; freed pages are
/// remembered in a bitmap and handed out again before the file grows.
#[derive(Debug)]
pub struct Segment {
    id: SegmentId,
    path: String,
    page_size: usize,
    file: Mutex<File>,

    // bit set = allocated
    alloc_map: Mutex<BitVec<u32>>,
}

impl Segment {
    pub fn create(path: &str, id: SegmentId, page_size: usize) -> TreeResult<Self> {
        File::create(path)?;

        let file = OpenOptions::new().write(true).read(true).open(path)?;

        Ok(Self {
            id,
            path: path.to_string(),
            page_size,
            file: Mutex::new(file),
            alloc_map: Mutex::new(BitVec::new()),
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn allocate_page(&self) -> TreeResult<PageId> {
        let mut map = self.alloc_map.lock().unwrap();
        for i in 0..map.len() {
            if !map[i] {
                map.set(i, true);
                debug!("reuse freed page, {}, index: {}", self.id, i);
                return Ok(PageId(i as u64));
            }
        }
        map.push(true);
        Ok(PageId((map.len() - 1) as u64))
    }

    pub fn deallocate_page(&self, pid: PageId) {
        let mut map = self.alloc_map.lock().unwrap();
        let i = pid.0 as usize;
        assert!(i < map.len() && map[i], "deallocate of unallocated {}", pid);
        map.set(i, false);
    }

    pub fn map_to_block(&self, pid: PageId) -> BlockId {
        assert!(!pid.is_null(), "map_to_block on null page id");
        BlockId {
            segment_id: self.id,
            block_num: pid.0,
        }
    }

    /// Read one page worth of bytes. A block past the current end of file is
    /// a freshly allocated page and reads back as zeros.
    pub fn read_block(&self, block: BlockId, buf: &mut [u8]) -> TreeResult<()> {
        assert_eq!(block.segment_id, self.id);
        assert_eq!(buf.len(), self.page_size);

        let mut file = self.file.lock().unwrap();
        let start_pos = block.block_num * self.page_size as u64;
        let file_len = file.metadata()?.len();

        for b in buf.iter_mut() {
            *b = 0;
        }
        if start_pos >= file_len {
            return Ok(());
        }

        file.seek(SeekFrom::Start(start_pos))?;
        let avail = ((file_len - start_pos) as usize).min(self.page_size);
        file.read_exact(&mut buf[..avail])?;
        Ok(())
    }

    pub fn write_block(&self, block: BlockId, data: &[u8]) -> TreeResult<()> {
        assert_eq!(block.segment_id, self.id);
        assert_eq!(data.len(), self.page_size);

        let mut file = self.file.lock().unwrap();
        let start_pos = block.block_num * self.page_size as u64;
        file.seek(SeekFrom::Start(start_pos))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn sync(&self) -> TreeResult<()> {
        self.file.lock().unwrap().sync_data()?;
        Ok(())
    }
}

#[derive(Debug)]
struct ScratchPool {
    page_size: usize,
    max_pages: usize,
    free: Mutex<ScratchFreeList>,
}

#[derive(Debug)]
struct ScratchFreeList {
    frames: Vec<Vec<u8>>,
    n_outstanding: usize,
}

/// Bounded pool of in-memory frames used for staging node images before
/// publication. Exhaustion is a recoverable error, not an assertion: the
/// caller may roll back its savepoint and retry with a smaller batch.
#[derive(Clone)]
pub struct ScratchAccessor {
    pool: Arc<ScratchPool>,
}

impl ScratchAccessor {
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        Self {
            pool: Arc::new(ScratchPool {
                page_size,
                max_pages,
                free: Mutex::new(ScratchFreeList {
                    frames: Vec::new(),
                    n_outstanding: 0,
                }),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.pool.page_size
    }

    pub fn allocate(&self) -> TreeResult<ScratchPage> {
        let mut free = self.pool.free.lock().unwrap();
        if free.n_outstanding >= self.pool.max_pages {
            return Err(TreeError::scratch_exhausted());
        }
        free.n_outstanding += 1;
        let buf = free
            .frames
            .pop()
            .unwrap_or_else(|| vec![0u8; self.pool.page_size]);
        Ok(ScratchPage {
            buf: Some(buf),
            pool: Arc::clone(&self.pool),
        })
    }

    pub fn n_outstanding(&self) -> usize {
        self.pool.free.lock().unwrap().n_outstanding
    }
}

/// One scratch frame, returned to the pool on drop.
#[derive(Debug)]
pub struct ScratchPage {
    buf: Option<Vec<u8>>,
    pool: Arc<ScratchPool>,
}

impl Deref for ScratchPage {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

impl DerefMut for ScratchPage {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for ScratchPage {
    fn drop(&mut self) {
        let mut buf = self.buf.take().unwrap();
        for b in buf.iter_mut() {
            *b = 0;
        }
        let mut free = self.pool.free.lock().unwrap();
        free.n_outstanding -= 1;
        free.frames.push(buf);
    }
}
