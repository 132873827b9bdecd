// Queue handle: open-time recovery, FIFO record operations, checkpointing,
// and the release-on-corruption containment policy.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt as _;
use tracing::{debug, error, info, warn};

use crate::core::crc::crc8;
use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{
    FileHeader, MessageHeader, DATA_START, FILE_HEADER_LEN, MESSAGE_HEADER_LEN, MIN_FILE_SIZE,
};
use crate::core::wrap::{advance, read_at_wrapped, write_at_wrapped};

#[derive(Clone, Copy, Debug)]
pub struct QueueOptions {
    pub file_size: u64,
}

impl QueueOptions {
    pub fn new(file_size: u64) -> Self {
        Self { file_size }
    }
}

/// One open queue. The in-memory pointers and counts are authoritative
/// between checkpoints; the on-disk header is only rewritten by `sync`,
/// `close`, and `clear`. After a corruption or record-level I/O failure the
/// handle releases its file and every later operation fails `NotReady`.
#[derive(Debug)]
pub struct Queue {
    path: PathBuf,
    file: Option<File>,
    append_ptr: u64,
    extract_ptr: u64,
    live_bytes: u64,
    live_messages: u64,
    file_size: u64,
}

impl Queue {
    /// Creates or opens the backing file at exactly `file_size` bytes, takes
    /// an exclusive advisory lock, and adopts the stored header when its
    /// magic, checksum, and recorded size all check out. Anything else (new
    /// file, resized file, damaged header) starts an empty queue.
    pub fn open(path: impl AsRef<Path>, options: QueueOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if options.file_size < MIN_FILE_SIZE {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "queue file size must be at least {MIN_FILE_SIZE} bytes"
                ))
                .with_path(&path));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        file.lock_exclusive()
            .map_err(|err| lock_error(&path, err))?;

        if let Err(err) = file.set_len(options.file_size) {
            let _ = file.unlock();
            return Err(Error::new(ErrorKind::Io).with_path(&path).with_source(err));
        }

        let buf = match read_header_bytes(&mut file) {
            Ok(buf) => buf,
            Err(err) => {
                let _ = file.unlock();
                return Err(Error::new(ErrorKind::Io).with_path(&path).with_source(err));
            }
        };

        let header = match FileHeader::decode(&buf) {
            Ok(header) if header.file_size == options.file_size => header,
            Ok(_) => {
                warn!(path = %path.display(), "queue file size changed; starting empty");
                FileHeader::empty(options.file_size)
            }
            Err(_) => {
                warn!(path = %path.display(), "no valid queue header (new or damaged file); starting empty");
                FileHeader::empty(options.file_size)
            }
        };

        let queue = Self {
            path,
            file: Some(file),
            append_ptr: header.append_ptr,
            extract_ptr: header.extract_ptr,
            live_bytes: header.live_bytes,
            live_messages: header.live_messages,
            file_size: options.file_size,
        };
        info!(
            path = %queue.path.display(),
            append = queue.append_ptr,
            extract = queue.extract_ptr,
            live_bytes = queue.live_bytes,
            live_messages = queue.live_messages,
            file_size = queue.file_size,
            "queue open"
        );
        Ok(queue)
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Checkpoints the in-memory state into the on-disk header and forces it
    /// to stable storage. Durability is pull-based: nothing else writes the
    /// header.
    pub fn sync(&mut self) -> Result<(), Error> {
        let header = self.header();
        let result = {
            let file = self.file_mut()?;
            write_header(file, &header)
        };
        if let Err(err) = result {
            let err = Error::new(ErrorKind::Io)
                .with_message("header checkpoint failed")
                .with_path(&self.path)
                .with_source(err);
            return Err(self.contain(err));
        }
        debug!(path = %self.path.display(), "queue checkpoint");
        Ok(())
    }

    /// `sync` followed by lock and file release. Call this before process
    /// exit or messages may be lost or reappear. Idempotent once released.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.file.is_none() {
            return Ok(());
        }
        let result = self.sync();
        self.release_file();
        result
    }

    /// Releases the lock and file without checkpointing, discarding every
    /// mutation since the last sync. The read-then-leave-intact inspection
    /// path relies on this.
    pub fn discard(&mut self) {
        self.release_file();
    }

    /// Empties the queue and checkpoints immediately, unlike every other
    /// mutation.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.append_ptr = DATA_START;
        self.extract_ptr = DATA_START;
        self.live_bytes = 0;
        self.live_messages = 0;
        self.sync()
    }

    /// Appends one message. Fails with `Capacity` when the record does not
    /// fit the current free space, leaving the queue unchanged.
    pub fn push(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        if payload.len() as u64 > u64::from(u32::MAX) {
            return Err(Error::new(ErrorKind::Capacity)
                .with_message("message exceeds the length-field limit")
                .with_path(&self.path));
        }
        let record_len = MESSAGE_HEADER_LEN as u64 + payload.len() as u64;
        if self.bytes_free() < record_len {
            return Err(Error::new(ErrorKind::Capacity)
                .with_message("not enough free space for the message")
                .with_path(&self.path));
        }

        let header = MessageHeader::for_payload(payload);
        let data_end = self.file_size;
        let append_ptr = self.append_ptr;
        let result = {
            let file = self.file_mut()?;
            match write_at_wrapped(file, &header.encode(), append_ptr, data_end) {
                Ok(offset) => write_at_wrapped(file, payload, offset, data_end),
                Err(err) => Err(err),
            }
        };
        match result {
            Ok(next) => {
                self.append_ptr = next;
                self.live_bytes += record_len;
                self.live_messages += 1;
                debug!(len = payload.len(), append = next, "message pushed");
                Ok(())
            }
            Err(err) => {
                let err = err.with_path(&self.path);
                Err(self.contain(err))
            }
        }
    }

    /// Removes the front message. Only the record magic is verified here:
    /// skipping does not need the payload, so the CRC is left to `get`.
    pub fn pop(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        if self.live_messages == 0 {
            return Err(Error::new(ErrorKind::NotReady)
                .with_message("queue is empty")
                .with_path(&self.path));
        }
        let header = self.read_record_header(self.extract_ptr)?;
        let record_len = header.record_len();
        self.extract_ptr = advance(self.extract_ptr, self.file_size, record_len);
        self.live_bytes = self.live_bytes.saturating_sub(record_len);
        self.live_messages -= 1;
        debug!(extract = self.extract_ptr, "message popped");
        Ok(())
    }

    /// Removes up to `count` messages, returning how many actually went.
    /// Over-requesting empties the queue through a single pointer reset; a
    /// mid-batch failure aborts with earlier removals retained.
    pub fn pop_n(&mut self, count: u64) -> Result<u64, Error> {
        self.ensure_open()?;
        if count >= self.live_messages {
            let popped = self.live_messages;
            if count > popped {
                info!(requested = count, available = popped, "pop clamped to available messages");
            }
            self.extract_ptr = self.append_ptr;
            self.live_bytes = 0;
            self.live_messages = 0;
            return Ok(popped);
        }
        for _ in 0..count {
            self.pop()?;
        }
        Ok(count)
    }

    /// Reads the front message without consuming it, fully validated (magic
    /// plus payload CRC). Fails with `Capacity` when the recorded length
    /// exceeds `max_len`, leaving the message in place.
    pub fn get(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
        self.ensure_open()?;
        if self.live_messages == 0 {
            return Err(Error::new(ErrorKind::NotReady)
                .with_message("queue is empty")
                .with_path(&self.path));
        }
        let header = self.read_record_header(self.extract_ptr)?;
        if header.payload_len as usize > max_len {
            return Err(Error::new(ErrorKind::Capacity)
                .with_message("message does not fit the requested buffer")
                .with_path(&self.path));
        }
        let offset = advance(self.extract_ptr, self.file_size, MESSAGE_HEADER_LEN as u64);
        self.read_record_payload(&header, offset)
    }

    /// Walks forward from the front without consuming, collecting validated
    /// payloads until `max_messages` is reached or the next payload would
    /// exceed the remaining `max_bytes` budget. Buffer exhaustion stops the
    /// walk; corruption fails it.
    pub fn get_all(&mut self, max_bytes: usize, max_messages: u64) -> Result<Vec<Vec<u8>>, Error> {
        self.ensure_open()?;
        if self.live_messages == 0 {
            return Err(Error::new(ErrorKind::NotReady)
                .with_message("queue is empty")
                .with_path(&self.path));
        }
        let limit = self.live_messages.min(max_messages);
        let mut out = Vec::new();
        let mut remaining = max_bytes;
        let mut cursor = self.extract_ptr;
        while (out.len() as u64) < limit {
            let header = self.read_record_header(cursor)?;
            if header.payload_len as usize > remaining {
                break;
            }
            let offset = advance(cursor, self.file_size, MESSAGE_HEADER_LEN as u64);
            let payload = self.read_record_payload(&header, offset)?;
            remaining -= payload.len();
            cursor = advance(cursor, self.file_size, header.record_len());
            out.push(payload);
        }
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn is_empty(&self) -> bool {
        self.live_bytes == 0
    }

    pub fn messages_available(&self) -> u64 {
        self.live_messages
    }

    /// Payload bytes still queued, excluding per-record framing.
    pub fn bytes_available(&self) -> u64 {
        self.live_bytes
            .saturating_sub(MESSAGE_HEADER_LEN as u64 * self.live_messages)
    }

    /// Free data-region bytes; a push needs the payload plus record framing.
    pub fn bytes_free(&self) -> u64 {
        self.file_size
            .saturating_sub(self.live_bytes + FILE_HEADER_LEN as u64)
    }

    fn header(&self) -> FileHeader {
        FileHeader {
            append_ptr: self.append_ptr,
            extract_ptr: self.extract_ptr,
            live_bytes: self.live_bytes,
            live_messages: self.live_messages,
            file_size: self.file_size,
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.file.is_none() {
            return Err(Error::new(ErrorKind::NotReady)
                .with_message("queue is not open")
                .with_path(&self.path));
        }
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut File, Error> {
        self.file.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::NotReady)
                .with_message("queue is not open")
                .with_path(&self.path)
        })
    }

    fn release_file(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }

    // Once framing can no longer be trusted, length fields would
    // desynchronize every later offset, so the file is released instead of
    // skipped past.
    fn contain(&mut self, err: Error) -> Error {
        error!(path = %self.path.display(), %err, "releasing queue file");
        self.release_file();
        err
    }

    fn read_record_header(&mut self, offset: u64) -> Result<MessageHeader, Error> {
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        let data_end = self.file_size;
        let result = {
            let file = self.file_mut()?;
            read_at_wrapped(file, &mut buf, offset, data_end)
        };
        if let Err(err) = result {
            let err = err.with_path(&self.path);
            return Err(self.contain(err));
        }
        match MessageHeader::decode(&buf) {
            Ok(header) => Ok(header),
            Err(err) => {
                let err = err.with_path(&self.path).with_offset(offset);
                Err(self.contain(err))
            }
        }
    }

    fn read_record_payload(
        &mut self,
        header: &MessageHeader,
        offset: u64,
    ) -> Result<Vec<u8>, Error> {
        let mut payload = vec![0u8; header.payload_len as usize];
        let data_end = self.file_size;
        let result = {
            let file = self.file_mut()?;
            read_at_wrapped(file, &mut payload, offset, data_end)
        };
        if let Err(err) = result {
            let err = err.with_path(&self.path);
            return Err(self.contain(err));
        }
        if crc8(&payload) != header.payload_crc {
            let err = Error::new(ErrorKind::Corrupt)
                .with_message("message checksum mismatch")
                .with_path(&self.path)
                .with_offset(offset);
            return Err(self.contain(err));
        }
        Ok(payload)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.release_file();
    }
}

fn read_header_bytes(file: &mut File) -> io::Result<[u8; FILE_HEADER_LEN]> {
    let mut buf = [0u8; FILE_HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_header(file: &mut File, header: &FileHeader) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.sync_all()
}

fn lock_error(path: &Path, err: io::Error) -> Error {
    let errno = err.raw_os_error().unwrap_or_default();
    let message = if errno == libc::EACCES || errno == libc::EPERM {
        "permission denied while locking the queue file"
    } else if errno == libc::ENOLCK {
        "no locks available for the queue file"
    } else {
        "failed to lock the queue file"
    };
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}
