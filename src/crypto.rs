//! Decryption and descrambling of secure input.
//!
//! The channel holds at most one [`CryptoBackend`] or [`Descrambler`]. Before
//! encrypted input reaches the component it runs through [`CryptoAdapter`],
//! which writes the clear (or still protected) payload into a pool block:
//! - non-secure output lands in a staging heap owned by the adapter and is
//!   copied into the block afterwards;
//! - secure output is written by the backend straight into the block handle.
//!
//! Shared memory regions are registered with the backend once and
//! unregistered when the backend changes or the channel is released.

use crate::buffers::block::{ClientBuffer, LinearBlock, SecureHandle, SharedMemory};
use crate::buffers::pool::{BlockPool, MemoryUsage};
use crate::error::{Result, Status};
use crate::pipeline::types::AccessUnitInfo;
use log::{debug, info, warn};
use std::sync::Arc;

/// Cipher mode of an encrypted sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoMode {
    #[default]
    Unencrypted,
    AesCtr,
    AesCbc,
}

/// Encrypt/skip block pattern for pattern encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pattern {
    pub encrypt_blocks: u32,
    pub skip_blocks: u32,
}

/// Clear bytes followed by encrypted bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubSample {
    pub clear_bytes: usize,
    pub encrypted_bytes: usize,
}

impl SubSample {
    pub fn new(clear_bytes: usize, encrypted_bytes: usize) -> Self {
        Self {
            clear_bytes,
            encrypted_bytes,
        }
    }

    pub fn total(&self) -> usize {
        self.clear_bytes + self.encrypted_bytes
    }
}

/// Decryption parameters of one access unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CryptoInfo {
    pub mode: CryptoMode,
    pub key: [u8; 16],
    pub iv: [u8; 16],
    pub pattern: Pattern,
    pub subsamples: Vec<SubSample>,
}

impl CryptoInfo {
    pub fn total_size(&self) -> usize {
        self.subsamples.iter().map(SubSample::total).sum()
    }

    /// A single subsample with no bytes at all.
    fn is_empty_input(&self) -> bool {
        self.subsamples.len() == 1 && self.subsamples[0].total() == 0
    }
}

/// Region of a registered heap to read ciphertext from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceBuffer {
    pub heap_seq_num: i32,
    pub offset: usize,
    pub size: usize,
}

/// Where a backend writes its output.
pub enum Destination<'a> {
    /// Registered heap, readable by the CPU afterwards.
    SharedMemory { heap_seq_num: i32, size: usize },
    /// Protected block, written through its handle.
    Secure(SecureHandle<'a>),
}

/// Decryption backend.
///
/// Every call returns bytes written, or the backend's negative status which
/// the channel passes to the client unchanged.
pub trait CryptoBackend: Send + Sync {
    /// Register a heap. Returns its sequence number or a negative status.
    fn set_heap(&self, memory: Arc<SharedMemory>) -> i32;
    fn unset_heap(&self, heap_seq_num: i32);
    #[allow(clippy::too_many_arguments)]
    fn decrypt(
        &self,
        key: &[u8; 16],
        iv: &[u8; 16],
        mode: CryptoMode,
        pattern: Pattern,
        source: SourceBuffer,
        offset: usize,
        subsamples: &[SubSample],
        destination: Destination<'_>,
    ) -> std::result::Result<usize, i32>;
}

/// Conditional-access descrambler.
///
/// Without a secure destination the source memory is descrambled in place.
pub trait Descrambler: Send + Sync {
    fn descramble(
        &self,
        scrambling_control: u8,
        subsamples: &[SubSample],
        source: &SharedMemory,
        source_offset: usize,
        destination: Option<SecureHandle<'_>>,
    ) -> std::result::Result<usize, i32>;
}

/// Outcome of decrypting a client buffer in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decrypted {
    /// Leading bytes of the output the component must skip.
    pub codec_data_offset: usize,
    pub size: usize,
}

pub struct CryptoAdapter {
    name: String,
    crypto: Option<Arc<dyn CryptoBackend>>,
    descrambler: Option<Arc<dyn Descrambler>>,
    heaps: Vec<(Arc<SharedMemory>, i32)>,
    destination: Option<Arc<SharedMemory>>,
    destination_seq_num: Option<i32>,
}

impl CryptoAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            crypto: None,
            descrambler: None,
            heaps: Vec::new(),
            destination: None,
            destination_seq_num: None,
        }
    }

    /// Swap the crypto backend, unregistering every heap from the old one.
    pub fn set_crypto(&mut self, crypto: Option<Arc<dyn CryptoBackend>>) {
        self.unset_heaps();
        self.crypto = crypto;
    }

    pub fn set_descrambler(&mut self, descrambler: Option<Arc<dyn Descrambler>>) {
        self.descrambler = descrambler;
    }

    pub fn has_backend(&self) -> bool {
        self.crypto.is_some() || self.descrambler.is_some()
    }

    /// Heaps currently registered with the crypto backend.
    pub fn registered_heaps(&self) -> usize {
        self.heaps.len() + usize::from(self.destination_seq_num.is_some())
    }

    /// Sequence number of `memory`, registering it on first use.
    pub fn heap_seq_num(&mut self, memory: &Arc<SharedMemory>) -> Result<i32> {
        let crypto = self.crypto.clone().ok_or(Status::InvalidOperation)?;
        if let Some((_, seq)) = self.heaps.iter().find(|(heap, _)| Arc::ptr_eq(heap, memory)) {
            return Ok(*seq);
        }
        let seq = crypto.set_heap(memory.clone());
        if seq < 0 {
            warn!("[{}] setHeap failed: {}", self.name, seq);
            return Err(Status::Backend(seq));
        }
        debug!("[{}] registered heap #{}", self.name, seq);
        self.heaps.push((memory.clone(), seq));
        Ok(seq)
    }

    /// Make the staging heap hold at least `size` bytes.
    fn ensure_decrypt_destination(&mut self, size: usize) -> Result<()> {
        if self
            .destination
            .as_ref()
            .is_some_and(|memory| memory.size() >= size)
        {
            return Ok(());
        }
        let memory = SharedMemory::new(size.max(1) * 2);
        if let Some(crypto) = &self.crypto {
            if let Some(seq) = self.destination_seq_num.take() {
                crypto.unset_heap(seq);
            }
            let seq = crypto.set_heap(memory.clone());
            if seq < 0 {
                return Err(Status::Backend(seq));
            }
            self.destination_seq_num = Some(seq);
        }
        debug!("[{}] decrypt destination grown to {}", self.name, memory.size());
        self.destination = Some(memory);
        Ok(())
    }

    /// Decrypt `subsamples` of `memory` at `offset` into a block fetched
    /// from `pool` and return the block with the number of bytes written.
    #[allow(clippy::too_many_arguments)]
    pub fn attach_encrypted_buffer(
        &mut self,
        pool: &dyn BlockPool,
        memory: &Arc<SharedMemory>,
        secure: bool,
        info: &CryptoInfo,
        offset: usize,
    ) -> Result<Option<(LinearBlock, usize)>> {
        let size = info.total_size();
        if size == 0 {
            return Ok(None);
        }
        let usage = if secure {
            MemoryUsage::PROTECTED
        } else {
            MemoryUsage::CPU_READ_WRITE
        };
        let mut block = pool
            .fetch_linear_block(size, usage)
            .map_err(|_| Status::NoMemory)?;
        if !secure {
            self.ensure_decrypt_destination(size)?;
        }
        let written = self.decrypt_into(memory, secure, info, offset, &mut block, 0)?;
        Ok(Some((block, written)))
    }

    /// Decrypt the access units of an encrypted client buffer into its
    /// destination block.
    ///
    /// `infos` holds one entry per access unit; their ciphertext follows
    /// each other in the buffer's shared memory starting at the buffer's
    /// offset.
    pub fn decrypt_client_buffer(
        &mut self,
        buffer: &ClientBuffer,
        secure: bool,
        infos: &[CryptoInfo],
    ) -> Result<Decrypted> {
        if !self.has_backend() {
            return Err(Status::NotSupported);
        }
        let memory = buffer.encrypted_memory().ok_or(Status::InvalidOperation)?;
        if infos.len() == 1 && infos[0].is_empty_input() {
            return Ok(Decrypted {
                codec_data_offset: 0,
                size: 0,
            });
        }
        let total: usize = infos.iter().map(CryptoInfo::total_size).sum();
        if !secure && self.crypto.is_some() {
            self.ensure_decrypt_destination(total)?;
        }

        let mut source_offset = buffer.offset();
        let mut written = 0;
        let mut codec_data_offset = 0;
        for info in infos {
            let result = buffer
                .with_encrypted_block(|block| {
                    self.decrypt_into(&memory, secure, info, source_offset, block, written)
                })
                .ok_or(Status::InvalidOperation)??;
            if self.crypto.is_none() {
                codec_data_offset = usize::from(info.key[2]) | (usize::from(info.key[3]) << 8);
                if result < codec_data_offset {
                    debug!(
                        "[{}] invalid codec data offset {} for {} bytes",
                        self.name, codec_data_offset, result
                    );
                    return Err(Status::BadValue);
                }
            }
            source_offset += info.total_size();
            written += result;
        }
        Ok(Decrypted {
            codec_data_offset: if infos.len() == 1 { codec_data_offset } else { 0 },
            size: written - if infos.len() == 1 { codec_data_offset } else { 0 },
        })
    }

    /// Run one access unit through the backend and leave its output at
    /// `block[block_offset..]`.
    fn decrypt_into(
        &mut self,
        memory: &Arc<SharedMemory>,
        secure: bool,
        info: &CryptoInfo,
        source_offset: usize,
        block: &mut LinearBlock,
        block_offset: usize,
    ) -> Result<usize> {
        let size = info.total_size();
        if let Some(crypto) = self.crypto.clone() {
            let source = SourceBuffer {
                heap_seq_num: self.heap_seq_num(memory)?,
                offset: 0,
                size: memory.size(),
            };
            let result = if secure {
                crypto.decrypt(
                    &info.key,
                    &info.iv,
                    info.mode,
                    info.pattern,
                    source,
                    source_offset,
                    &info.subsamples,
                    Destination::Secure(block.handle_from(block_offset)?),
                )
            } else {
                let seq = self.destination_seq_num.ok_or(Status::InvalidOperation)?;
                crypto.decrypt(
                    &info.key,
                    &info.iv,
                    info.mode,
                    info.pattern,
                    source,
                    source_offset,
                    &info.subsamples,
                    Destination::SharedMemory {
                        heap_seq_num: seq,
                        size,
                    },
                )
            };
            let written = result.map_err(|err| {
                info!("[{}] decrypt failed: result={}", self.name, err);
                Status::Backend(err)
            })?;
            if !secure {
                let staging = self.destination.as_ref().ok_or(Status::InvalidOperation)?;
                copy_into_block(staging, 0, written, block, block_offset)?;
            }
            return Ok(written);
        }

        let descrambler = self.descrambler.clone().ok_or(Status::NotSupported)?;
        let scrambling_control = info.key[0];
        let result = if secure {
            descrambler.descramble(
                scrambling_control,
                &info.subsamples,
                memory,
                source_offset,
                Some(block.handle_from(block_offset)?),
            )
        } else {
            descrambler.descramble(
                scrambling_control,
                &info.subsamples,
                memory,
                source_offset,
                None,
            )
        };
        let written = result.map_err(|err| {
            info!("[{}] descramble failed: result={}", self.name, err);
            if err > 0 {
                Status::Unknown
            } else {
                Status::Backend(err)
            }
        })?;
        if !secure {
            copy_into_block(memory, source_offset, written, block, block_offset)?;
        }
        Ok(written)
    }

    /// Unregister every heap from the crypto backend.
    pub fn unset_heaps(&mut self) {
        if let Some(crypto) = &self.crypto {
            for (_, seq) in self.heaps.drain(..) {
                crypto.unset_heap(seq);
            }
            if let Some(seq) = self.destination_seq_num.take() {
                crypto.unset_heap(seq);
            }
        }
        self.heaps.clear();
        self.destination_seq_num = None;
        self.destination = None;
    }

    /// Drop both backends after unregistering heaps.
    pub fn release(&mut self) {
        self.unset_heaps();
        self.crypto = None;
        self.descrambler = None;
    }
}

impl Drop for CryptoAdapter {
    fn drop(&mut self) {
        self.unset_heaps();
    }
}

/// Copy `size` bytes at `offset` of `memory` into `block[block_offset..]`.
/// A block too small for the output is an internal error.
fn copy_into_block(
    memory: &SharedMemory,
    offset: usize,
    size: usize,
    block: &mut LinearBlock,
    block_offset: usize,
) -> Result<()> {
    let view = block.map().map_err(|_| Status::Unknown)?;
    if view.len() < block_offset + size {
        return Err(Status::Unknown);
    }
    let data = memory.read(offset, size).map_err(|_| Status::Unknown)?;
    view[block_offset..block_offset + size].copy_from_slice(&data);
    Ok(())
}

/// Access-unit layout of a batched secure buffer, one entry per crypto info.
pub fn access_units_for(infos: &[CryptoInfo], units: &[AccessUnitInfo]) -> Vec<AccessUnitInfo> {
    infos
        .iter()
        .zip(units.iter())
        .map(|(info, unit)| AccessUnitInfo {
            size: info.total_size(),
            ..*unit
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Recorded arguments of one decrypt call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DecryptCall {
        pub source: SourceBuffer,
        pub offset: usize,
        pub subsamples: Vec<SubSample>,
        pub secure: bool,
    }

    /// Backend that "decrypts" by flipping every encrypted byte.
    #[derive(Default)]
    pub struct XorCrypto {
        pub heaps: Mutex<Vec<(i32, Arc<SharedMemory>)>>,
        pub unset: Mutex<Vec<i32>>,
        pub calls: Mutex<Vec<DecryptCall>>,
        pub fail_with: Mutex<Option<i32>>,
        next_seq: Mutex<i32>,
    }

    impl XorCrypto {
        fn heap(&self, seq: i32) -> Option<Arc<SharedMemory>> {
            self.heaps
                .lock()
                .iter()
                .find(|(s, _)| *s == seq)
                .map(|(_, m)| m.clone())
        }
    }

    pub fn plain(data: &[u8], subsamples: &[SubSample]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut pos = 0;
        for sub in subsamples {
            out.extend_from_slice(&data[pos..pos + sub.clear_bytes]);
            pos += sub.clear_bytes;
            out.extend(data[pos..pos + sub.encrypted_bytes].iter().map(|b| b ^ 0xff));
            pos += sub.encrypted_bytes;
        }
        out
    }

    impl CryptoBackend for XorCrypto {
        fn set_heap(&self, memory: Arc<SharedMemory>) -> i32 {
            let mut next = self.next_seq.lock();
            let seq = *next;
            *next += 1;
            self.heaps.lock().push((seq, memory));
            seq
        }

        fn unset_heap(&self, heap_seq_num: i32) {
            self.heaps.lock().retain(|(seq, _)| *seq != heap_seq_num);
            self.unset.lock().push(heap_seq_num);
        }

        fn decrypt(
            &self,
            _key: &[u8; 16],
            _iv: &[u8; 16],
            _mode: CryptoMode,
            _pattern: Pattern,
            source: SourceBuffer,
            offset: usize,
            subsamples: &[SubSample],
            destination: Destination<'_>,
        ) -> std::result::Result<usize, i32> {
            self.calls.lock().push(DecryptCall {
                source,
                offset,
                subsamples: subsamples.to_vec(),
                secure: matches!(destination, Destination::Secure(_)),
            });
            if let Some(err) = *self.fail_with.lock() {
                return Err(err);
            }
            let total: usize = subsamples.iter().map(SubSample::total).sum();
            let memory = self.heap(source.heap_seq_num).ok_or(-1)?;
            let data = memory.read(source.offset + offset, total).map_err(|_| -1)?;
            let out = plain(&data, subsamples);
            match destination {
                Destination::SharedMemory { heap_seq_num, .. } => {
                    let target = self.heap(heap_seq_num).ok_or(-1)?;
                    target.write(0, &out).map_err(|_| -1)?;
                }
                Destination::Secure(mut handle) => {
                    handle.as_mut_slice()[..out.len()].copy_from_slice(&out);
                }
            }
            Ok(total)
        }
    }

    /// Descrambler that flips encrypted bytes and records the control byte.
    #[derive(Default)]
    pub struct XorDescrambler {
        pub controls: Mutex<Vec<u8>>,
    }

    impl Descrambler for XorDescrambler {
        fn descramble(
            &self,
            scrambling_control: u8,
            subsamples: &[SubSample],
            source: &SharedMemory,
            source_offset: usize,
            destination: Option<SecureHandle<'_>>,
        ) -> std::result::Result<usize, i32> {
            self.controls.lock().push(scrambling_control);
            let total: usize = subsamples.iter().map(SubSample::total).sum();
            let data = source.read(source_offset, total).map_err(|_| -1)?;
            let out = plain(&data, subsamples);
            match destination {
                Some(mut handle) => handle.as_mut_slice()[..out.len()].copy_from_slice(&out),
                None => source.write(source_offset, &out).map_err(|_| -1)?,
            }
            Ok(total)
        }
    }
}
