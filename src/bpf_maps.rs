//! [`ProbeTable`] implementations over the BPF maps of a loaded probe object.

use std::marker::PhantomData;

use libbpf_rs::{MapCore, MapFlags, MapHandle};
use log::debug;
use plain::Plain;

use crate::error::{HarvestError, Result};
use crate::records::{
    AllocRecord, CacheCounter, CacheName, CombinedAlloc, StackId, SyscallCounter, SyscallKey,
    SyscallStackSample, CACHE_NAME_LEN,
};
use crate::table::{ProbeTable, StackTraceTable};

/// Value layouts as written by the probe program.
#[allow(non_camel_case_types)]
pub mod types {
    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct alloc_info {
        pub size: u64,
        pub timestamp_ns: u64,
        pub stack_id: i32,
        pub _pad: u32,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct combined_alloc_info {
        pub alloc_size: u64,
        pub free_size: u64,
        pub number_of_allocs: u64,
        pub number_of_frees: u64,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct cache_counter {
        pub alloc_count: u64,
        pub alloc_size: u64,
        pub free_count: u64,
        pub free_size: u64,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct syscall_counter {
        pub count: u64,
        pub total_ns: u64,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct syscall_stack_event {
        pub pid_tgid: u64,
        pub id: u64,
        pub stack_id: i64,
    }
}

use types::*;

unsafe impl Plain for alloc_info {}
unsafe impl Plain for combined_alloc_info {}
unsafe impl Plain for cache_counter {}
unsafe impl Plain for syscall_counter {}
unsafe impl Plain for syscall_stack_event {}

fn decode_plain<T: Plain + Default>(bytes: &[u8]) -> Option<T> {
    let mut value = T::default();
    plain::copy_from_bytes(&mut value, bytes).ok()?;
    Some(value)
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_ne_bytes(bytes.get(..8)?.try_into().ok()?))
}

/// Conversion between a record and the bytes stored in a map.
pub trait MapCodec: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Option<Self>;
}

impl MapCodec for u64 {
    fn encode(&self) -> Vec<u8> {
        self.to_ne_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        decode_u64(bytes)
    }
}

// `combined_allocs` keys are u64 holding the stack id bits.
impl MapCodec for StackId {
    fn encode(&self) -> Vec<u8> {
        (*self as u64).to_ne_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        decode_u64(bytes).map(|v| v as StackId)
    }
}

impl MapCodec for SyscallKey {
    fn encode(&self) -> Vec<u8> {
        self.pack().to_ne_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        decode_u64(bytes).map(SyscallKey::unpack)
    }
}

impl MapCodec for CacheName {
    fn encode(&self) -> Vec<u8> {
        self.as_raw().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; CACHE_NAME_LEN] = bytes.get(..CACHE_NAME_LEN)?.try_into().ok()?;
        Some(CacheName::from_raw(raw))
    }
}

impl MapCodec for AllocRecord {
    fn encode(&self) -> Vec<u8> {
        let raw = alloc_info {
            size: self.size,
            timestamp_ns: self.timestamp_ns,
            stack_id: self.stack_id as i32,
            _pad: 0,
        };
        unsafe { plain::as_bytes(&raw) }.to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: alloc_info = decode_plain(bytes)?;
        Some(AllocRecord {
            size: raw.size,
            timestamp_ns: raw.timestamp_ns,
            stack_id: raw.stack_id as StackId,
        })
    }
}

impl MapCodec for CombinedAlloc {
    fn encode(&self) -> Vec<u8> {
        let raw = combined_alloc_info {
            alloc_size: self.alloc_size,
            free_size: self.free_size,
            number_of_allocs: self.number_of_allocs,
            number_of_frees: self.number_of_frees,
        };
        unsafe { plain::as_bytes(&raw) }.to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: combined_alloc_info = decode_plain(bytes)?;
        Some(CombinedAlloc {
            alloc_size: raw.alloc_size,
            free_size: raw.free_size,
            number_of_allocs: raw.number_of_allocs,
            number_of_frees: raw.number_of_frees,
        })
    }
}

impl MapCodec for CacheCounter {
    fn encode(&self) -> Vec<u8> {
        let raw = cache_counter {
            alloc_count: self.alloc_count,
            alloc_size: self.alloc_size,
            free_count: self.free_count,
            free_size: self.free_size,
        };
        unsafe { plain::as_bytes(&raw) }.to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: cache_counter = decode_plain(bytes)?;
        Some(CacheCounter {
            alloc_count: raw.alloc_count,
            alloc_size: raw.alloc_size,
            free_count: raw.free_count,
            free_size: raw.free_size,
        })
    }
}

impl MapCodec for SyscallCounter {
    fn encode(&self) -> Vec<u8> {
        let raw = syscall_counter {
            count: self.count,
            total_ns: self.total_ns,
        };
        unsafe { plain::as_bytes(&raw) }.to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: syscall_counter = decode_plain(bytes)?;
        Some(SyscallCounter {
            count: raw.count,
            total_ns: raw.total_ns,
        })
    }
}

impl MapCodec for SyscallStackSample {
    fn encode(&self) -> Vec<u8> {
        let raw = syscall_stack_event {
            pid_tgid: self.pid_tgid,
            id: self.syscall_id,
            stack_id: self.stack_id,
        };
        unsafe { plain::as_bytes(&raw) }.to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let raw: syscall_stack_event = decode_plain(bytes)?;
        Some(SyscallStackSample {
            pid_tgid: raw.pid_tgid,
            syscall_id: raw.id,
            stack_id: raw.stack_id,
        })
    }
}

/// A hash map of the probe object, decoded through [`MapCodec`].
pub struct BpfTable<K, V> {
    name: &'static str,
    map: MapHandle,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BpfTable<K, V> {
    pub fn new(name: &'static str, map: MapHandle) -> Self {
        BpfTable {
            name,
            map,
            _marker: PhantomData,
        }
    }

    fn delete_raw(&self, keys: Vec<Vec<u8>>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let count = keys.len() as u32;
        let flat: Vec<u8> = keys.iter().flatten().copied().collect();
        if let Err(e) = self
            .map
            .delete_batch(&flat, count, MapFlags::ANY, MapFlags::ANY)
        {
            // Older kernels lack batch ops on hash maps.
            debug!("{}: batch delete failed ({e}), deleting one by one", self.name);
            for key in &keys {
                self.map
                    .delete(key)
                    .map_err(|e| HarvestError::table(self.name, e))?;
            }
        }
        Ok(())
    }
}

impl<K: MapCodec, V: MapCodec> ProbeTable<K, V> for BpfTable<K, V> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn entries(&self) -> Result<Vec<(K, V)>> {
        let mut rows = Vec::new();
        for raw_key in self.map.keys() {
            let raw_value = match self.map.lookup(&raw_key, MapFlags::ANY) {
                Ok(Some(value)) => value,
                // Removed by the probe since the key was listed.
                Ok(None) => continue,
                Err(e) => return Err(HarvestError::table(self.name, e)),
            };
            match (K::decode(&raw_key), V::decode(&raw_value)) {
                (Some(key), Some(value)) => rows.push((key, value)),
                _ => debug!(
                    "{}: skipping row with unexpected size {}/{}",
                    self.name,
                    raw_key.len(),
                    raw_value.len()
                ),
            }
        }
        Ok(rows)
    }

    fn delete_batch(&mut self, keys: &[K]) -> Result<()> {
        self.delete_raw(keys.iter().map(MapCodec::encode).collect())
    }

    fn clear(&mut self) -> Result<()> {
        let keys: Vec<Vec<u8>> = self.map.keys().collect();
        self.delete_raw(keys)
    }
}

/// The `BPF_MAP_TYPE_STACK_TRACE` map.
pub struct BpfStackTraces {
    map: MapHandle,
}

impl BpfStackTraces {
    pub fn new(map: MapHandle) -> Self {
        BpfStackTraces { map }
    }
}

impl StackTraceTable for BpfStackTraces {
    fn walk(&self, stack_id: StackId) -> Result<Option<Vec<u64>>> {
        let Ok(id) = u32::try_from(stack_id) else {
            return Ok(None);
        };
        let frames = self
            .map
            .lookup(&id.to_ne_bytes(), MapFlags::ANY)
            .map_err(|e| HarvestError::table("stack_traces", e))?;
        Ok(frames.map(|bytes| {
            bytes
                .chunks_exact(8)
                .filter_map(decode_u64)
                .take_while(|addr| *addr != 0)
                .collect()
        }))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.map.keys().count())
    }
}
