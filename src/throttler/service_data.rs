//! Per-bin service registration and the apportionment data each process
//! publishes
//!
//! Every bin of every process registers an anonymous service under a type
//! named after the group and bin. Polling scans the active services of that
//! type under the bin's target lock to see what the peers took.
//! Malformed or missing data decodes as zero, i.e. a peer that takes no
//! share.

use crate::error::CoordinationResult;
use crate::lock_manager::LockManager;

#[derive(Debug)]
pub(crate) struct BinRegistration {
    service_type: String,
    service_name: String,
    target_lock: String,
}

/// What a scan of a bin's services found
#[derive(Debug, Default)]
pub(crate) struct PeerData {
    /// Active services including this process
    pub services: usize,
    /// Data published by the other processes
    pub others: Vec<Vec<u8>>,
}

impl BinRegistration {
    pub(crate) fn register(
        lm: &mut LockManager,
        service_prefix: &str,
        target_prefix: &str,
        group_name: &str,
        bin_name: &str,
    ) -> CoordinationResult<Self> {
        let service_type = format!("{service_prefix}{group_name}_{bin_name}");
        let service_name =
            lm.register_service_begin_service_activity(&service_type, None, None, None)?;
        Ok(Self {
            service_type,
            target_lock: format!("{target_prefix}{group_name}_{bin_name}"),
            service_name,
        })
    }

    /// Run `body` holding the bin's target lock for write
    pub(crate) fn with_target_lock<T>(
        &self,
        lm: &mut LockManager,
        body: impl FnOnce(&mut LockManager) -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        lm.enter_write_lock(&self.target_lock)?;
        let result = body(lm);
        let released = lm.leave_write_lock(&self.target_lock);
        let value = result?;
        released?;
        Ok(value)
    }

    pub(crate) fn scan_peers(&self, lm: &mut LockManager) -> CoordinationResult<PeerData> {
        let mut peers = PeerData::default();
        lm.scan_service_data(&self.service_type, |name, data| {
            peers.services += 1;
            if name != self.service_name {
                peers.others.push(data.map(<[u8]>::to_vec).unwrap_or_default());
            }
            Ok(false)
        })?;
        Ok(peers)
    }

    pub(crate) fn publish(&self, lm: &mut LockManager, data: &[u8]) -> CoordinationResult<()> {
        lm.update_service_data(&self.service_type, &self.service_name, Some(data))
    }

    pub(crate) fn unregister(&self, lm: &mut LockManager) -> CoordinationResult<()> {
        lm.end_service_activity(&self.service_type, &self.service_name)
    }
}

/// Connection bins: granted target and connections in use
pub(crate) fn pack_connection(target: u32, in_use: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&target.to_le_bytes());
    out[4..].copy_from_slice(&in_use.to_le_bytes());
    out
}

pub(crate) fn unpack_connection(data: Option<&[u8]>) -> (u32, u32) {
    let Some(data) = data.filter(|d| d.len() == 8) else {
        return (0, 0);
    };
    let mut target = [0u8; 4];
    let mut in_use = [0u8; 4];
    target.copy_from_slice(&data[..4]);
    in_use.copy_from_slice(&data[4..]);
    (u32::from_le_bytes(target), u32::from_le_bytes(in_use))
}

/// Fetch bins: granted fetches per millisecond and last fetch start
pub(crate) fn pack_fetch(inverse_target: f64, last_fetch_ms: i64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&inverse_target.to_bits().to_le_bytes());
    out[8..].copy_from_slice(&last_fetch_ms.to_le_bytes());
    out
}

pub(crate) fn unpack_fetch(data: Option<&[u8]>) -> (f64, i64) {
    let Some(data) = data.filter(|d| d.len() == 16) else {
        return (0.0, 0);
    };
    let mut rate = [0u8; 8];
    let mut last = [0u8; 8];
    rate.copy_from_slice(&data[..8]);
    last.copy_from_slice(&data[8..]);
    (
        f64::from_bits(u64::from_le_bytes(rate)),
        i64::from_le_bytes(last),
    )
}

/// Byte-rate bins: granted bytes per millisecond
pub(crate) fn pack_rate(inverse_target: f64) -> [u8; 8] {
    inverse_target.to_bits().to_le_bytes()
}

pub(crate) fn unpack_rate(data: Option<&[u8]>) -> f64 {
    data.and_then(|d| <[u8; 8]>::try_from(d).ok())
        .map_or(0.0, |raw| f64::from_bits(u64::from_le_bytes(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_data_is_zero_share() {
        assert_eq!(unpack_connection(Some(&[1, 2, 3])), (0, 0));
        assert_eq!(unpack_connection(None), (0, 0));
        assert_eq!(unpack_fetch(Some(&[0; 8])), (0.0, 0));
        assert_eq!(unpack_rate(Some(&[])), 0.0);
    }

    #[test]
    fn test_connection_layout_is_little_endian() {
        assert_eq!(pack_connection(1, 2), [1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(unpack_connection(Some(&pack_connection(7, 3))), (7, 3));
    }
}
