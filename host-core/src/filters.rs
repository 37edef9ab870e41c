//! # Out-of-Band Filter Store
//!
//! The firmware tells the host which received frames it wants to see. The
//! whole filter set is replaced at once: readers take an `Arc` snapshot for
//! one classification and never observe a half-written set. The previous set
//! is freed when its last snapshot is dropped.

use std::sync::{Arc, PoisonError, RwLock};

use sap_shared::protocol::{OobFilters, ETH_ALEN};

use crate::upstream::RxVerdict;

/// Flag bits of an Ethernet filter
pub mod eth_flags {
    /// Frame goes to the firmware only
    pub const STOP: u8 = 1 << 0;
    /// Firmware gets a copy, the host keeps the frame
    pub const COPY: u8 = 1 << 1;
    pub const ENABLED: u8 = 1 << 2;
}

/// Complete set of firmware filters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterSet {
    oob: OobFilters,
}

impl FilterSet {
    pub fn new(oob: OobFilters) -> Self {
        Self { oob }
    }

    pub fn oob(&self) -> &OobFilters {
        &self.oob
    }

    /// Verdict of the first enabled Ethernet filter matching `dst`
    pub fn match_eth_dst(&self, dst: &[u8; ETH_ALEN]) -> Option<RxVerdict> {
        self.oob
            .eth_filters
            .iter()
            .filter(|f| f.flags & eth_flags::ENABLED != 0)
            .find(|f| &f.mac_address == dst)
            .map(|f| {
                if f.flags & eth_flags::STOP != 0 {
                    RxVerdict::Steal
                } else if f.flags & eth_flags::COPY != 0 {
                    RxVerdict::Copy
                } else {
                    RxVerdict::Pass
                }
            })
    }
}

/// Copy-on-write holder of the current [`FilterSet`]
#[derive(Debug, Default)]
pub struct FilterStore {
    current: RwLock<Option<Arc<FilterSet>>>,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Arc<FilterSet>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a new set, returning the previous one
    pub fn replace(&self, filters: FilterSet) -> Option<Arc<FilterSet>> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        current.replace(Arc::new(filters))
    }

    pub fn clear(&self) {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sap_shared::protocol::EthFilter;

    fn filters_for(mac: [u8; 6], flags: u8) -> FilterSet {
        let mut oob = OobFilters::default();
        oob.eth_filters[2] = EthFilter {
            mac_address: mac,
            flags,
        };
        FilterSet::new(oob)
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let store = FilterStore::new();
        assert!(store.snapshot().is_none());

        store.replace(filters_for([1; 6], eth_flags::ENABLED));
        let old = store.snapshot().unwrap();

        let previous = store.replace(filters_for([2; 6], eth_flags::ENABLED));
        assert!(Arc::ptr_eq(&previous.unwrap(), &old));
        assert_eq!(old.oob().eth_filters[2].mac_address, [1; 6]);
        assert_eq!(store.snapshot().unwrap().oob().eth_filters[2].mac_address, [2; 6]);

        store.clear();
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn test_match_eth_dst() {
        let mac = [0x02, 0, 0, 0, 0, 0x10];
        let set = filters_for(mac, eth_flags::ENABLED | eth_flags::COPY);
        assert_eq!(set.match_eth_dst(&mac), Some(RxVerdict::Copy));
        assert_eq!(set.match_eth_dst(&[0xff; 6]), None);

        let set = filters_for(mac, eth_flags::ENABLED | eth_flags::STOP);
        assert_eq!(set.match_eth_dst(&mac), Some(RxVerdict::Steal));

        let disabled = filters_for(mac, eth_flags::STOP);
        assert_eq!(disabled.match_eth_dst(&mac), None);
    }
}
