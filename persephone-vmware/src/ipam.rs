//! Address allocation backed by the versioned key-value store.
//!
//! Each address block is one store entry keyed by its resource name
//! (`blocks/<datacenter>-<network>`). Allocating or releasing an address is a
//! read-modify-write of that entry under compare-and-set, retried when a
//! concurrent writer got there first. The store's event feed doubles as the
//! lease log.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use persephone_kv::{KeyValueStore, MonotonicVersion, StoreError, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::clients::{
    self, Address, AddressAllocationClient, AllocateAddressResponse, AllocationStatus, ClientError,
    ReleaseAddressResponse,
};

/// Prefix of address block resource names.
pub const BLOCK_NAME_PREFIX: &str = "blocks/";

const ADDRESS_SEGMENT: &str = "/addresses/";

/// Resource name of the block serving `network` in `datacenter`.
pub fn block_name(datacenter: &str, network: &str) -> String {
    format!("{BLOCK_NAME_PREFIX}{datacenter}-{network}")
}

/// Resource name of `address` within block `parent`.
pub fn address_name(parent: &str, address: Ipv4Addr) -> String {
    format!("{parent}{ADDRESS_SEGMENT}{:08x}", u32::from(address))
}

fn parse_address_name(name: &str) -> Option<(&str, Ipv4Addr)> {
    let (parent, hex) = name.trim_start_matches('/').rsplit_once(ADDRESS_SEGMENT)?;
    let value = u32::from_str_radix(hex, 16).ok()?;
    Some((parent, Ipv4Addr::from(value)))
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("address block {0} already exists")]
    BlockExists(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One address block: its range, the addresses never handed out, and the
/// current leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBlock {
    pub prefix: Ipv4Net,
    pub reserved: BTreeSet<Ipv4Addr>,
    pub allocated: BTreeSet<Ipv4Addr>,
}

impl AddressBlock {
    pub fn new(prefix: Ipv4Net, reserved: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            prefix: prefix.trunc(),
            reserved: reserved.into_iter().collect(),
            allocated: BTreeSet::new(),
        }
    }

    /// Lowest host address that is neither reserved nor leased.
    pub fn next_free(&self) -> Option<Ipv4Addr> {
        self.prefix
            .hosts()
            .find(|address| !self.reserved.contains(address) && !self.allocated.contains(address))
    }
}

/// [`AddressAllocationClient`] over a versioned store.
#[derive(Debug, Clone)]
pub struct StoreBackedAllocator<S> {
    store: S,
}

impl<S> StoreBackedAllocator<S>
where
    S: KeyValueStore<String, AddressBlock, MonotonicVersion>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register block `name`. Fails if the name is taken.
    pub async fn create_block(&self, name: &str, block: AddressBlock) -> Result<(), AllocatorError> {
        let prefix = block.prefix;
        match self
            .store
            .set(name.to_string(), MonotonicVersion::initial(), block)
            .await
        {
            Ok(_) => {
                info!(block = name, %prefix, "registered address block");
                Ok(())
            }
            Err(StoreError::VersionMismatch { .. }) => {
                Err(AllocatorError::BlockExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `update` to block `name` under compare-and-set until it sticks.
    ///
    /// `update` returns `Err(status)` to give up without writing.
    async fn update_block<R>(
        &self,
        name: &str,
        mut update: impl FnMut(&mut AddressBlock) -> Result<R, AllocationStatus> + Send,
    ) -> clients::Result<Result<R, AllocationStatus>>
    where
        R: Send,
    {
        loop {
            let current = self.store.get(name.to_string()).await.map_err(store_failure)?;
            let version = current.version();
            let Some(mut block) = current.into_value() else {
                return Ok(Err(AllocationStatus::NotFound));
            };

            let outcome = match update(&mut block) {
                Ok(outcome) => outcome,
                Err(status) => return Ok(Err(status)),
            };

            match self.store.set(name.to_string(), version, block).await {
                Ok(_) => return Ok(Ok(outcome)),
                Err(StoreError::VersionMismatch { expected, actual }) => {
                    debug!(block = name, %expected, %actual, "lost block update race, retrying");
                }
                Err(e) => return Err(store_failure(e)),
            }
        }
    }
}

fn store_failure(error: StoreError) -> ClientError {
    ClientError::Unavailable(format!("address store: {error}"))
}

#[async_trait]
impl<S> AddressAllocationClient for StoreBackedAllocator<S>
where
    S: KeyValueStore<String, AddressBlock, MonotonicVersion>,
{
    async fn allocate_address(&self, parent: &str) -> clients::Result<AllocateAddressResponse> {
        let outcome = self
            .update_block(parent, |block| {
                let address = block.next_free().ok_or(AllocationStatus::Exhausted)?;
                block.allocated.insert(address);
                Ok(address)
            })
            .await?;

        Ok(match outcome {
            Ok(value) => {
                let address = Address {
                    name: address_name(parent, value),
                    value,
                };
                debug!(block = parent, address = %value, "leased address");
                AllocateAddressResponse {
                    status: AllocationStatus::Ok,
                    address: Some(address),
                }
            }
            Err(status) => AllocateAddressResponse {
                status,
                address: None,
            },
        })
    }

    async fn release_address(&self, name: &str) -> clients::Result<ReleaseAddressResponse> {
        let Some((parent, address)) = parse_address_name(name) else {
            return Ok(ReleaseAddressResponse {
                status: AllocationStatus::NotFound,
            });
        };

        let outcome = self
            .update_block(parent, |block| {
                if block.allocated.remove(&address) {
                    Ok(())
                } else {
                    Err(AllocationStatus::NotFound)
                }
            })
            .await?;

        let status = match outcome {
            Ok(()) => {
                debug!(block = parent, address = %address, "released address");
                AllocationStatus::Ok
            }
            Err(status) => status,
        };
        Ok(ReleaseAddressResponse { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use persephone_kv::{Event, InMemoryKeyValueStore};
    use std::sync::Arc;

    type Allocator = StoreBackedAllocator<InMemoryKeyValueStore<String, AddressBlock>>;

    const PARENT: &str = "blocks/sddc-1-control";

    async fn allocator(prefix: &str, reserved: &[Ipv4Addr]) -> Allocator {
        let allocator = StoreBackedAllocator::new(InMemoryKeyValueStore::new());
        allocator
            .create_block(
                PARENT,
                AddressBlock::new(prefix.parse().unwrap(), reserved.iter().copied()),
            )
            .await
            .unwrap();
        allocator
    }

    #[test]
    fn test_address_names() {
        let name = address_name(PARENT, Ipv4Addr::new(10, 1, 0, 5));
        assert_eq!(name, "blocks/sddc-1-control/addresses/0a010005");
        assert_eq!(
            parse_address_name(&format!("/{name}")),
            Some((PARENT, Ipv4Addr::new(10, 1, 0, 5)))
        );
        assert_eq!(parse_address_name("blocks/x"), None);
        assert_eq!(block_name("sddc-1", "control"), PARENT);
    }

    #[tokio::test]
    async fn test_allocate_skips_reserved() {
        let allocator = allocator("10.1.0.0/29", &[Ipv4Addr::new(10, 1, 0, 1)]).await;

        let response = allocator.allocate_address(PARENT).await.unwrap();
        assert_eq!(response.status, AllocationStatus::Ok);
        let address = response.address.unwrap();
        assert_eq!(address.value, Ipv4Addr::new(10, 1, 0, 2));
        assert_eq!(address.name, "blocks/sddc-1-control/addresses/0a010002");
    }

    #[tokio::test]
    async fn test_block_exhaustion_and_release() {
        // /30 has two hosts; one is reserved.
        let allocator = allocator("10.1.0.0/30", &[Ipv4Addr::new(10, 1, 0, 1)]).await;

        let first = allocator.allocate_address(PARENT).await.unwrap();
        let exhausted = allocator.allocate_address(PARENT).await.unwrap();
        assert_eq!(exhausted.status, AllocationStatus::Exhausted);

        let name = first.address.unwrap().name;
        let released = allocator.release_address(&name).await.unwrap();
        assert_eq!(released.status, AllocationStatus::Ok);
        let again = allocator.release_address(&name).await.unwrap();
        assert_eq!(again.status, AllocationStatus::NotFound);

        let reused = allocator.allocate_address(PARENT).await.unwrap();
        assert_eq!(reused.address.unwrap().name, name);
    }

    #[tokio::test]
    async fn test_unknown_block() {
        let allocator = allocator("10.1.0.0/24", &[]).await;
        let response = allocator.allocate_address("blocks/nope").await.unwrap();
        assert_eq!(response.status, AllocationStatus::NotFound);
        assert!(response.address.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_block_is_rejected() {
        let allocator = allocator("10.1.0.0/24", &[]).await;
        let err = allocator
            .create_block(PARENT, AddressBlock::new("10.2.0.0/24".parse().unwrap(), []))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::BlockExists(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_are_unique() {
        let allocator = Arc::new(allocator("10.1.0.0/24", &[Ipv4Addr::new(10, 1, 0, 1)]).await);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                tokio::spawn(async move { allocator.allocate_address(PARENT).await })
            })
            .collect();

        let mut leased = BTreeSet::new();
        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert!(leased.insert(response.address.unwrap().value));
        }
        assert_eq!(leased.len(), 32);
    }

    #[tokio::test]
    async fn test_leases_show_up_in_event_feed() {
        let allocator = allocator("10.1.0.0/24", &[]).await;
        let mut feed = allocator.store().subscribe(8, true).await.unwrap();

        // Replayed block registration.
        let registered = feed.next().await.unwrap().unwrap();
        assert!(matches!(registered, Event::Change { ref key, .. } if key == PARENT));

        allocator.allocate_address(PARENT).await.unwrap();
        match feed.next().await.unwrap().unwrap() {
            Event::Change { value, version, .. } => {
                assert_eq!(value.allocated.len(), 1);
                assert_eq!(version, MonotonicVersion(2));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
