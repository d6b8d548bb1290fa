//! Tunnel state store client.
//!
//! [`TunnelStore`] reads and records the tunnel intent of a device. Writes only
//! record intent: the device observes the new value on its own schedule and the
//! store gives no read-your-writes guarantee towards the device side.

use std::sync::Arc;

use deadend_core::tunnel::{encode_closed, encode_port};
use deadend_core::{DeviceKey, TunnelDescriptor};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::device::Device;
use crate::k8s::DeviceRegistry;
use crate::Result;

/// Reads and requests device tunnels through a [`DeviceRegistry`].
pub struct TunnelStore<R: ?Sized> {
    registry: Arc<R>,
    rng: Mutex<StdRng>,
}

impl<R: DeviceRegistry + ?Sized> TunnelStore<R> {
    /// Create a store that allocates ports from OS entropy.
    #[must_use]
    pub fn new(registry: Arc<R>) -> Self {
        Self {
            registry,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a store with a deterministic port allocator.
    #[must_use]
    pub fn with_seed(registry: Arc<R>, seed: u64) -> Self {
        Self {
            registry,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The registry this store talks to.
    #[must_use]
    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Effective descriptor of an already fetched record.
    ///
    /// When the record holds no usable port the descriptor is closed and
    /// carries a freshly allocated one.
    pub fn descriptor_for(&self, device: &Device) -> TunnelDescriptor {
        device.resolve_tunnel(&mut *self.rng.lock())
    }

    /// Fetch a device and resolve its tunnel descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be fetched.
    pub async fn read(&self, key: &DeviceKey) -> Result<TunnelDescriptor> {
        let device = self.registry.get_device(key).await?;
        let desc = self.descriptor_for(&device);
        debug!(device = %key, port = ?desc.port, open = desc.open, "Read tunnel state");
        Ok(desc)
    }

    /// Fetch a device and report its tunnel exactly as recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be fetched.
    pub async fn status(&self, key: &DeviceKey) -> Result<TunnelDescriptor> {
        let device = self.registry.get_device(key).await?;
        Ok(device.recorded_tunnel())
    }

    /// Ask the device to open a reverse tunnel on `port`.
    ///
    /// Repeating the call with the same port is harmless.
    ///
    /// # Errors
    ///
    /// Returns `TunnelRequestFailed` if the update is rejected, or an error if
    /// the store cannot be reached.
    pub async fn open(&self, key: &DeviceKey, port: u16) -> Result<()> {
        self.registry.patch_tunnel(key, &encode_port(port)).await?;
        info!(device = %key, port, "Requested reverse tunnel");
        Ok(())
    }

    /// Ask the device to close its reverse tunnel.
    ///
    /// # Errors
    ///
    /// Returns `TunnelRequestFailed` if the update is rejected, or an error if
    /// the store cannot be reached.
    pub async fn close(&self, key: &DeviceKey) -> Result<()> {
        self.registry.patch_tunnel(key, &encode_closed()).await?;
        info!(device = %key, "Requested reverse tunnel close");
        Ok(())
    }
}
