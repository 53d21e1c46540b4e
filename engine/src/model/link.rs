use crate::device::DeviceRole;
use crate::errors::Result;
use crate::tensor_ops::Tensor2D;

/// A hidden-state tensor tagged with the device that holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub tensor: Tensor2D,
    pub device: DeviceRole,
}

impl Activation {
    pub fn new(tensor: Tensor2D, device: DeviceRole) -> Self {
        Self { tensor, device }
    }
}

/// Copies activations between the primary and the secondary device.
///
/// Implementations are blocking: the copy has completed when `copy` returns.
pub trait DeviceLink: Send + Sync {
    fn copy(&self, activation: &Activation, to: DeviceRole) -> Result<Activation>;
}

/// Move `activation` to `to`, skipping the link when it is already there.
pub fn route(link: &dyn DeviceLink, activation: Activation, to: DeviceRole) -> Result<Activation> {
    if activation.device == to {
        return Ok(activation);
    }
    link.copy(&activation, to)
}

/// Link for devices that share host memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostLink;

impl DeviceLink for HostLink {
    fn copy(&self, activation: &Activation, to: DeviceRole) -> Result<Activation> {
        tracing::trace!(
            from = %activation.device,
            to = %to,
            bytes = activation.tensor.byte_len(),
            "Copying activation"
        );
        Ok(Activation::new(activation.tensor.clone(), to))
    }
}
