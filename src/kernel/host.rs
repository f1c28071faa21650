//! Host device.
//!
//! The host queue is in-order and completes each launch before `enqueue`
//! returns, so `synchronize` has nothing to wait for. Kernel bodies come from
//! the kernel library and parallelize internally with `rayon`.
//!
//! A host kernel body receives its positional arguments through [`HostArgs`],
//! which turns every access into a checked, typed read.

use std::sync::Arc;

use super::{ArgKind, Device, KernelArg, KernelDef, KernelInfo, Program, kernel_def};
use crate::backend::Target;
use crate::error::DeviceError;
use crate::tensors::{Buffer, Storage};

/// Signature of a host kernel body.
pub type HostKernelFn = fn(&HostArgs<'_>) -> Result<(), DeviceError>;

/// CPU device. Cheap to create; all state lives in the program cache.
#[derive(Debug, Clone)]
pub struct HostDevice {
    id: usize,
}

impl HostDevice {
    pub fn new(id: usize) -> Self {
        Self { id }
    }
}

impl Device for HostDevice {
    fn target(&self) -> Target {
        Target::Host
    }

    fn id(&self) -> usize {
        self.id
    }

    fn build(&self, info: &KernelInfo) -> Result<Arc<dyn Program>, DeviceError> {
        let def = kernel_def(&info.kernel_name).ok_or_else(|| DeviceError::NotFound {
            file: info.kernel_file.clone(),
            kernel: info.kernel_name.clone(),
        })?;
        Ok(Arc::new(HostProgram { def }))
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

struct HostProgram {
    def: &'static KernelDef,
}

impl Program for HostProgram {
    fn name(&self) -> &str {
        self.def.name
    }

    fn signature(&self) -> &[ArgKind] {
        self.def.signature
    }

    fn enqueue(&self, args: &[KernelArg], _local: &[usize], _global: &[usize]) -> Result<(), DeviceError> {
        (self.def.host)(&HostArgs {
            kernel: self.def.name,
            args,
        })
    }
}

/// Checked view over the arguments of one host launch.
pub struct HostArgs<'a> {
    kernel: &'a str,
    args: &'a [KernelArg],
}

impl<'a> HostArgs<'a> {
    /// Wraps raw arguments, used when a body is called outside a queue.
    pub fn new(kernel: &'a str, args: &'a [KernelArg]) -> Self {
        Self { kernel, args }
    }

    pub fn kernel(&self) -> &str {
        self.kernel
    }

    /// Builds an argument error for this kernel.
    pub fn error(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::Args {
            kernel: self.kernel.to_string(),
            reason: reason.into(),
        }
    }

    fn arg(&self, i: usize) -> Result<&'a KernelArg, DeviceError> {
        self.args
            .get(i)
            .ok_or_else(|| self.error(format!("argument {i} missing")))
    }

    pub fn buffer(&self, i: usize) -> Result<&'a Buffer, DeviceError> {
        match self.arg(i)? {
            KernelArg::Buffer(b) => Ok(b),
            _ => Err(self.error(format!("argument {i} is not a buffer"))),
        }
    }

    pub fn int(&self, i: usize) -> Result<i32, DeviceError> {
        match self.arg(i)? {
            KernelArg::Int(v) => Ok(*v),
            _ => Err(self.error(format!("argument {i} is not an int"))),
        }
    }

    /// Integer argument that must be non-negative.
    pub fn size(&self, i: usize) -> Result<usize, DeviceError> {
        let v = self.int(i)?;
        usize::try_from(v).map_err(|_| self.error(format!("argument {i} is negative ({v})")))
    }

    pub fn float(&self, i: usize) -> Result<f32, DeviceError> {
        match self.arg(i)? {
            KernelArg::Float(v) => Ok(*v),
            _ => Err(self.error(format!("argument {i} is not a float"))),
        }
    }

    /// `f32` contents of a locked buffer, at least `len` long.
    pub fn f32s<'g>(&self, storage: &'g Storage, len: usize) -> Result<&'g [f32], DeviceError> {
        let data = storage
            .as_f32()
            .ok_or_else(|| self.error("expected an f32 buffer"))?;
        self.check_len(data.len(), len)?;
        Ok(&data[..len])
    }

    pub fn f32s_mut<'g>(&self, storage: &'g mut Storage, len: usize) -> Result<&'g mut [f32], DeviceError> {
        let kernel = self.kernel;
        let data = storage.as_f32_mut().ok_or_else(|| DeviceError::Args {
            kernel: kernel.to_string(),
            reason: "expected an f32 buffer".into(),
        })?;
        self.check_len(data.len(), len)?;
        Ok(&mut data[..len])
    }

    pub fn i32s<'g>(&self, storage: &'g Storage, len: usize) -> Result<&'g [i32], DeviceError> {
        let data = storage
            .as_i32()
            .ok_or_else(|| self.error("expected an i32 buffer"))?;
        self.check_len(data.len(), len)?;
        Ok(&data[..len])
    }

    fn check_len(&self, have: usize, need: usize) -> Result<(), DeviceError> {
        if have < need {
            return Err(self.error(format!("buffer holds {have} elements, kernel needs {need}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::DataType;

    #[test]
    fn checked_reads() {
        let buf = Buffer::new(Storage::F32(vec![1.0, 2.0]));
        let args = [KernelArg::Buffer(buf.clone()), KernelArg::Int(-1), KernelArg::Float(0.5)];
        let a = HostArgs::new("k", &args);
        assert!(a.buffer(0).is_ok());
        assert!(a.buffer(1).is_err());
        assert!(a.size(1).is_err());
        assert_eq!(a.float(2).unwrap(), 0.5);
        assert!(a.int(7).is_err());

        let guard = buf.read();
        assert_eq!(a.f32s(&guard, 2).unwrap(), &[1.0, 2.0]);
        assert!(a.f32s(&guard, 3).is_err());
        assert!(a.i32s(&guard, 1).is_err());
        assert_eq!(Buffer::zeros(DataType::I32, 3).dtype(), DataType::I32);
    }
}
