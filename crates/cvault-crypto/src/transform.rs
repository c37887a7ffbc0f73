//! Pre-encryption transform stage
//!
//! An offloadable compute step that runs on each chunk before AEAD. It is not
//! a confidentiality layer: the accelerated variant XORs with a repeating pad
//! derived from the file key and is trivially invertible. Confidentiality
//! comes only from the chunk AEAD that always follows.

use std::path::{Path, PathBuf};

use hkdf::Hkdf;
use rayon::prelude::*;
use sha2::Sha256;
use zeroize::Zeroizing;

use cvault_core::types::TransformKind;
use cvault_core::{CvaultError, CvaultResult};

use crate::keys::FileKey;

/// Repeating pad length of the accelerated transform.
pub const PAD_SIZE: usize = 4096;

const PAD_INFO: &[u8] = b"cvault-transform-pad";

pub trait Transform: Send + Sync {
    fn kind(&self) -> TransformKind;

    /// Apply in place. Fails with `TransformUnavailable` when the backing
    /// hardware is missing; never silently degrades.
    fn forward(&self, file_key: &FileKey, data: &mut [u8]) -> CvaultResult<()>;

    /// Undo [`Transform::forward`] in place. Does not require the hardware.
    fn inverse(&self, file_key: &FileKey, data: &mut [u8]) -> CvaultResult<()>;
}

/// Pass-through.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl Transform for IdentityTransform {
    fn kind(&self) -> TransformKind {
        TransformKind::Identity
    }

    fn forward(&self, _file_key: &FileKey, _data: &mut [u8]) -> CvaultResult<()> {
        Ok(())
    }

    fn inverse(&self, _file_key: &FileKey, _data: &mut [u8]) -> CvaultResult<()> {
        Ok(())
    }
}

/// Parallel XOR against a key-derived pad, gated on an accelerator device node.
#[derive(Debug, Clone)]
pub struct AcceleratedTransform {
    device: PathBuf,
}

impl AcceleratedTransform {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn is_available(&self) -> bool {
        self.device.exists()
    }
}

impl Transform for AcceleratedTransform {
    fn kind(&self) -> TransformKind {
        TransformKind::Accelerated
    }

    fn forward(&self, file_key: &FileKey, data: &mut [u8]) -> CvaultResult<()> {
        if !self.is_available() {
            return Err(CvaultError::TransformUnavailable(format!(
                "accelerator device {} not present",
                self.device.display()
            )));
        }
        xor_pad(file_key, data)
    }

    fn inverse(&self, file_key: &FileKey, data: &mut [u8]) -> CvaultResult<()> {
        xor_pad(file_key, data)
    }
}

/// Resolves a recorded [`TransformKind`] to its implementation.
#[derive(Debug, Clone)]
pub struct TransformStage {
    identity: IdentityTransform,
    accelerated: AcceleratedTransform,
}

impl TransformStage {
    pub fn new(accelerator_device: impl Into<PathBuf>) -> Self {
        Self {
            identity: IdentityTransform,
            accelerated: AcceleratedTransform::new(accelerator_device),
        }
    }

    pub fn get(&self, kind: TransformKind) -> &dyn Transform {
        match kind {
            TransformKind::Identity => &self.identity,
            TransformKind::Accelerated => &self.accelerated,
        }
    }

    pub fn accelerator_available(&self) -> bool {
        self.accelerated.is_available()
    }
}

impl Default for TransformStage {
    fn default() -> Self {
        Self::new("/dev/nvidia0")
    }
}

fn xor_pad(file_key: &FileKey, data: &mut [u8]) -> CvaultResult<()> {
    let pad = derive_pad(file_key)?;
    data.par_chunks_mut(PAD_SIZE).for_each(|block| {
        for (byte, p) in block.iter_mut().zip(pad.iter()) {
            *byte ^= p;
        }
    });
    Ok(())
}

fn derive_pad(file_key: &FileKey) -> CvaultResult<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(None, file_key.as_bytes());
    let mut pad = Zeroizing::new(vec![0u8; PAD_SIZE]);
    hkdf.expand(PAD_INFO, &mut pad[..])
        .map_err(|e| CvaultError::Other(anyhow::anyhow!("transform pad derivation failed: {e}")))?;
    Ok(pad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_file_key;
    use tempfile::NamedTempFile;

    #[test]
    fn identity_is_noop() {
        let key = generate_file_key();
        let mut data = b"unchanged".to_vec();
        IdentityTransform.forward(&key, &mut data).unwrap();
        assert_eq!(data, b"unchanged");
    }

    #[test]
    fn accelerated_without_device_fails_explicitly() {
        let key = generate_file_key();
        let stage = TransformStage::new("/nonexistent/cvault-accel0");
        assert!(!stage.accelerator_available());

        let mut data = vec![1u8; 64];
        let err = stage
            .get(TransformKind::Accelerated)
            .forward(&key, &mut data)
            .unwrap_err();
        assert!(matches!(err, CvaultError::TransformUnavailable(_)));
        assert_eq!(data, vec![1u8; 64], "data must be untouched on failure");
    }

    #[test]
    fn accelerated_roundtrip_across_pad_boundary() {
        let device = NamedTempFile::new().unwrap();
        let stage = TransformStage::new(device.path());
        let key = generate_file_key();

        let original: Vec<u8> = (0..PAD_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let mut data = original.clone();
        let accel = stage.get(TransformKind::Accelerated);
        accel.forward(&key, &mut data).unwrap();
        assert_ne!(data, original);
        // The pad repeats every PAD_SIZE bytes.
        assert_eq!(
            data[0] ^ original[0],
            data[PAD_SIZE] ^ original[PAD_SIZE]
        );

        accel.inverse(&key, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn inverse_does_not_need_device() {
        let key = generate_file_key();
        let device = NamedTempFile::new().unwrap();
        let mut data = b"offloaded bytes".to_vec();
        AcceleratedTransform::new(device.path())
            .forward(&key, &mut data)
            .unwrap();

        AcceleratedTransform::new("/nonexistent/cvault-accel0")
            .inverse(&key, &mut data)
            .unwrap();
        assert_eq!(data, b"offloaded bytes");
    }
}
