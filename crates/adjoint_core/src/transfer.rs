use serde::{Deserialize, Serialize};

/// How operator callbacks move data in and out of stepper-owned vectors.
///
/// `Shared` computes directly on the stepper's buffers (zero copy).
/// `HostCopy` stages every read and write through private host buffers.
/// Both produce identical numbers; they only differ in copies made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStrategy {
    #[default]
    Shared,
    HostCopy,
}

/// Private staging buffers used by [`TransferStrategy::HostCopy`].
#[derive(Debug, Clone, Default)]
pub struct HostBuffers {
    pub input: Vec<f64>,
    pub aux: Vec<f64>,
    pub output: Vec<f64>,
}

impl TransferStrategy {
    /// Read view of `src`.
    pub fn read<'a>(&self, src: &'a [f64], host: &'a mut Vec<f64>) -> &'a [f64] {
        match self {
            TransferStrategy::Shared => src,
            TransferStrategy::HostCopy => {
                host.clear();
                host.extend_from_slice(src);
                host.as_slice()
            }
        }
    }

    /// Runs `fill` against a writable view of `dst` holding its current contents.
    ///
    /// The write handle is acquired for the duration of `fill` only and is
    /// released (copied back, for `HostCopy`) before this returns, so no
    /// writable alias of a shared buffer outlives the call.
    pub fn write<R>(&self, dst: &mut [f64], host: &mut Vec<f64>, fill: impl FnOnce(&mut [f64]) -> R) -> R {
        match self {
            TransferStrategy::Shared => fill(dst),
            TransferStrategy::HostCopy => {
                host.clear();
                host.extend_from_slice(dst);
                let out = fill(host);
                dst.copy_from_slice(host);
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_copy_reads_a_private_copy() {
        let src = [1.0, 2.0];
        let mut host = Vec::new();
        let view = TransferStrategy::HostCopy.read(&src, &mut host);
        assert_eq!(view, &src);
        assert_ne!(view.as_ptr(), src.as_ptr());

        let mut host = Vec::new();
        let view = TransferStrategy::Shared.read(&src, &mut host);
        assert_eq!(view.as_ptr(), src.as_ptr());
    }

    #[test]
    fn both_strategies_write_the_same_values() {
        for strategy in [TransferStrategy::Shared, TransferStrategy::HostCopy] {
            let mut dst = [1.0, 2.0, 3.0];
            let mut host = Vec::new();
            strategy.write(&mut dst, &mut host, |buf| {
                for v in buf.iter_mut() {
                    *v *= 2.0;
                }
            });
            assert_eq!(dst, [2.0, 4.0, 6.0]);
        }
    }
}
