//! The message-passing substrate processes aggregate through.
//!
//! The engine needs three collectives: an all-gather for the statistics
//! phase, a sum reduction for whole-run call counts and a barrier. A
//! real implementation wraps an MPI binding; the default
//! [`SingleProcess`] gives identity semantics for one-process runs. A
//! failed collective is the one fatal error class in the library: the
//! caller logs it and aborts the process group through
//! [`Collectives::abort`].

use crate::error::CollectiveError;

/// Seam to the process-parallel runtime.
pub trait Collectives: Send + Sync {
    /// This process's rank, 0-based.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Gather `send` from every rank into a rank-major vector of length
    /// `send.len() * size()`, returned on every rank.
    fn all_gather(&self, send: &[f64]) -> Result<Vec<f64>, CollectiveError>;

    /// Sum `value` across all ranks; the result is available everywhere.
    fn reduce_sum(&self, value: f64) -> Result<f64, CollectiveError>;

    /// Synchronise all ranks.
    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Tear the whole process group down after an unrecoverable
    /// collective failure.
    fn abort(&self, _code: i32) -> ! {
        std::process::abort()
    }
}

/// The one-process group: rank 0 of 1, every collective is the identity.
#[derive(Debug, Default)]
pub struct SingleProcess;

impl Collectives for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, send: &[f64]) -> Result<Vec<f64>, CollectiveError> {
        Ok(send.to_vec())
    }

    fn reduce_sum(&self, value: f64) -> Result<f64, CollectiveError> {
        Ok(value)
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_identity() {
        let w = SingleProcess;
        assert_eq!(w.rank(), 0);
        assert_eq!(w.size(), 1);
        assert_eq!(w.all_gather(&[1.0, 2.0]).unwrap(), vec![1.0, 2.0]);
        assert_eq!(w.reduce_sum(3.5).unwrap(), 3.5);
        assert!(w.barrier().is_ok());
    }
}
