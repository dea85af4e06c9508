//! Fixed-size thread pool striping work over pixel portions.
//!
//! Threads claim portions through a shared atomic cursor. A portion is taken
//! out of its slot before the work runs, so no lock is held while copying.

use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Portion size for striping `num_pixels` pixels over `num_threads` threads.
#[must_use]
pub fn portion_size(num_pixels: usize, num_threads: usize) -> usize {
    (num_pixels / num_threads.max(1) / 3).max(1)
}

/// Runs `task` once for every portion on up to `num_threads` threads.
///
/// Remaining portions are abandoned after the first failure.
///
/// # Errors
/// Returns the first error of `task`, or [`Error::ThreadPanic`] if a thread
/// panicked.
pub fn run_striped<P, F>(num_threads: usize, portions: Vec<P>, task: F) -> Result<()>
where
    P: Send,
    F: Fn(P) -> Result<()> + Sync,
{
    let slots: Vec<Mutex<Option<P>>> = portions
        .into_iter()
        .map(|portion| Mutex::new(Some(portion)))
        .collect();
    let threads = num_threads.clamp(1, slots.len().max(1));
    let cursor = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| scope.spawn(|| claim_and_run(&cursor, &failed, &slots, &task)))
            .collect();

        let mut first_error = None;
        for handle in handles {
            let result = handle
                .join()
                .map_err(|payload| Error::from_panic(&*payload))
                .and_then(|result| result);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    })
}

fn claim_and_run<P, F>(
    cursor: &AtomicUsize,
    failed: &AtomicBool,
    slots: &[Mutex<Option<P>>],
    task: &F,
) -> Result<()>
where
    F: Fn(P) -> Result<()>,
{
    while !failed.load(Ordering::Relaxed) {
        let index = cursor.fetch_add(1, Ordering::Relaxed);
        let Some(slot) = slots.get(index) else {
            break;
        };
        let portion = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(portion) = portion {
            if let Err(e) = task(portion) {
                failed.store(true, Ordering::Relaxed);
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portion_size() {
        assert_eq!(portion_size(900, 3), 100);
        assert_eq!(portion_size(5, 4), 1);
        assert_eq!(portion_size(0, 0), 1);
    }

    #[test]
    fn test_every_portion_runs_once() {
        let mut data = vec![0u32; 1000];
        let portions: Vec<&mut [u32]> = data.chunks_mut(portion_size(1000, 4)).collect();
        run_striped(4, portions, |portion| {
            for value in portion {
                *value += 1;
            }
            Ok(())
        })
        .unwrap();
        assert!(data.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_error_is_reported() {
        let err = run_striped(3, (0..50).collect(), |i: usize| {
            if i == 17 {
                Err(Error::SharedMemory("boom".to_string()))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert!(matches!(err, Error::SharedMemory(_)));
    }

    #[test]
    fn test_panic_is_reported() {
        let err = run_striped(2, vec![0, 1], |i: usize| {
            assert!(i != 1, "portion failed");
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::ThreadPanic(message) if message.contains("portion failed")));
    }

    #[test]
    fn test_no_portions() {
        run_striped(4, Vec::<usize>::new(), |_| Ok(())).unwrap();
    }
}
