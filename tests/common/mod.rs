use std::sync::Arc;

use adcomm::{AdComm, LocalComm};

/// Run `f` once per rank, each rank on its own thread with its own endpoint.
pub fn run_ranks<F>(size: usize, f: F)
where
    F: Fn(AdComm<LocalComm>) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = LocalComm::ring(size)
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            std::thread::spawn(move || f(AdComm::new(comm)))
        })
        .collect();
    for h in handles {
        h.join().expect("rank thread panicked");
    }
}
