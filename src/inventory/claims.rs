// Device claim registry.
//
// While a plan executes, its target devices are claimed here so that a
// concurrent inventory scan never reports them as free. Claims are released
// when the guard drops, including on the error path.

use lazy_static::lazy_static;
use std::collections::HashSet;
use std::sync::Mutex;

lazy_static! {
    static ref CLAIMS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// RAII guard over a set of claimed device paths.
#[derive(Debug)]
pub struct ClaimGuard {
    paths: Vec<String>,
}

/// Claim every path atomically. Returns `None` when any path is already
/// held by another running plan; nothing is claimed in that case.
pub fn claim(paths: &[String]) -> Option<ClaimGuard> {
    let mut claims = CLAIMS.lock().expect("claim registry poisoned");

    if paths.iter().any(|p| claims.contains(p)) {
        return None;
    }

    for p in paths {
        claims.insert(p.clone());
    }

    Some(ClaimGuard {
        paths: paths.to_vec(),
    })
}

/// Whether a device is currently held by an executing plan.
pub fn is_claimed(path: &str) -> bool {
    CLAIMS
        .lock()
        .expect("claim registry poisoned")
        .contains(path)
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut claims = CLAIMS.lock().expect("claim registry poisoned");
        for p in &self.paths {
            claims.remove(p);
        }
    }
}
