// SPDX-License-Identifier: Apache-2.0

//! Per-file ownership across delivery workers.
//!
//! Only one worker streams a given path at a time. A request for a path that
//! is already being streamed is parked with the owner, which runs it after
//! its current pass. Finished passes leave the byte position they reached,
//! so a later append can be read from there.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::receivers::dir::ReadFrom;

/// Finished positions kept before the oldest are forgotten.
const MAX_POSITIONS: usize = 4096;

#[derive(Default)]
struct ClaimState {
    /// Paths being streamed, with the request parked for the owner.
    active: HashMap<PathBuf, Option<ReadFrom>>,
    positions: HashMap<PathBuf, u64>,
    order: VecDeque<PathBuf>,
}

impl ClaimState {
    fn record(&mut self, path: &Path, position: u64) {
        if self.positions.insert(path.to_path_buf(), position).is_none() {
            self.order.push_back(path.to_path_buf());
        }
        while self.order.len() > MAX_POSITIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.positions.remove(&oldest);
            }
        }
    }
}

#[derive(Default)]
pub struct FileClaims {
    state: Mutex<ClaimState>,
}

impl FileClaims {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClaimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take ownership of `path`. Returns None when another worker owns it;
    /// `start` is then parked for that worker.
    pub fn claim(&self, path: &Path, start: ReadFrom) -> Option<Claim<'_>> {
        let mut state = self.state();
        match state.active.get_mut(path) {
            Some(parked) => {
                *parked = Some(merge(*parked, start));
                None
            }
            None => {
                state.active.insert(path.to_path_buf(), None);
                Some(Claim {
                    claims: self,
                    path: path.to_path_buf(),
                    released: false,
                })
            }
        }
    }

    /// Where the last finished pass over `path` stopped.
    pub fn position(&self, path: &Path) -> Option<u64> {
        self.state().positions.get(path).copied()
    }

    /// Drop the finished position of `path`, which now names a new file.
    pub fn forget(&self, path: &Path) {
        let mut state = self.state();
        if state.positions.remove(path).is_some() {
            state.order.retain(|p| p != path);
        }
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.state().active.contains_key(path)
    }
}

/// A request that arrives while the owner is mid-pass. A move-in replaces
/// the file and wins; anything else only needs the tail the owner has not
/// reached yet.
fn merge(parked: Option<ReadFrom>, start: ReadFrom) -> ReadFrom {
    match (parked, start) {
        (Some(ReadFrom::Beginning), _) | (_, ReadFrom::Beginning) => ReadFrom::Beginning,
        _ => ReadFrom::Continue,
    }
}

/// Ownership of one path. Dropping it releases the path and discards any
/// parked request.
pub struct Claim<'a> {
    claims: &'a FileClaims,
    path: PathBuf,
    released: bool,
}

impl Claim<'_> {
    /// Record the position a pass reached.
    pub fn finished_at(&self, position: u64) {
        self.claims.state().record(&self.path, position);
    }

    /// The request parked while the last pass ran. When there is none the
    /// path is released in the same step, so no request can be lost between
    /// the check and the release.
    pub fn next(&mut self) -> Option<ReadFrom> {
        let mut state = self.claims.state();
        let parked = state.active.get_mut(&self.path).and_then(Option::take);
        if parked.is_none() {
            state.active.remove(&self.path);
            self.released = true;
        }
        parked
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.claims.state().active.remove(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_parked_with_owner() {
        let claims = FileClaims::new();
        let path = Path::new("/spool/a.log");

        let mut owner = claims.claim(path, ReadFrom::Continue).unwrap();
        assert!(claims.claim(path, ReadFrom::Continue).is_none());
        assert!(claims.claim(path, ReadFrom::Offset(12)).is_none());

        assert_eq!(owner.next(), Some(ReadFrom::Continue));
        assert_eq!(owner.next(), None);
        assert!(!claims.is_active(path));
        assert!(claims.claim(path, ReadFrom::Continue).is_some());
    }

    #[test]
    fn test_move_in_wins_over_append() {
        let claims = FileClaims::new();
        let path = Path::new("/spool/a.log");

        let mut owner = claims.claim(path, ReadFrom::Continue).unwrap();
        assert!(claims.claim(path, ReadFrom::Beginning).is_none());
        assert!(claims.claim(path, ReadFrom::Continue).is_none());
        assert_eq!(owner.next(), Some(ReadFrom::Beginning));
    }

    #[test]
    fn test_other_paths_are_independent() {
        let claims = FileClaims::new();
        let _a = claims.claim(Path::new("/spool/a.log"), ReadFrom::Beginning).unwrap();
        assert!(
            claims
                .claim(Path::new("/spool/b.log"), ReadFrom::Beginning)
                .is_some()
        );
    }

    #[test]
    fn test_drop_releases_and_discards_parked_request() {
        let claims = FileClaims::new();
        let path = Path::new("/spool/a.log");
        {
            let _owner = claims.claim(path, ReadFrom::Beginning).unwrap();
            assert!(claims.claim(path, ReadFrom::Continue).is_none());
        }
        assert!(!claims.is_active(path));
        let mut owner = claims.claim(path, ReadFrom::Beginning).unwrap();
        assert_eq!(owner.next(), None);
    }

    #[test]
    fn test_positions_are_bounded() {
        let claims = FileClaims::new();
        let first = Path::new("/spool/0.log");
        claims.claim(first, ReadFrom::Beginning).unwrap().finished_at(10);
        assert_eq!(claims.position(first), Some(10));

        for i in 1..=MAX_POSITIONS {
            let path = PathBuf::from(format!("/spool/{}.log", i));
            claims.claim(&path, ReadFrom::Beginning).unwrap().finished_at(1);
        }
        assert_eq!(claims.position(first), None);
        assert_eq!(claims.position(Path::new("/spool/1.log")), Some(1));

        claims.forget(Path::new("/spool/1.log"));
        assert_eq!(claims.position(Path::new("/spool/1.log")), None);
    }
}
