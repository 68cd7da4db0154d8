// SPDX-License-Identifier: Apache-2.0

use crate::types::View;

/// Per-instance state tracked while an instance is within the tail window: the
/// prepared batch, the fast-commit bitmap every replica's promise fills in, and
/// whether a full (certified) commit has already been observed.
pub(crate) struct InstanceState {
    pub(crate) view: View,
    pub(crate) batch: Vec<u8>,
    fast_commits: Vec<bool>,
    nb_fast_commits: usize,
    pub(crate) full_commit: bool,
    pub(crate) decided: bool,
}

impl InstanceState {
    pub(crate) fn new(view: View, batch: Vec<u8>, nb_replicas: usize) -> Self {
        Self {
            view,
            batch,
            fast_commits: vec![false; nb_replicas],
            nb_fast_commits: 0,
            full_commit: false,
            decided: false,
        }
    }

    pub(crate) fn set_fast_commit(&mut self, replica_index: usize) {
        if let Some(slot) = self.fast_commits.get_mut(replica_index) {
            if !*slot {
                *slot = true;
                self.nb_fast_commits += 1;
            }
        }
    }

    pub(crate) fn nb_fast_commits(&self) -> usize {
        self.nb_fast_commits
    }

    pub(crate) fn mark_full_commit(&mut self) {
        self.full_commit = true;
    }

    pub(crate) fn ready(&self, nb_replicas: usize) -> bool {
        self.full_commit || self.nb_fast_commits >= nb_replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_commit_counts_each_replica_once() {
        let mut state = InstanceState::new(0, b"x".to_vec(), 3);
        state.set_fast_commit(0);
        state.set_fast_commit(0);
        state.set_fast_commit(1);
        assert_eq!(state.nb_fast_commits(), 2);
        assert!(!state.ready(3));
        state.set_fast_commit(2);
        assert!(state.ready(3));
    }

    #[test]
    fn full_commit_is_ready_regardless_of_fast_commit_count() {
        let mut state = InstanceState::new(0, b"x".to_vec(), 3);
        state.mark_full_commit();
        assert!(state.ready(3));
    }
}
