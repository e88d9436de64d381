//! LS handler role states and the prepare / commit-or-rollback transition
//! machinery.

use crate::utils::DuplicaError;

/// The handler's current role on its log stream.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RoleState {
    /// Constructed but not brought online yet.
    Uninit,

    /// Serving as a follower replica.
    Follower,

    /// Serving as the leader replica.
    Leader,

    /// A prepared transition is applying its side effects; every other
    /// role-dependent operation must back off until commit or rollback.
    TransitionInProgress,
}

/// A prepared transition, capturing what to restore on rollback. Obtained
/// from `RoleCtx::prepare` and consumed by exactly one of `commit` /
/// `restore`, so control flow never depends on out-parameter mutation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[must_use]
pub(crate) struct RoleTransition {
    pub(crate) from: RoleState,
    pub(crate) target: RoleState,
}

/// The role state machine itself. All transitions are linearized by the
/// handler's transition lock; this type only enforces legality.
pub(crate) struct RoleCtx {
    state: RoleState,
}

impl RoleCtx {
    pub(crate) fn new() -> Self {
        RoleCtx {
            state: RoleState::Uninit,
        }
    }

    pub(crate) fn current(&self) -> RoleState {
        self.state
    }

    /// Validates and begins a transition towards `target`. Returns
    /// `Ok(None)` if already at the target (a successful no-op), else
    /// `Ok(Some(transition))` with the state now `TransitionInProgress`.
    pub(crate) fn prepare(
        &mut self,
        target: RoleState,
    ) -> Result<Option<RoleTransition>, DuplicaError> {
        if target == RoleState::TransitionInProgress {
            return Err(DuplicaError::InvalidArgument(
                "cannot target TransitionInProgress".into(),
            ));
        }
        if self.state == target {
            return Ok(None);
        }
        if self.state == RoleState::TransitionInProgress {
            return Err(DuplicaError::Offline);
        }

        let legal = matches!(
            (self.state, target),
            (RoleState::Uninit, RoleState::Follower)
                | (RoleState::Uninit, RoleState::Leader)
                | (RoleState::Follower, RoleState::Leader)
                | (RoleState::Leader, RoleState::Follower)
                | (RoleState::Follower, RoleState::Uninit)
                | (RoleState::Leader, RoleState::Uninit)
        );
        if !legal {
            return Err(DuplicaError::InvalidArgument(format!(
                "illegal role transition {:?} -> {:?}",
                self.state, target
            )));
        }

        let transition = RoleTransition {
            from: self.state,
            target,
        };
        self.state = RoleState::TransitionInProgress;
        Ok(Some(transition))
    }

    /// Commits a prepared transition; returns (old, new).
    pub(crate) fn commit(
        &mut self,
        transition: RoleTransition,
    ) -> (RoleState, RoleState) {
        self.state = transition.target;
        (transition.from, transition.target)
    }

    /// Rolls a prepared transition back; returns (attempted target, restored).
    pub(crate) fn restore(
        &mut self,
        transition: RoleTransition,
    ) -> (RoleState, RoleState) {
        self.state = transition.from;
        (transition.target, transition.from)
    }
}
