use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Uninitialized,
    Creating,
    Created,
    Configuring,
    Configured,
    Starting,
    Started,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Failed,
    RollingBack,
}

impl NodeState {
    /// States a provider call is in flight for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Configuring | Self::Starting | Self::Stopping | Self::Deleting | Self::RollingBack
        )
    }

    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        if next == Failed {
            return self.is_transient();
        }
        matches!(
            (self, next),
            (Uninitialized | Deleted | Failed, Creating)
                | (Creating, Created)
                | (Created, Configuring)
                | (Configuring, Configured)
                | (Created | Configured | Stopped, Starting)
                | (Starting, Started)
                | (Started | Failed, Stopping)
                | (Stopping, Stopped)
                | (Created | Configured | Stopped | Failed, Deleting)
                | (Deleting, Deleted)
                | (Created | Configured | Started | Failed, RollingBack)
                | (RollingBack, Deleted)
        )
    }

    /// Whether the install step for `self` has already been carried out.
    pub fn reached(&self, target: NodeState) -> bool {
        self.install_rank()
            .zip(target.install_rank())
            .is_some_and(|(current, wanted)| current >= wanted)
    }

    fn install_rank(&self) -> Option<u8> {
        match self {
            Self::Created => Some(1),
            Self::Configured => Some(2),
            Self::Started => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Configuring => "configuring",
            Self::Configured => "configured",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: NodeState,
    pub to: NodeState,
}

#[cfg(test)]
mod tests {
    use super::NodeState::*;
    use super::*;

    #[test]
    fn test_install_path() {
        let path = [Uninitialized, Creating, Created, Configuring, Configured, Starting, Started];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_uninstall_path() {
        let path = [Started, Stopping, Stopped, Deleting, Deleted];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Created.can_transition_to(Deleting));
    }

    #[test]
    fn test_failed_only_from_transient_states() {
        for state in [Creating, Configuring, Starting, Stopping, Deleting, RollingBack] {
            assert!(state.can_transition_to(Failed));
        }
        for state in [Uninitialized, Created, Started, Stopped, Deleted, Failed] {
            assert!(!state.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_rollback_paths() {
        assert!(Failed.can_transition_to(RollingBack));
        assert!(Started.can_transition_to(RollingBack));
        assert!(RollingBack.can_transition_to(Deleted));
        assert!(!Uninitialized.can_transition_to(RollingBack));
        assert!(!Started.can_transition_to(Deleting));
    }

    #[test]
    fn test_reached() {
        assert!(Started.reached(Created));
        assert!(Configured.reached(Configured));
        assert!(!Created.reached(Started));
        assert!(!Failed.reached(Created));
    }
}
