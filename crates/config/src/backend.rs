use serde::{Deserialize, Serialize};

/// The mechanism used to observe writes to watched regions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// Kernel write-protect faults delivered through `userfaultfd(2)`.
    /// Requires Linux 5.7+ and either `vm.unprivileged_userfaultfd = 1` or
    /// `CAP_SYS_PTRACE`.
    #[default]
    #[serde(rename = "userfaultfd")]
    Userfaultfd,

    /// Faults are reported by the embedding adapter. Useful when the host
    /// language already intercepts assignments, and for tests.
    #[serde(rename = "manual")]
    Manual,
}
