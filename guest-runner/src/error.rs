//! `GuestError`: every fallible step in the guest-runner sequence (§4.4)
//! is tagged with the `Stage` it failed in, which is what `main` needs to
//! "name the failed stage precisely" in `error.json` — the Rust-native
//! rendering of the shell trap-on-exit handler from the original design.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Mounts,
    Network,
    NetworkChecks,
    WorkspaceExec,
    Evaluation,
    ResultWrite,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Mounts => "mounts",
            Stage::Network => "network",
            Stage::NetworkChecks => "network-checks",
            Stage::WorkspaceExec => "workspace-exec",
            Stage::Evaluation => "evaluation",
            Stage::ResultWrite => "result-write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("stage {stage} failed: {source}")]
pub struct GuestError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

impl GuestError {
    pub fn new(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}
