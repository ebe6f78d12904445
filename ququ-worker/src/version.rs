//! Version information and build metadata display

use std::fmt;

use ququ_engine::ModelKind;

use crate::config::ModelsConfig;

/// Build metadata for the worker binary
pub struct VersionInfo {
    /// Package version from Cargo.toml
    pub worker_version: &'static str,
    /// Target triple (e.g., x86_64-unknown-linux-gnu)
    pub target: &'static str,
    /// Build profile (debug or release)
    pub profile: &'static str,
    /// Git commit hash (if available)
    pub git_commit: Option<&'static str>,
    pub build_timestamp: &'static str,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            worker_version: env!("CARGO_PKG_VERSION"),
            target: env!("TARGET"),
            profile: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
            git_commit: option_env!("GIT_COMMIT_HASH"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
        }
    }

    /// Render the build block followed by the configured model repositories
    pub fn describe(&self, models: &ModelsConfig) -> String {
        let mut out = self.to_string();
        out.push('\n');
        out.push_str("Models:\n");
        for kind in ModelKind::ALL {
            let source = models.source(kind);
            out.push_str(&format!(
                "  • {:<5} {} ({})\n",
                kind.as_str(),
                source.identifier,
                source.revision
            ));
        }
        out
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ququ-worker {}", self.worker_version)?;
        writeln!(f)?;

        writeln!(f, "Build Information:")?;
        writeln!(f, "  Target:       {}", self.target)?;
        writeln!(f, "  Profile:      {}", self.profile)?;
        writeln!(f, "  Build Date:   {}", self.build_timestamp)?;

        if let Some(commit) = self.git_commit {
            writeln!(f, "  Git Commit:   {}", commit)?;
        }

        Ok(())
    }
}

/// Short version string (for --version)
pub fn version_short() -> String {
    format!("ququ-worker {}", env!("CARGO_PKG_VERSION"))
}
