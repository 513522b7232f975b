//! Loads a ruleset from disk and memoizes the compiled evaluator keyed by
//! the file's modification time, reparsing only when the mtime changes.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;

use crate::{CompiledEvaluator, PolicyError, Ruleset};

pub struct PolicyFile {
    path: PathBuf,
    cached: Option<(SystemTime, CompiledEvaluator)>,
}

impl PolicyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the compiled evaluator for the ruleset's current contents,
    /// reparsing only if the file's mtime has changed since the last call
    /// (or if this is the first call).
    pub fn current(&mut self) -> Result<&CompiledEvaluator, PolicyError> {
        let mtime = std::fs::metadata(&self.path)?.modified()?;

        let stale = match &self.cached {
            Some((cached_mtime, _)) => *cached_mtime != mtime,
            None => true,
        };

        if stale {
            debug!("reparsing policy file {} (mtime changed)", self.path.display());
            let text = std::fs::read_to_string(&self.path)?;
            let ruleset: Ruleset = toml::from_str(&text)?;
            self.cached = Some((mtime, CompiledEvaluator::new(ruleset)));
        }

        Ok(&self.cached.as_ref().expect("just populated above").1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_policy_testutil::write_temp_file;

    #[test]
    fn reparses_only_after_mtime_changes() {
        let (path, _guard) = write_temp_file("[[exec]]\npath = \"/bin/true\"\naction = \"deny\"\n");
        let mut policy = PolicyFile::new(&path);

        let action = policy
            .current()
            .unwrap()
            .evaluate(&crate::Probe::Exec { path: "/bin/true".into() });
        assert_eq!(action, crate::Action::Deny);

        // Second call with unchanged contents must not error and must keep
        // returning the same decision from the memoized evaluator.
        let action_again = policy
            .current()
            .unwrap()
            .evaluate(&crate::Probe::Exec { path: "/bin/true".into() });
        assert_eq!(action_again, crate::Action::Deny);
    }
}
