//! Instance name allocation for create requests.

use std::collections::HashSet;

use crate::error::EngineError;
use crate::model::InstanceRequest;

/// Tracks names already used by active instances of a project, including
/// names handed out earlier in the same request.
#[derive(Debug)]
pub(super) struct NameAllocator {
    project: String,
    taken: HashSet<String>,
    next_generated: u32,
}

impl NameAllocator {
    pub(super) fn new(project: &str, taken: impl IntoIterator<Item = String>) -> Self {
        Self {
            project: project.to_owned(),
            taken: taken.into_iter().collect(),
            next_generated: 1,
        }
    }

    /// Names for every copy of `request`.
    ///
    /// An explicit name is used as-is for a single copy and suffixed with
    /// `-1..=count` otherwise. Without a name, `<project>-<n>` is generated
    /// from the lowest free `n`.
    pub(super) fn allocate(&mut self, request: &InstanceRequest) -> Result<Vec<String>, EngineError> {
        let mut names = Vec::new();
        match request.name.as_deref().map(str::trim) {
            Some(base) if request.count == 1 => names.push(self.claim(base.to_owned())?),
            Some(base) => {
                for index in 1..=request.count {
                    names.push(self.claim(format!("{base}-{index}"))?);
                }
            }
            None => {
                for _ in 0..request.count {
                    let name = self.generate();
                    names.push(self.claim(name)?);
                }
            }
        }
        Ok(names)
    }

    fn claim(&mut self, name: String) -> Result<String, EngineError> {
        if !self.taken.insert(name.clone()) {
            return Err(EngineError::Conflict(format!(
                "instance name '{name}' is already in use in project {}",
                self.project
            )));
        }
        Ok(name)
    }

    fn generate(&mut self) -> String {
        loop {
            let candidate = format!("{}-{}", self.project, self.next_generated);
            self.next_generated = self.next_generated.saturating_add(1);
            if !self.taken.contains(&candidate) {
                return candidate;
            }
        }
    }
}
